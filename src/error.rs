use std::collections::TryReserveError;

use thiserror::Error;

use crate::pipeline::Stage;

pub type Result<T> = std::result::Result<T, FluidError>;

#[derive(Error, Debug)]
pub enum FluidError {
    // configuration, rejected before anything is allocated or stepped
    #[error("invalid domain bounds on the {axis} axis: wall_min {min} must be below wall_max {max}")]
    InvalidBounds { axis: char, min: f32, max: f32 },

    #[error("smoothing radius must be positive and finite, got {0}")]
    SmoothingRadius(f32),

    #[error("particle count must be within 1..={max}, got {count}")]
    ParticleCount { count: usize, max: usize },

    #[error("invalid parameter `{name}`: {reason}")]
    Parameter { name: &'static str, reason: String },

    // resource exhaustion
    #[error("failed to allocate the {buffer} buffer ({len} elements)")]
    Allocation {
        buffer: &'static str,
        len: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("{stage:?} needs {batches} batches but the dispatcher allows {limit}")]
    DispatchLimit {
        stage: Stage,
        batches: usize,
        limit: usize,
    },

    #[error("{stage:?} dispatch failed: {reason}")]
    Dispatch { stage: Stage, reason: String },

    #[error("failed to build the worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("a step is already in flight (stage {0:?})")]
    StepInFlight(Stage),

    // settings files
    #[error("failed to parse fluid settings")]
    Settings(#[from] ron::error::SpannedError),

    #[error("failed to serialize fluid settings")]
    Serialize(#[from] ron::Error),

    #[error("failed to access the settings file")]
    Io(#[from] std::io::Error),
}

impl FluidError {
    pub fn parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::Parameter {
            name,
            reason: reason.into(),
        }
    }
}
