//! Tunable fluid settings and the per-step parameter block.
//!
//! `FluidSettings` is the long-lived, mutable configuration (a bevy resource,
//! loadable from RON). `SimParams` is the immutable snapshot the pipeline
//! captures by value for a single step; editing the settings between steps
//! only affects the next snapshot.

use std::fs;
use std::path::Path;

use bevy::prelude::Resource;
use glam::{UVec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::cpu::particles::SpawnBlock;
use crate::error::{FluidError, Result};
use crate::gpu::ffi::GPUSimParams;

/// Largest pool the grid can index; `u32::MAX` is the list sentinel.
pub const MAX_PARTICLES: usize = (u32::MAX - 1) as usize;

/// How the grid cell size is derived.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum CellSizing {
    /// cell = scale * H
    Radius { scale: f32 },
    /// cell = longest wall extent / n
    Divisions(u32),
}

impl CellSizing {
    pub fn cell_size(&self, h: f32, wall_min: Vec3, wall_max: Vec3) -> f32 {
        match *self {
            CellSizing::Radius { scale } => h * scale,
            CellSizing::Divisions(n) => (wall_max - wall_min).max_element() / n.max(1) as f32,
        }
    }
}

impl Default for CellSizing {
    fn default() -> Self {
        CellSizing::Radius { scale: 1.0 }
    }
}

#[derive(Resource, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FluidSettings {
    pub particle_count: usize,
    pub gravity: f32,
    pub smoothing_radius: f32, // H
    pub particle_mass: f32,
    pub viscosity: f32,
    pub rest_density: f32,
    pub stiffness: f32,
    pub near_stiffness: f32,
    /// upper bound on a single step's dt
    pub max_timestep: f32,
    /// steps per frame
    pub iterations: u32,
    pub wall_min: Vec3,
    pub wall_max: Vec3,
    /// fraction of the normal velocity kept after hitting a wall
    pub wall_damping: f32,
    pub cell_sizing: CellSizing,
    pub spawn: SpawnBlock,
    /// workers per dispatch batch
    pub batch_size: usize,
    /// None lets rayon pick
    pub worker_threads: Option<usize>,
}

impl Default for FluidSettings {
    fn default() -> Self {
        Self {
            particle_count: 20_000,
            gravity: -9.81,
            smoothing_radius: 0.16,
            particle_mass: 0.5,
            viscosity: 20.0,
            rest_density: 300.0,
            stiffness: 100.0,
            near_stiffness: 10.0,
            max_timestep: 0.006,
            iterations: 1,
            wall_min: Vec3::new(-2.0, 0.0, -2.0),
            wall_max: Vec3::new(2.0, 4.0, 2.0),
            wall_damping: 0.5,
            cell_sizing: CellSizing::default(),
            spawn: SpawnBlock {
                origin: Vec3::new(0.0, 0.2, 0.0),
                spacing: 0.1,
                footprint: UVec2::new(14, 14),
                jitter: 0.002,
                seed: 0x5eed,
            },
            batch_size: 256,
            worker_threads: None,
        }
    }
}

impl FluidSettings {
    pub fn from_ron_str(text: &str) -> Result<Self> {
        let settings: Self = ron::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_ron_str(&fs::read_to_string(path)?)
    }

    pub fn to_ron_string(&self) -> Result<String> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_ron_string()?)?;
        Ok(())
    }

    /// Moves the x walls to `-half_width..half_width`.
    pub fn set_box_half_width(&mut self, half_width: f32) {
        self.wall_min.x = -half_width;
        self.wall_max.x = half_width;
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_sizing
            .cell_size(self.smoothing_radius, self.wall_min, self.wall_max)
    }

    /// Substep length for a frame of `frame_dt` seconds, capped by `max_timestep`.
    /// Non-finite or negative frame times give zero.
    pub fn substep(&self, frame_dt: f32) -> f32 {
        if !frame_dt.is_finite() || frame_dt <= 0.0 {
            return 0.0;
        }
        (frame_dt / self.iterations.max(1) as f32).min(self.max_timestep)
    }

    /// Fail-fast checks; nothing here is clamped silently.
    pub fn validate(&self) -> Result<()> {
        if self.particle_count == 0 || self.particle_count > MAX_PARTICLES {
            return Err(FluidError::ParticleCount {
                count: self.particle_count,
                max: MAX_PARTICLES,
            });
        }
        if self.iterations == 0 {
            return Err(FluidError::parameter("iterations", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(FluidError::parameter("batch_size", "must be at least 1"));
        }
        if self.worker_threads == Some(0) {
            return Err(FluidError::parameter("worker_threads", "must be at least 1"));
        }
        if !(self.max_timestep.is_finite() && self.max_timestep > 0.0) {
            return Err(FluidError::parameter(
                "max_timestep",
                format!("must be positive, got {}", self.max_timestep),
            ));
        }
        if let CellSizing::Divisions(0) = self.cell_sizing {
            return Err(FluidError::parameter("cell_sizing", "zero divisions"));
        }
        self.spawn.validate()?;
        self.snapshot(0.0).validate()
    }

    /// Captures the current settings as a parameter block for one step.
    pub fn snapshot(&self, delta_time: f32) -> SimParams {
        SimParams {
            delta_time,
            gravity: self.gravity,
            stiffness: self.stiffness,
            near_stiffness: self.near_stiffness,
            rest_density: self.rest_density,
            viscosity: self.viscosity,
            smoothing_radius: self.smoothing_radius,
            particle_mass: self.particle_mass,
            particle_count: self.particle_count as u32,
            wall_min: self.wall_min,
            wall_max: self.wall_max,
            wall_damping: self.wall_damping,
            cell_size: self.cell_size(),
        }
    }
}

/// Physics constants and domain bounds for exactly one step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimParams {
    pub delta_time: f32,
    pub gravity: f32,
    pub stiffness: f32,
    pub near_stiffness: f32,
    pub rest_density: f32,
    pub viscosity: f32,
    pub smoothing_radius: f32,
    pub particle_mass: f32,
    pub particle_count: u32,
    pub wall_min: Vec3,
    pub wall_max: Vec3,
    pub wall_damping: f32,
    pub cell_size: f32,
}

impl SimParams {
    pub fn validate(&self) -> Result<()> {
        for (axis, min, max) in [
            ('x', self.wall_min.x, self.wall_max.x),
            ('y', self.wall_min.y, self.wall_max.y),
            ('z', self.wall_min.z, self.wall_max.z),
        ] {
            // written so that NaN bounds fail too
            if !(min.is_finite() && max.is_finite() && min < max) {
                return Err(FluidError::InvalidBounds { axis, min, max });
            }
        }
        let h = self.smoothing_radius;
        if !(h.is_finite() && h > 0.0) {
            return Err(FluidError::SmoothingRadius(h));
        }
        if self.particle_count == 0 {
            return Err(FluidError::ParticleCount {
                count: 0,
                max: MAX_PARTICLES,
            });
        }
        if !(self.particle_mass.is_finite() && self.particle_mass > 0.0) {
            return Err(FluidError::parameter(
                "particle_mass",
                format!("must be positive, got {}", self.particle_mass),
            ));
        }
        if !(0.0..1.0).contains(&self.wall_damping) {
            return Err(FluidError::parameter(
                "wall_damping",
                format!("must be in [0, 1), got {}", self.wall_damping),
            ));
        }
        if !(self.delta_time.is_finite() && self.delta_time >= 0.0) {
            return Err(FluidError::parameter(
                "delta_time",
                format!("must be finite and non-negative, got {}", self.delta_time),
            ));
        }
        for (name, value) in [
            ("stiffness", self.stiffness),
            ("near_stiffness", self.near_stiffness),
            ("viscosity", self.viscosity),
            ("rest_density", self.rest_density),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(FluidError::parameter(
                    name,
                    format!("must be finite and non-negative, got {value}"),
                ));
            }
        }
        if !self.gravity.is_finite() {
            return Err(FluidError::parameter("gravity", "must be finite"));
        }
        if !(self.cell_size.is_finite() && self.cell_size >= h) {
            return Err(FluidError::parameter(
                "cell_size",
                format!(
                    "cell size {} is below the smoothing radius {h}, the 27-cell scan would miss neighbors",
                    self.cell_size
                ),
            ));
        }
        Ok(())
    }

    pub fn to_gpu(&self, grid_dims: glam::UVec3) -> GPUSimParams {
        GPUSimParams {
            delta_time: self.delta_time,
            gravity: self.gravity,
            stiffness: self.stiffness,
            near_stiffness: self.near_stiffness,
            wall_min: self.wall_min.to_array(),
            rest_density: self.rest_density,
            wall_max: self.wall_max.to_array(),
            viscosity: self.viscosity,
            grid_dim: grid_dims.to_array(),
            particle_count: self.particle_count,
            smoothing_radius: self.smoothing_radius,
            particle_mass: self.particle_mass,
            cell_size: self.cell_size,
            wall_damping: self.wall_damping,
        }
    }
}
