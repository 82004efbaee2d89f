pub mod error;
pub mod params;
pub mod dispatch;
pub mod pipeline;
pub mod plugin;

pub mod cpu {
    pub mod kernels;
    pub mod particles;
    pub mod grid;
    pub mod boundary;
    pub mod passes;
}

pub mod gpu {
    pub mod ffi;
}

pub use error::{FluidError, Result};
pub use params::{CellSizing, FluidSettings, SimParams};
pub use pipeline::{FluidPipeline, Stage};
pub use plugin::{FluidSimPlugin, FluidSolver, ResetFluid};
