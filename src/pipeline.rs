//! Step orchestration.
//!
//! A step walks the stage machine
//! `Idle -> ClearGrid -> BuildGrid -> Density -> Force -> Integrate -> Idle`,
//! issuing one dispatch per stage and a barrier after each. Every dispatch is
//! checked against the dispatcher's limits before the first stage runs, so a
//! step that cannot be issued in full is not issued at all.

use bevy::log::{debug, info};
use glam::Vec3;

use crate::cpu::boundary::WallBox;
use crate::cpu::grid::{GridLayout, SpatialGrid};
use crate::cpu::kernels::Kernels;
use crate::cpu::particles::{ParticleGenerator, ParticleStore};
use crate::cpu::passes;
use crate::dispatch::{Dispatch, RayonDispatch};
use crate::error::{FluidError, Result};
use crate::gpu::ffi::GPUSimParams;
use crate::params::{FluidSettings, SimParams};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Stage {
    #[default]
    Idle,
    ClearGrid,
    BuildGrid,
    Density,
    Force,
    Integrate,
}

impl Stage {
    /// The five compute passes of a step, in issue order.
    pub const PASSES: [Stage; 5] = [
        Stage::ClearGrid,
        Stage::BuildGrid,
        Stage::Density,
        Stage::Force,
        Stage::Integrate,
    ];

    pub fn next(self) -> Stage {
        match self {
            Stage::Idle => Stage::ClearGrid,
            Stage::ClearGrid => Stage::BuildGrid,
            Stage::BuildGrid => Stage::Density,
            Stage::Density => Stage::Force,
            Stage::Force => Stage::Integrate,
            Stage::Integrate => Stage::Idle,
        }
    }
}

pub struct FluidPipeline<D: Dispatch = RayonDispatch> {
    dispatch: D,
    store: ParticleStore,
    grid: SpatialGrid,
    params: SimParams,
    kernels: Kernels,
    stage: Stage,
    steps: u64,
}

impl FluidPipeline<RayonDispatch> {
    /// Pipeline on a rayon pool configured from `settings`, populated from `settings.spawn`.
    pub fn from_settings(settings: &FluidSettings) -> Result<Self> {
        settings.validate()?;
        let dispatch = RayonDispatch::new(settings.worker_threads, settings.batch_size)?;
        Self::new(settings, &mut settings.spawn.clone(), dispatch)
    }
}

impl<D: Dispatch> FluidPipeline<D> {
    pub fn new(
        settings: &FluidSettings,
        generator: &mut impl ParticleGenerator,
        dispatch: D,
    ) -> Result<Self> {
        settings.validate()?;
        let params = settings.snapshot(0.0);
        let layout = GridLayout::new(params.wall_min, params.wall_max, params.cell_size)?;
        let mut store = ParticleStore::new(settings.particle_count)?;
        store.populate(generator)?;
        let grid = SpatialGrid::new(layout, settings.particle_count)?;

        info!(
            "fluid pipeline ready: {} particles, grid {}x{}x{} ({} cells of {})",
            store.len(),
            layout.dims.x,
            layout.dims.y,
            layout.dims.z,
            layout.cell_count(),
            layout.cell_size,
        );

        Ok(Self {
            dispatch,
            store,
            grid,
            kernels: Kernels::new(params.smoothing_radius),
            params,
            stage: Stage::Idle,
            steps: 0,
        })
    }

    pub fn store(&self) -> &ParticleStore {
        &self.store
    }

    /// Host-side access between steps (e.g. interactive kicks).
    pub fn store_mut(&mut self) -> &mut ParticleStore {
        &mut self.store
    }

    pub fn positions(&self) -> impl ExactSizeIterator<Item = Vec3> + '_ {
        self.store.positions()
    }

    pub fn grid(&self) -> &SpatialGrid {
        &self.grid
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Completed steps since construction or the last reset.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatch
    }

    pub fn gpu_params(&self) -> GPUSimParams {
        self.params.to_gpu(self.grid.layout().dims)
    }

    /// Makes `params` the block the next step runs with. Invalid blocks are
    /// rejected and the previous one stays in place. A changed cell size or
    /// wall box re-derives the grid layout.
    pub fn upload(&mut self, params: SimParams) -> Result<()> {
        params.validate()?;
        if params.particle_count as usize != self.store.len() {
            return Err(FluidError::parameter(
                "particle_count",
                format!(
                    "the pool holds {} particles, the block says {}",
                    self.store.len(),
                    params.particle_count
                ),
            ));
        }
        let layout = GridLayout::new(params.wall_min, params.wall_max, params.cell_size)?;
        if layout != *self.grid.layout() {
            self.grid.relayout(layout)?;
            debug!(
                "grid re-laid out to {}x{}x{}",
                layout.dims.x, layout.dims.y, layout.dims.z
            );
        }
        if params.smoothing_radius != self.kernels.radius() {
            self.kernels = Kernels::new(params.smoothing_radius);
        }
        self.params = params;
        Ok(())
    }

    /// Runs one full step with the uploaded parameter block.
    ///
    /// On error no further stage is issued and positions and velocities keep
    /// their pre-step values; only derived fields (density, force) may have
    /// been rewritten.
    pub fn step(&mut self) -> Result<()> {
        if self.stage != Stage::Idle {
            return Err(FluidError::StepInFlight(self.stage));
        }
        self.preflight()?;

        let params = self.params;
        let result = self.run_stages(&params);
        self.stage = Stage::Idle;
        result?;

        self.steps += 1;
        debug!("fluid step {} done (dt {})", self.steps, params.delta_time);
        Ok(())
    }

    /// Snapshots `settings`, uploads it and runs `settings.iterations` steps
    /// for a frame of `frame_dt` seconds. Returns how many steps ran.
    pub fn advance(&mut self, settings: &FluidSettings, frame_dt: f32) -> Result<u32> {
        let dt = settings.substep(frame_dt);
        if dt <= 0.0 {
            return Ok(0);
        }
        self.upload(settings.snapshot(dt))?;
        let iterations = settings.iterations.max(1);
        for _ in 0..iterations {
            self.step()?;
        }
        Ok(iterations)
    }

    /// Re-populates the whole pool from `generator` and returns to `Idle`.
    pub fn reset(&mut self, generator: &mut impl ParticleGenerator) -> Result<()> {
        self.store.populate(generator)?;
        self.stage = Stage::Idle;
        self.steps = 0;
        Ok(())
    }

    fn workers(&self, stage: Stage) -> usize {
        match stage {
            Stage::Idle => 0,
            Stage::ClearGrid => self.grid.cell_count(),
            _ => self.store.len(),
        }
    }

    fn preflight(&self) -> Result<()> {
        let limit = self.dispatch.max_batches();
        for stage in Stage::PASSES {
            let batches = self.dispatch.batches(self.workers(stage));
            if batches > limit {
                return Err(FluidError::DispatchLimit {
                    stage,
                    batches,
                    limit,
                });
            }
        }
        Ok(())
    }

    fn run_stages(&mut self, params: &SimParams) -> Result<()> {
        let mut stage = Stage::Idle.next();
        while stage != Stage::Idle {
            self.stage = stage;
            self.run_stage(stage, params)?;
            self.dispatch.barrier();
            stage = stage.next();
        }
        Ok(())
    }

    fn run_stage(&mut self, stage: Stage, params: &SimParams) -> Result<()> {
        let workers = self.workers(stage);
        let Self {
            dispatch,
            store,
            grid,
            kernels,
            ..
        } = self;
        let grid = &*grid;
        let kernels = &*kernels;

        match stage {
            Stage::Idle => Ok(()),
            Stage::ClearGrid => dispatch.dispatch(stage, workers, |cell| grid.clear_cell(cell)),
            Stage::BuildGrid => {
                let kinematics = &store.kinematics;
                dispatch.dispatch(stage, workers, |i| grid.insert(i, kinematics[i].position))
            }
            Stage::Density => {
                let kinematics = &store.kinematics;
                dispatch.dispatch_slots(stage, &mut store.densities, |i, out| {
                    *out = passes::density_at(i, kinematics, grid, kernels, params);
                })
            }
            Stage::Force => {
                let kinematics = &store.kinematics;
                let densities = &store.densities;
                dispatch.dispatch_slots(stage, &mut store.forces, |i, out| {
                    *out = passes::forces_at(i, kinematics, densities, grid, kernels, params);
                })
            }
            Stage::Integrate => {
                let forces = &store.forces;
                let walls = WallBox::from_params(params);
                dispatch.dispatch_slots(stage, &mut store.kinematics, |i, k| {
                    passes::integrate(k, forces[i].force, &walls, params);
                })
            }
        }
    }
}
