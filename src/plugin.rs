use bevy::prelude::*;

use crate::dispatch::RayonDispatch;
use crate::params::FluidSettings;
use crate::pipeline::FluidPipeline;

// ==================== resources / events =============================

#[derive(Resource)]
pub struct FluidSolver(pub FluidPipeline<RayonDispatch>);

/// Re-spawns every particle from `FluidSettings::spawn`.
#[derive(Event, Debug, Clone, Copy, Default)]
pub struct ResetFluid;

// =====================================================================

// ========================== systems ==================================

// Startup: settings are validated here, bad ones leave the app without a solver
fn init_fluid_solver(mut commands: Commands, settings: Res<FluidSettings>) {
    match FluidPipeline::from_settings(&settings) {
        Ok(pipeline) => commands.insert_resource(FluidSolver(pipeline)),
        Err(err) => error!("fluid solver not created: {err}"),
    }
}

// Update

fn reset_fluid(
    mut events: EventReader<ResetFluid>,
    settings: Res<FluidSettings>,
    solver: Option<ResMut<FluidSolver>>,
) {
    let Some(mut solver) = solver else {
        return;
    };
    if events.read().last().is_none() {
        return;
    }
    if let Err(err) = solver.0.reset(&mut settings.spawn.clone()) {
        warn!("fluid reset failed: {err}");
    }
}

fn step_fluid(
    time: Res<Time>,
    settings: Res<FluidSettings>,
    solver: Option<ResMut<FluidSolver>>,
) {
    let Some(mut solver) = solver else {
        return;
    };
    // a failed frame keeps last frame's particles for presentation
    if let Err(err) = solver.0.advance(&settings, time.delta_secs()) {
        warn!("fluid step skipped: {err}");
    }
}

// =====================================================================

pub struct FluidSimPlugin;

impl Plugin for FluidSimPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<FluidSettings>()
            .add_event::<ResetFluid>()
            .add_systems(Startup, init_fluid_solver)
            .add_systems(Update, (reset_fluid, step_fluid).chain());
    }
}
