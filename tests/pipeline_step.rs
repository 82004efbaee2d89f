use std::sync::Mutex;

use bevy_sph_fluid::cpu::boundary::WallBox;
use bevy_sph_fluid::cpu::kernels::Kernels;
use bevy_sph_fluid::cpu::particles::{Kinematics, SpawnBlock, from_fn};
use bevy_sph_fluid::dispatch::{Dispatch, RayonDispatch, SerialDispatch};
use bevy_sph_fluid::gpu::ffi::GPUParticle;
use bevy_sph_fluid::{FluidError, FluidPipeline, FluidSettings, Result, Stage};
use glam::{UVec2, Vec3};
use rand::{Rng, SeedableRng, rngs::StdRng};

// unit box, spawned in layers of 8x8
fn tank(count: usize) -> FluidSettings {
    FluidSettings {
        particle_count: count,
        smoothing_radius: 0.1,
        particle_mass: 0.02,
        wall_min: Vec3::ZERO,
        wall_max: Vec3::ONE,
        spawn: SpawnBlock {
            origin: Vec3::splat(0.2),
            spacing: 0.05,
            footprint: UVec2::new(8, 8),
            jitter: 0.001,
            seed: 9,
        },
        batch_size: 32,
        worker_threads: Some(2),
        ..FluidSettings::default()
    }
}

fn serial(settings: &FluidSettings) -> FluidPipeline<SerialDispatch> {
    let dispatch = SerialDispatch {
        batch_size: settings.batch_size,
    };
    FluidPipeline::new(settings, &mut settings.spawn.clone(), dispatch).unwrap()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Call {
    Issue(Stage),
    Barrier,
}

/// Serial backend that logs every dispatch and barrier.
#[derive(Default)]
struct Recording {
    inner: SerialDispatch,
    limit: Option<usize>,
    calls: Mutex<Vec<Call>>,
}

impl Recording {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl Dispatch for Recording {
    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    fn max_batches(&self) -> usize {
        self.limit.unwrap_or(usize::MAX)
    }

    fn dispatch<F>(&self, stage: Stage, workers: usize, kernel: F) -> Result<()>
    where
        F: Fn(usize) + Send + Sync,
    {
        self.calls.lock().unwrap().push(Call::Issue(stage));
        self.inner.dispatch(stage, workers, kernel)
    }

    fn dispatch_slots<T, F>(&self, stage: Stage, slots: &mut [T], kernel: F) -> Result<()>
    where
        T: Send,
        F: Fn(usize, &mut T) + Send + Sync,
    {
        self.calls.lock().unwrap().push(Call::Issue(stage));
        self.inner.dispatch_slots(stage, slots, kernel)
    }

    fn barrier(&self) {
        self.calls.lock().unwrap().push(Call::Barrier);
    }
}

/// Backend whose dispatch of one stage fails.
struct FailAt(Stage);

impl FailAt {
    fn check(&self, stage: Stage) -> Result<()> {
        if stage == self.0 {
            return Err(FluidError::Dispatch {
                stage,
                reason: "device lost".into(),
            });
        }
        Ok(())
    }
}

impl Dispatch for FailAt {
    fn batch_size(&self) -> usize {
        64
    }

    fn dispatch<F>(&self, stage: Stage, workers: usize, kernel: F) -> Result<()>
    where
        F: Fn(usize) + Send + Sync,
    {
        self.check(stage)?;
        SerialDispatch::default().dispatch(stage, workers, kernel)
    }

    fn dispatch_slots<T, F>(&self, stage: Stage, slots: &mut [T], kernel: F) -> Result<()>
    where
        T: Send,
        F: Fn(usize, &mut T) + Send + Sync,
    {
        self.check(stage)?;
        SerialDispatch::default().dispatch_slots(stage, slots, kernel)
    }

    fn barrier(&self) {}
}

fn scramble(pipeline: &mut FluidPipeline<impl Dispatch>, spread: f32, speed: f32, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = pipeline.store().len();
    let range = -spread..1.0 + spread;
    let positions: Vec<Vec3> = (0..n)
        .map(|_| {
            Vec3::new(
                rng.gen_range(range.clone()),
                rng.gen_range(range.clone()),
                rng.gen_range(range.clone()),
            )
        })
        .collect();
    pipeline.reset(&mut from_fn(|i| positions[i])).unwrap();
    if speed <= 0.0 {
        return;
    }
    for i in 0..n {
        let v = Vec3::new(
            rng.gen_range(-speed..speed),
            rng.gen_range(-speed..speed),
            rng.gen_range(-speed..speed),
        );
        pipeline.store_mut().set_velocity(i, v);
    }
}

#[test]
fn stages_run_in_order_with_a_barrier_after_each() {
    let settings = tank(64);
    let mut pipeline =
        FluidPipeline::new(&settings, &mut settings.spawn.clone(), Recording::default()).unwrap();
    pipeline.upload(settings.snapshot(0.004)).unwrap();
    pipeline.step().unwrap();
    pipeline.step().unwrap();

    let one_step: Vec<Call> = Stage::PASSES
        .iter()
        .flat_map(|&s| [Call::Issue(s), Call::Barrier])
        .collect();
    let expected: Vec<Call> = one_step.iter().chain(one_step.iter()).copied().collect();
    assert_eq!(pipeline.dispatcher().calls(), expected);
    assert_eq!(pipeline.stage(), Stage::Idle);
    assert_eq!(pipeline.steps(), 2);
}

#[test]
fn stage_machine_cycles_back_to_idle() {
    let mut stage = Stage::Idle;
    let mut seen = Vec::new();
    loop {
        stage = stage.next();
        if stage == Stage::Idle {
            break;
        }
        seen.push(stage);
    }
    assert_eq!(seen, Stage::PASSES);
}

#[test]
fn densities_are_at_least_the_self_contribution() {
    let settings = tank(400);
    let mut pipeline = serial(&settings);
    scramble(&mut pipeline, 0.0, 0.0, 4);
    pipeline.upload(settings.snapshot(0.002)).unwrap();
    pipeline.step().unwrap();

    let own = settings.particle_mass * Kernels::new(settings.smoothing_radius).poly6(0.0);
    for d in pipeline.store().densities() {
        assert!(d.density >= own * (1.0 - 1e-6), "density {} below {own}", d.density);
        assert!(d.near_density >= 0.0);
    }
    for f in pipeline.store().forces() {
        assert!(f.pressure >= 0.0);
        assert!(f.near_pressure >= 0.0);
    }
}

#[test]
fn isolated_particle_has_zero_pressure() {
    let mut settings = tank(1);
    settings.rest_density = 1000.0;
    let mut pipeline = serial(&settings);
    pipeline.upload(settings.snapshot(0.001)).unwrap();
    pipeline.step().unwrap();

    let p = pipeline.store().particle(0).unwrap();
    assert!(p.density > 0.0 && p.density < settings.rest_density);
    assert_eq!(p.pressure, 0.0);
    assert!((p.force.y - settings.gravity * settings.particle_mass).abs() < 1e-6);
}

#[test]
fn coincident_particles_stay_finite() {
    let settings = FluidSettings {
        particle_count: 2,
        smoothing_radius: 1.0,
        particle_mass: 1.0,
        ..FluidSettings::default()
    };
    let mut pipeline = FluidPipeline::new(
        &settings,
        &mut from_fn(|_| Vec3::new(0.0, 1.0, 0.0)),
        SerialDispatch::default(),
    )
    .unwrap();
    pipeline.upload(settings.snapshot(0.004)).unwrap();
    pipeline.step().unwrap();

    let k = Kernels::new(1.0);
    for p in pipeline.store().iter() {
        assert!((p.density - 2.0 * k.poly6(0.0)).abs() < 1e-4);
        assert!((p.near_density - 2.0 * k.near(0.0)).abs() < 1e-3);
        // no direction between them, only gravity acts
        assert_eq!(p.force.x, 0.0);
        assert_eq!(p.force.z, 0.0);
        assert!(p.position.is_finite() && p.velocity.is_finite());
    }
}

#[test]
fn no_forces_means_ballistic_motion() {
    let mut settings = tank(256);
    settings.gravity = 0.0;
    settings.stiffness = 0.0;
    settings.near_stiffness = 0.0;
    settings.viscosity = 0.0;
    let mut pipeline = serial(&settings);
    for i in 0..256 {
        let v = Vec3::new((i % 7) as f32 * 0.1 - 0.3, 0.2, -0.1);
        pipeline.store_mut().set_velocity(i, v);
    }
    let before: Vec<Kinematics> = pipeline.store().kinematics().to_vec();

    let dt = 0.005;
    pipeline.upload(settings.snapshot(dt)).unwrap();
    pipeline.step().unwrap();

    for (b, a) in before.iter().zip(pipeline.store().kinematics()) {
        assert_eq!(a.velocity, b.velocity);
        assert!(a.position.abs_diff_eq(b.position + b.velocity * dt, 1e-6));
    }
}

#[test]
fn every_particle_ends_inside_the_walls() {
    let settings = tank(300);
    let mut pipeline = serial(&settings);
    scramble(&mut pipeline, 1.0, 50.0, 77);
    pipeline.upload(settings.snapshot(settings.max_timestep)).unwrap();

    let walls = WallBox::from_params(pipeline.params());
    for _ in 0..3 {
        pipeline.step().unwrap();
        for p in pipeline.positions() {
            assert!(walls.contains(p), "{p} escaped");
        }
    }
}

#[test]
fn failed_stage_leaves_particles_untouched() {
    let settings = tank(128);
    for stage in [Stage::BuildGrid, Stage::Force, Stage::Integrate] {
        let mut pipeline =
            FluidPipeline::new(&settings, &mut settings.spawn.clone(), FailAt(stage)).unwrap();
        pipeline.store_mut().set_velocity(3, Vec3::X);
        pipeline.upload(settings.snapshot(0.004)).unwrap();
        let before = pipeline.store().kinematics().to_vec();

        match pipeline.step() {
            Err(FluidError::Dispatch { stage: failed, .. }) => assert_eq!(failed, stage),
            other => panic!("expected dispatch failure, got {other:?}"),
        }
        assert_eq!(pipeline.store().kinematics(), &before[..]);
        assert_eq!(pipeline.stage(), Stage::Idle);
        assert_eq!(pipeline.steps(), 0);
    }
}

#[test]
fn oversized_dispatch_is_refused_before_any_stage() {
    let settings = tank(64);
    let dispatch = Recording {
        inner: SerialDispatch { batch_size: 1 },
        limit: Some(100),
        ..Recording::default()
    };
    let mut pipeline = FluidPipeline::new(&settings, &mut settings.spawn.clone(), dispatch).unwrap();
    pipeline.upload(settings.snapshot(0.004)).unwrap();
    let before = pipeline.store().kinematics().to_vec();

    // the grid has more than 100 cells, so ClearGrid alone is over the limit
    assert!(pipeline.grid().cell_count() > 100);
    match pipeline.step() {
        Err(FluidError::DispatchLimit { stage, limit, .. }) => {
            assert_eq!(stage, Stage::ClearGrid);
            assert_eq!(limit, 100);
        }
        other => panic!("expected dispatch limit, got {other:?}"),
    }
    assert!(pipeline.dispatcher().calls().is_empty());
    assert_eq!(pipeline.store().kinematics(), &before[..]);
}

#[test]
fn invalid_upload_keeps_previous_block() {
    let settings = tank(32);
    let mut pipeline = serial(&settings);
    let good = settings.snapshot(0.004);
    pipeline.upload(good).unwrap();

    let mut bad = good;
    bad.wall_min.z = 2.0;
    assert!(matches!(
        pipeline.upload(bad),
        Err(FluidError::InvalidBounds { axis: 'z', .. })
    ));

    let mut bad = good;
    bad.smoothing_radius = -1.0;
    assert!(matches!(pipeline.upload(bad), Err(FluidError::SmoothingRadius(_))));

    let mut bad = good;
    bad.particle_count = 33;
    assert!(matches!(
        pipeline.upload(bad),
        Err(FluidError::Parameter { name: "particle_count", .. })
    ));

    assert_eq!(*pipeline.params(), good);
}

#[test]
fn wider_box_re_lays_out_the_grid() {
    let mut settings = tank(32);
    let mut pipeline = serial(&settings);
    let dims = pipeline.grid().layout().dims;

    settings.set_box_half_width(1.0);
    pipeline.upload(settings.snapshot(0.004)).unwrap();
    let wider = pipeline.grid().layout().dims;
    assert!(wider.x > dims.x);
    assert_eq!(wider.y, dims.y);
    assert_eq!(pipeline.grid().cell_count(), pipeline.grid().layout().cell_count());
    pipeline.step().unwrap();
    assert_eq!(pipeline.gpu_params().grid_dim, wider.to_array());
}

#[test]
fn pair_forces_are_equal_and_opposite() {
    let settings = FluidSettings {
        particle_count: 2,
        gravity: 0.0,
        ..FluidSettings::default()
    };
    let spots = [Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.05, 1.02, 0.03)];
    let mut pipeline =
        FluidPipeline::new(&settings, &mut from_fn(|i| spots[i]), SerialDispatch::default())
            .unwrap();
    pipeline.store_mut().set_velocity(0, Vec3::new(0.5, 0.0, 0.0));
    pipeline.upload(settings.snapshot(0.0)).unwrap();
    pipeline.step().unwrap();

    let forces = pipeline.store().forces();
    let (a, b) = (forces[0].force, forces[1].force);
    assert!(a.length() > 0.0);
    assert!((a + b).length() <= 1e-4 * a.length(), "{a} vs {b}");
    // zero dt leaves positions where they were
    assert_eq!(pipeline.store().kinematics()[1].position, spots[1]);
}

#[test]
fn rayon_and_serial_backends_agree() {
    let settings = tank(512);
    let mut a = serial(&settings);
    let mut b = FluidPipeline::from_settings(&settings).unwrap();
    assert_eq!(b.dispatcher().threads(), 2);

    let params = settings.snapshot(0.004);
    a.upload(params).unwrap();
    b.upload(params).unwrap();
    a.step().unwrap();
    b.step().unwrap();

    for (x, y) in a.store().densities().iter().zip(b.store().densities()) {
        let scale = x.density.abs().max(1.0);
        assert!((x.density - y.density).abs() <= 1e-4 * scale);
    }
    for (x, y) in a.positions().zip(b.positions()) {
        assert!(x.abs_diff_eq(y, 1e-4), "{x} vs {y}");
    }
}

#[test]
fn advance_splits_the_frame_into_capped_substeps() {
    let mut settings = tank(64);
    settings.iterations = 3;
    let mut pipeline = serial(&settings);

    assert_eq!(pipeline.advance(&settings, 0.1).unwrap(), 3);
    assert_eq!(pipeline.steps(), 3);
    assert_eq!(pipeline.params().delta_time, settings.max_timestep);

    assert_eq!(pipeline.advance(&settings, 0.003).unwrap(), 3);
    assert!((pipeline.params().delta_time - 0.001).abs() < 1e-7);

    assert_eq!(pipeline.advance(&settings, 0.0).unwrap(), 0);
    assert_eq!(pipeline.steps(), 6);
}

#[test]
fn reset_restores_the_spawn_block() {
    let settings = tank(128);
    let mut pipeline = serial(&settings);
    let spawned: Vec<Vec3> = pipeline.positions().collect();

    pipeline.advance(&settings, 0.1).unwrap();
    assert_ne!(pipeline.positions().collect::<Vec<_>>(), spawned);

    pipeline.reset(&mut settings.spawn.clone()).unwrap();
    assert_eq!(pipeline.positions().collect::<Vec<_>>(), spawned);
    assert_eq!(pipeline.steps(), 0);
    assert!(pipeline.store().iter().all(|p| p.velocity == Vec3::ZERO));
}

#[test]
fn particle_buffer_matches_the_gpu_layout() {
    let settings = tank(100);
    let mut pipeline = serial(&settings);
    pipeline.advance(&settings, 0.004).unwrap();

    let gpu = pipeline.store().to_gpu();
    let bytes: &[u8] = bytemuck::cast_slice(&gpu);
    assert_eq!(bytes.len(), 100 * std::mem::size_of::<GPUParticle>());
    assert_eq!(gpu[7].position, pipeline.store().kinematics()[7].position.to_array());
    assert_eq!(gpu[7].density, pipeline.store().densities()[7].density);

    let params = pipeline.gpu_params();
    assert_eq!(params.particle_count, 100);
    assert_eq!(params.grid_dim, pipeline.grid().layout().dims.to_array());
}

#[test]
fn kicked_particles_move_faster() {
    let settings = tank(64);
    let mut pipeline = serial(&settings);
    let hit = pipeline
        .store_mut()
        .kick(Vec3::splat(0.2), 0.06, Vec3::new(0.0, 3.0, 0.0));
    assert!(hit > 0);
    let vy: Vec<f32> = pipeline.store().kinematics().iter().map(|k| k.velocity.y).collect();
    assert_eq!(vy.iter().filter(|&&v| v == 3.0).count(), hit);
}
