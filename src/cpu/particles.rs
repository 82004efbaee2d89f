// fixed-capacity particle arena, split by which pass writes each field
use glam::{UVec2, Vec3};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::error::{FluidError, Result};
use crate::gpu::ffi::GPUParticle;

/// Allocates a fixed slot buffer, surfacing allocation failure instead of aborting.
pub(crate) fn alloc_slots<T>(
    buffer: &'static str,
    len: usize,
    init: impl FnMut() -> T,
) -> Result<Box<[T]>> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(len)
        .map_err(|source| FluidError::Allocation { buffer, len, source })?;
    slots.extend(std::iter::repeat_with(init).take(len));
    Ok(slots.into_boxed_slice())
}

// written by Integrate
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Kinematics {
    pub position: Vec3,
    pub velocity: Vec3,
}

// written by Density
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Density {
    pub density: f32,
    pub near_density: f32,
}

// written by Force
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Forces {
    pub force: Vec3,
    pub pressure: f32,
    pub near_pressure: f32,
}

/// One particle's full state, assembled from the store for readers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Particle {
    pub position: Vec3,
    pub density: f32,
    pub velocity: Vec3,
    pub pressure: f32,
    pub force: Vec3,
    pub near_density: f32,
}

impl From<Particle> for GPUParticle {
    fn from(p: Particle) -> Self {
        GPUParticle {
            position: p.position.to_array(),
            density: p.density,
            velocity: p.velocity.to_array(),
            pressure: p.pressure,
            force: p.force.to_array(),
            near_density: p.near_density,
        }
    }
}

/// Source of initial positions for every slot of the arena.
pub trait ParticleGenerator {
    fn generate(&mut self, positions: &mut [Vec3]);
}

pub struct FromFn<F>(F);

/// Generator from a closure mapping slot index to position.
pub fn from_fn<F: FnMut(usize) -> Vec3>(f: F) -> FromFn<F> {
    FromFn(f)
}

impl<F: FnMut(usize) -> Vec3> ParticleGenerator for FromFn<F> {
    fn generate(&mut self, positions: &mut [Vec3]) {
        for (slot, p) in positions.iter_mut().enumerate() {
            *p = (self.0)(slot);
        }
    }
}

/// Column of particles: `footprint.x * footprint.y` per layer on the x/z plane,
/// stacked upwards until the pool is full. A small seeded jitter breaks the
/// lattice symmetry so the column collapses into waves instead of sliding down.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnBlock {
    pub origin: Vec3,
    pub spacing: f32,
    pub footprint: UVec2, // x, z
    pub jitter: f32,
    pub seed: u64,
}

impl SpawnBlock {
    pub fn validate(&self) -> Result<()> {
        if !(self.spacing.is_finite() && self.spacing > 0.0) {
            return Err(FluidError::parameter("spawn.spacing", "must be positive"));
        }
        if self.footprint.min_element() == 0 {
            return Err(FluidError::parameter("spawn.footprint", "must be at least 1x1"));
        }
        if !(self.jitter.is_finite() && self.jitter >= 0.0) {
            return Err(FluidError::parameter("spawn.jitter", "must be non-negative"));
        }
        Ok(())
    }

    /// Unjittered position of a slot: y layer outermost, then x, then z.
    pub fn lattice_point(&self, slot: usize) -> Vec3 {
        let fx = self.footprint.x.max(1) as usize;
        let fz = self.footprint.y.max(1) as usize;
        let layer = slot / (fx * fz);
        let x = (slot % (fx * fz)) / fz;
        let z = slot % fz;
        self.origin + Vec3::new(x as f32, layer as f32, z as f32) * self.spacing
    }
}

impl ParticleGenerator for SpawnBlock {
    fn generate(&mut self, positions: &mut [Vec3]) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let j = self.jitter;
        for (slot, p) in positions.iter_mut().enumerate() {
            let offset = Vec3::new(
                rng.gen_range(0.0..=j),
                rng.gen_range(0.0..=j),
                rng.gen_range(0.0..=j),
            );
            *p = self.lattice_point(slot) + offset;
        }
    }
}

/// Particle pool of fixed capacity; a particle's identity is its slot index.
#[derive(Debug)]
pub struct ParticleStore {
    pub(crate) kinematics: Box<[Kinematics]>,
    pub(crate) densities: Box<[Density]>,
    pub(crate) forces: Box<[Forces]>,
}

impl ParticleStore {
    pub fn new(count: usize) -> Result<Self> {
        Ok(Self {
            kinematics: alloc_slots("particle kinematics", count, Kinematics::default)?,
            densities: alloc_slots("particle density", count, Density::default)?,
            forces: alloc_slots("particle force", count, Forces::default)?,
        })
    }

    pub fn len(&self) -> usize {
        self.kinematics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinematics.is_empty()
    }

    /// Re-populates the whole arena: positions from `generator`, everything else zeroed.
    pub fn populate(&mut self, generator: &mut impl ParticleGenerator) -> Result<()> {
        let mut positions = alloc_slots("spawn positions", self.len(), || Vec3::ZERO)?;
        generator.generate(&mut positions);
        for (k, position) in self.kinematics.iter_mut().zip(positions.iter()) {
            *k = Kinematics {
                position: *position,
                velocity: Vec3::ZERO,
            };
        }
        self.densities.fill(Density::default());
        self.forces.fill(Forces::default());
        Ok(())
    }

    pub fn positions(&self) -> impl ExactSizeIterator<Item = Vec3> + '_ {
        self.kinematics.iter().map(|k| k.position)
    }

    pub fn kinematics(&self) -> &[Kinematics] {
        &self.kinematics
    }

    pub fn densities(&self) -> &[Density] {
        &self.densities
    }

    pub fn forces(&self) -> &[Forces] {
        &self.forces
    }

    pub fn particle(&self, slot: usize) -> Option<Particle> {
        (slot < self.len()).then(|| self.assemble(slot))
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = Particle> + '_ {
        (0..self.len()).map(move |slot| self.assemble(slot))
    }

    fn assemble(&self, slot: usize) -> Particle {
        let k = self.kinematics[slot];
        let d = self.densities[slot];
        let f = self.forces[slot];
        Particle {
            position: k.position,
            density: d.density,
            velocity: k.velocity,
            pressure: f.pressure,
            force: f.force,
            near_density: d.near_density,
        }
    }

    pub fn to_gpu(&self) -> Vec<GPUParticle> {
        self.iter().map(GPUParticle::from).collect()
    }

    pub fn set_velocity(&mut self, slot: usize, velocity: Vec3) {
        if let Some(k) = self.kinematics.get_mut(slot) {
            k.velocity = velocity;
        }
    }

    /// Adds `delta_v` to every particle within `radius` of `center`, returns how many were hit.
    pub fn kick(&mut self, center: Vec3, radius: f32, delta_v: Vec3) -> usize {
        let radius2 = radius * radius;
        let mut hit = 0;
        for k in self.kinematics.iter_mut() {
            if k.position.distance_squared(center) < radius2 {
                k.velocity += delta_v;
                hit += 1;
            }
        }
        hit
    }
}
