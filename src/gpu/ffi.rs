use bytemuck::{Pod, Zeroable};

// Byte layouts shared with GPU-side consumers (renderers, compute backends).
// Field order is part of the contract, reorder nothing.

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GPUParticle {
    // not using glam so the layout stays plain arrays on every target
    pub position: [f32; 3],
    pub density: f32,
    pub velocity: [f32; 3],
    pub pressure: f32,
    pub force: [f32; 3],
    pub near_density: f32,
}

// five 16-byte rows
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GPUSimParams {
    pub delta_time: f32,
    pub gravity: f32,
    pub stiffness: f32,
    pub near_stiffness: f32,

    pub wall_min: [f32; 3],
    pub rest_density: f32,

    pub wall_max: [f32; 3],
    pub viscosity: f32,

    pub grid_dim: [u32; 3],
    pub particle_count: u32,

    pub smoothing_radius: f32,
    pub particle_mass: f32,
    pub cell_size: f32,
    pub wall_damping: f32,
}
