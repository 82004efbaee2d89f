// per-particle kernels of the Density, Force and Integrate passes
//
// Each function computes exactly one particle's output slot from read-only
// inputs, so a dispatcher can run them in any order on any number of workers.

use glam::Vec3;

use crate::cpu::boundary::WallBox;
use crate::cpu::grid::SpatialGrid;
use crate::cpu::kernels::Kernels;
use crate::cpu::particles::{Density, Forces, Kinematics};
use crate::params::SimParams;

/// Density and near-density of particle `i`, itself included.
pub fn density_at(
    i: usize,
    kinematics: &[Kinematics],
    grid: &SpatialGrid,
    kernels: &Kernels,
    params: &SimParams,
) -> Density {
    let pos_i = kinematics[i].position;
    let h2 = kernels.radius_squared();
    let mut out = Density::default();

    for j in grid.neighbors(pos_i) {
        let r2 = (pos_i - kinematics[j].position).length_squared();
        if r2 < h2 {
            out.density += params.particle_mass * kernels.poly6(r2);
            out.near_density += params.particle_mass * kernels.near(r2.sqrt());
        }
    }
    out
}

/// Clamped at zero: an under-compressed region never pulls particles together.
#[inline]
pub fn pressure(density: f32, params: &SimParams) -> f32 {
    (params.stiffness * (density - params.rest_density)).max(0.0)
}

#[inline]
pub fn near_pressure(near_density: f32, params: &SimParams) -> f32 {
    params.near_stiffness * near_density.max(0.0)
}

/// Total force on particle `i`: pressure, near-pressure, viscosity and gravity.
pub fn forces_at(
    i: usize,
    kinematics: &[Kinematics],
    densities: &[Density],
    grid: &SpatialGrid,
    kernels: &Kernels,
    params: &SimParams,
) -> Forces {
    let Kinematics {
        position: pos_i,
        velocity: vel_i,
    } = kinematics[i];
    let rho_i = densities[i].density;
    let p_i = pressure(rho_i, params);
    let np_i = near_pressure(densities[i].near_density, params);
    let m = params.particle_mass;
    let h2 = kernels.radius_squared();

    // force density, summed over neighbors
    let mut f = Vec3::ZERO;
    for j in grid.neighbors(pos_i) {
        if i == j {
            continue;
        }
        let r = pos_i - kinematics[j].position;
        let r2 = r.length_squared();
        if r2 >= h2 {
            continue;
        }
        let rho_j = densities[j].density;
        if rho_j <= 0.0 {
            continue;
        }
        let r_len = r2.sqrt();
        let volume_j = m / rho_j;

        // symmetric pair terms, F_ij = -F_ji
        let p_j = pressure(rho_j, params);
        f -= volume_j * 0.5 * (p_i + p_j) * kernels.spiky_grad(r, r_len);

        let np_j = near_pressure(densities[j].near_density, params);
        f -= volume_j * 0.5 * (np_i + np_j) * kernels.near_grad(r, r_len);

        f += params.viscosity * volume_j * (kinematics[j].velocity - vel_i) * kernels.poly6(r2);
    }

    // force density times particle volume gives the force on the particle
    let mut force = if rho_i > 0.0 { f * (m / rho_i) } else { Vec3::ZERO };
    force.y += params.gravity * m;

    Forces {
        force,
        pressure: p_i,
        near_pressure: np_i,
    }
}

/// Semi-implicit Euler step followed by the wall response.
pub fn integrate(kinematics: &mut Kinematics, force: Vec3, walls: &WallBox, params: &SimParams) {
    let dt = params.delta_time;
    kinematics.velocity += force / params.particle_mass * dt;
    kinematics.position += kinematics.velocity * dt;
    walls.confine(&mut kinematics.position, &mut kinematics.velocity);
}
