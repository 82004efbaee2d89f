// smoothing kernels in 3D, normalized so that each integrates to one over the support sphere
use std::f32::consts::PI;

use glam::Vec3;

/// Kernel set for one smoothing radius. The normalization constants depend
/// only on `h`, so they are computed once per uploaded parameter block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Kernels {
    h: f32,
    h2: f32,
    poly6_k: f32,
    spiky_grad_k: f32,
    near_k: f32,
    near_grad_k: f32,
}

impl Kernels {
    pub fn new(h: f32) -> Self {
        Self {
            h,
            h2: h * h,
            poly6_k: 315.0 / (64.0 * PI * h.powi(9)),
            spiky_grad_k: -45.0 / (PI * h.powi(6)),
            near_k: 105.0 / (4.0 * PI * h.powi(7)),
            near_grad_k: -105.0 / (PI * h.powi(7)),
        }
    }

    #[inline]
    pub fn radius(&self) -> f32 {
        self.h
    }

    #[inline]
    pub fn radius_squared(&self) -> f32 {
        self.h2
    }

    /// poly6, takes the squared distance so the density loop never needs a sqrt
    #[inline]
    pub fn poly6(&self, r2: f32) -> f32 {
        if (0.0..self.h2).contains(&r2) {
            self.poly6_k * (self.h2 - r2).powi(3)
        } else {
            0.0
        }
    }

    /// Steep companion kernel `(h - r)^4`, peaks harder than poly6 as r -> 0.
    #[inline]
    pub fn near(&self, r: f32) -> f32 {
        if (0.0..self.h).contains(&r) {
            self.near_k * (self.h - r).powi(4)
        } else {
            0.0
        }
    }

    /// Spiky gradient with respect to the first particle, `r = pos_i - pos_j`.
    /// Coincident particles have no defined direction and get a zero gradient.
    #[inline]
    pub fn spiky_grad(&self, r: Vec3, r_len: f32) -> Vec3 {
        if r_len <= 0.0 || r_len >= self.h {
            Vec3::ZERO
        } else {
            self.spiky_grad_k * (self.h - r_len).powi(2) * (r / r_len)
        }
    }

    #[inline]
    pub fn near_grad(&self, r: Vec3, r_len: f32) -> Vec3 {
        if r_len <= 0.0 || r_len >= self.h {
            Vec3::ZERO
        } else {
            self.near_grad_k * (self.h - r_len).powi(3) * (r / r_len)
        }
    }
}
