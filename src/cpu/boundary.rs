use glam::Vec3;

use crate::params::SimParams;

/// Axis-aligned wall box. A particle crossing a wall is put back on it and
/// its normal velocity is reflected, keeping only `damping` of it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WallBox {
    pub min: Vec3,
    pub max: Vec3,
    pub damping: f32,
}

impl WallBox {
    pub fn from_params(params: &SimParams) -> Self {
        Self {
            min: params.wall_min,
            max: params.wall_max,
            damping: params.wall_damping,
        }
    }

    pub fn confine(&self, position: &mut Vec3, velocity: &mut Vec3) {
        for axis in 0..3 {
            // floor-side wall
            if !(position[axis] >= self.min[axis]) {
                position[axis] = self.min[axis];
                if velocity[axis] < 0.0 {
                    velocity[axis] *= -self.damping;
                }
            }
            // ceiling-side wall
            if position[axis] > self.max[axis] {
                position[axis] = self.max[axis];
                if velocity[axis] > 0.0 {
                    velocity[axis] *= -self.damping;
                }
            }
        }
    }

    pub fn contains(&self, position: Vec3) -> bool {
        position.cmpge(self.min).all() && position.cmple(self.max).all()
    }
}
