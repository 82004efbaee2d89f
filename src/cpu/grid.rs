//! Uniform grid of per-cell linked lists, rebuilt from positions every step.
//!
//! `head[cell]` holds the most recently inserted particle of a cell and
//! `next[particle]` the one inserted before it, so a cell's members are read
//! by walking `head -> next -> next ...` until [`SENTINEL`]. Insertion is a
//! single atomic swap on the head, so any number of workers can build the
//! grid concurrently without locks.
//!
//! Cells are flattened x fastest, then y, then z:
//! `index = x + dims.x * (y + dims.y * z)`.
//!
//! The lattice carries a one-cell margin on every side. Particles are always
//! clamped into the interior, so the 3x3x3 neighborhood of any occupied cell
//! stays inside the grid and the margin cells stay empty.

use std::sync::atomic::{AtomicU32, Ordering};

use glam::{IVec3, UVec3, Vec3};

use crate::cpu::particles::alloc_slots;
use crate::error::{FluidError, Result};

/// end of list / empty cell
pub const SENTINEL: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridLayout {
    /// corner of the margin cell (0, 0, 0)
    pub origin: Vec3,
    pub cell_size: f32,
    /// cell count per axis including both margins
    pub dims: UVec3,
}

impl GridLayout {
    pub fn new(wall_min: Vec3, wall_max: Vec3, cell_size: f32) -> Result<Self> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(FluidError::parameter(
                "cell_size",
                format!("must be positive, got {cell_size}"),
            ));
        }
        let extent = wall_max - wall_min;
        let interior = (extent / cell_size).ceil().max(Vec3::ONE);
        if interior.max_element() > (u32::MAX / 4) as f32 {
            return Err(FluidError::parameter(
                "cell_size",
                format!("{cell_size} is too small for a domain of {extent}"),
            ));
        }
        Ok(Self {
            origin: wall_min - Vec3::splat(cell_size),
            cell_size,
            dims: interior.as_uvec3() + UVec3::splat(2),
        })
    }

    pub fn cell_count(&self) -> usize {
        // saturates so an absurd layout fails in allocation instead of overflowing
        (self.dims.x as usize)
            .saturating_mul(self.dims.y as usize)
            .saturating_mul(self.dims.z as usize)
    }

    /// Interior cell containing `position`; out-of-domain (and NaN) positions
    /// clamp to the nearest interior cell.
    pub fn cell_coord(&self, position: Vec3) -> UVec3 {
        // float -> int casts saturate and map NaN to 0, the clamp does the rest
        let raw = ((position - self.origin) / self.cell_size).floor().as_ivec3();
        let last = (self.dims - UVec3::splat(2)).as_ivec3();
        raw.clamp(IVec3::ONE, last).as_uvec3()
    }

    #[inline]
    pub fn flatten(&self, coord: UVec3) -> usize {
        let (dx, dy) = (self.dims.x as usize, self.dims.y as usize);
        coord.x as usize + dx * (coord.y as usize + dy * coord.z as usize)
    }

    #[inline]
    pub fn cell_of(&self, position: Vec3) -> usize {
        self.flatten(self.cell_coord(position))
    }

    /// The 27 cells around an interior cell (itself included).
    pub fn neighborhood(&self, center: UVec3) -> impl Iterator<Item = usize> + '_ {
        let lo = center - UVec3::ONE;
        (0..27u32).map(move |k| {
            let offset = UVec3::new(k % 3, (k / 3) % 3, k / 9);
            self.flatten(lo + offset)
        })
    }
}

#[derive(Debug)]
pub struct SpatialGrid {
    layout: GridLayout,
    head: Box<[AtomicU32]>,
    next: Box<[AtomicU32]>,
}

impl SpatialGrid {
    pub fn new(layout: GridLayout, particle_count: usize) -> Result<Self> {
        Ok(Self {
            layout,
            head: alloc_slots("grid head", layout.cell_count(), || AtomicU32::new(SENTINEL))?,
            next: alloc_slots("grid next", particle_count, || AtomicU32::new(SENTINEL))?,
        })
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn cell_count(&self) -> usize {
        self.head.len()
    }

    pub fn particle_capacity(&self) -> usize {
        self.next.len()
    }

    /// Swaps in a new layout, reallocating the head buffer only when the cell
    /// count changes. Contents are invalid until the next clear + build.
    pub fn relayout(&mut self, layout: GridLayout) -> Result<()> {
        if layout.cell_count() != self.head.len() {
            self.head = alloc_slots("grid head", layout.cell_count(), || {
                AtomicU32::new(SENTINEL)
            })?;
        }
        self.layout = layout;
        Ok(())
    }

    // ---- pass kernels, one call per worker ----

    #[inline]
    pub fn clear_cell(&self, cell: usize) {
        self.head[cell].store(SENTINEL, Ordering::Relaxed);
    }

    /// Pushes `particle` onto the list of the cell containing `position`.
    #[inline]
    pub fn insert(&self, particle: usize, position: Vec3) {
        let cell = self.layout.cell_of(position);
        let prev = self.head[cell].swap(particle as u32, Ordering::AcqRel);
        self.next[particle].store(prev, Ordering::Relaxed);
    }

    // ---- queries, valid after a completed build ----

    pub fn head(&self, cell: usize) -> u32 {
        self.head[cell].load(Ordering::Relaxed)
    }

    pub fn next(&self, particle: usize) -> u32 {
        self.next[particle].load(Ordering::Relaxed)
    }

    pub fn members(&self, cell: usize) -> CellMembers<'_> {
        CellMembers {
            grid: self,
            cursor: self.head(cell),
            budget: self.next.len(),
        }
    }

    /// Every particle in the 3x3x3 block of cells around `position`.
    pub fn neighbors(&self, position: Vec3) -> impl Iterator<Item = usize> + '_ {
        let center = self.layout.cell_coord(position);
        self.layout
            .neighborhood(center)
            .flat_map(move |cell| self.members(cell))
    }
}

/// Walks one cell's list. The walk is bounded by the pool size so a corrupted
/// list cannot spin forever.
pub struct CellMembers<'a> {
    grid: &'a SpatialGrid,
    cursor: u32,
    budget: usize,
}

impl Iterator for CellMembers<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cursor == SENTINEL || self.budget == 0 {
            return None;
        }
        debug_assert!((self.cursor as usize) < self.grid.next.len());
        let particle = self.cursor as usize;
        self.cursor = self.grid.next(particle);
        self.budget -= 1;
        Some(particle)
    }
}
