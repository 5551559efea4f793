//! Backend seam shared by the CPU and GPU pile implementations.
//!
//! The doubling controller drives a pile through this trait only, so the
//! rayon array backend and the wgpu compute backend interchange freely
//! without duplicating any orchestration logic.

use crate::emitter::Frame;
use crate::grid::Grid;

pub trait PileBackend {
    /// Apply `iterations` toppling steps back to back. Stepping a stable
    /// grid is the identity, so overshooting past stability is harmless.
    fn step_batch(&mut self, iterations: usize);

    /// True iff every cell is strictly below the toppling threshold.
    fn is_stable(&mut self) -> bool;

    /// Double every cell (start of the next magnitude epoch).
    fn double(&mut self);

    /// Render the current grain counts to an RGB frame:
    /// `pixel[c] = (colour[c] * value) mod 256`.
    fn render_rgb(&mut self, colour: [u8; 3]) -> Frame;

    /// Owned snapshot of the current grid (GPU backends read back here).
    fn grid(&mut self) -> Grid;

    fn name(&self) -> &'static str;
}

impl<T: PileBackend + ?Sized> PileBackend for Box<T> {
    fn step_batch(&mut self, iterations: usize) {
        (**self).step_batch(iterations)
    }

    fn is_stable(&mut self) -> bool {
        (**self).is_stable()
    }

    fn double(&mut self) {
        (**self).double()
    }

    fn render_rgb(&mut self, colour: [u8; 3]) -> Frame {
        (**self).render_rgb(colour)
    }

    fn grid(&mut self) -> Grid {
        (**self).grid()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
