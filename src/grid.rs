//! Grid state and neighbor kernels for the sandpile automaton.
//!
//! A `Grid` is a fixed-shape 2D field of grain counts. The `Kernel` describes
//! how a toppling cell distributes grains to its neighbors; the sum of its
//! weights is the toppling threshold. Grains sent past the edge of the grid
//! are lost (sink boundary), which is what lets large piles drain.

/// Weighted neighbor offsets used to distribute toppled grains.
///
/// Offsets are `(dy, dx, weight)` relative to the receiving cell. The set
/// must be centrally symmetric (closed under negation) so that gathering
/// contributions from neighbors is the same as scattering to them.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    taps: Vec<(i32, i32, u64)>,
    threshold: u64,
}

impl Kernel {
    /// Build a kernel from explicit taps.
    ///
    /// Fails on an empty tap list, a zero weight, a self-tap at (0, 0), or
    /// an offset set that is not centrally symmetric.
    pub fn new(taps: Vec<(i32, i32, u64)>) -> Result<Self, String> {
        if taps.is_empty() {
            return Err("kernel must have at least one tap".to_string());
        }
        for &(dy, dx, weight) in &taps {
            if dy == 0 && dx == 0 {
                return Err("kernel must not include a (0, 0) self-tap".to_string());
            }
            if weight == 0 {
                return Err(format!("kernel tap ({}, {}) has zero weight", dy, dx));
            }
            if !taps.iter().any(|&(ny, nx, nw)| ny == -dy && nx == -dx && nw == weight) {
                return Err(format!(
                    "kernel is not centrally symmetric: tap ({}, {}) has no mirror",
                    dy, dx
                ));
            }
        }
        let threshold = taps.iter().map(|&(_, _, w)| w).sum();
        Ok(Self { taps, threshold })
    }

    /// The default 4-neighbor kernel (threshold 4).
    pub fn von_neumann() -> Self {
        Self::new(vec![(-1, 0, 1), (1, 0, 1), (0, -1, 1), (0, 1, 1)])
            .unwrap_or_else(|e| unreachable!("von Neumann kernel is valid: {}", e))
    }

    /// Six-tap kernel from the 3x3 matrix [[1,1,0],[1,0,1],[0,1,1]]
    /// (threshold 6). Renders as a hexagonal lattice after shearing the image.
    pub fn hexagonal() -> Self {
        Self::new(vec![
            (-1, -1, 1),
            (-1, 0, 1),
            (0, -1, 1),
            (0, 1, 1),
            (1, 0, 1),
            (1, 1, 1),
        ])
        .unwrap_or_else(|e| unreachable!("hexagonal kernel is valid: {}", e))
    }

    /// Look up a built-in kernel by its config name.
    pub fn from_name(name: &str) -> Result<Self, String> {
        match name {
            "von_neumann" => Ok(Self::von_neumann()),
            "hexagonal" => Ok(Self::hexagonal()),
            other => Err(format!(
                "unknown kernel '{}' (expected 'von_neumann' or 'hexagonal')",
                other
            )),
        }
    }

    pub fn taps(&self) -> &[(i32, i32, u64)] {
        &self.taps
    }

    /// Sum of tap weights; a cell topples when its value reaches this.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

/// 2D field of grain counts, row-major, shape fixed for the life of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grid {
    height: usize,
    width: usize,
    cells: Vec<u64>,
}

impl Grid {
    /// Uniform grid with every cell at `background`.
    pub fn filled(height: usize, width: usize, background: u64) -> Self {
        Self {
            height,
            width,
            cells: vec![background; height * width],
        }
    }

    /// Background-filled grid with extra grains dropped on the given cells.
    /// An empty seed list seeds the single center cell with `base_size`.
    pub fn seeded(
        height: usize,
        width: usize,
        background: u64,
        base_size: u64,
        seeds: &[(usize, usize, u64)],
    ) -> Self {
        let mut grid = Self::filled(height, width, background);
        if seeds.is_empty() {
            let c = (height / 2) * width + width / 2;
            grid.cells[c] += base_size;
        } else {
            for &(y, x, grains) in seeds {
                grid.cells[y * width + x] += grains;
            }
        }
        grid
    }

    /// Rebuild a grid from raw parts. `cells` must be `height * width` long.
    pub fn from_parts(height: usize, width: usize, cells: Vec<u64>) -> Self {
        assert_eq!(cells.len(), height * width, "cell buffer does not match shape");
        Self { height, width, cells }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn get(&self, y: usize, x: usize) -> u64 {
        self.cells[y * self.width + x]
    }

    pub fn set(&mut self, y: usize, x: usize, value: u64) {
        self.cells[y * self.width + x] = value;
    }

    pub fn cells(&self) -> &[u64] {
        &self.cells
    }

    /// Take the raw cell buffer, consuming the grid. Lets the stepping code
    /// recycle its back buffer instead of reallocating every step.
    pub fn into_cells(self) -> Vec<u64> {
        self.cells
    }

    /// Multiply every cell by `factor` (the doubling step uses factor 2).
    /// By the time this is called all cells are below the threshold, so the
    /// product stays far from the representable range.
    pub fn scale(&mut self, factor: u64) {
        for v in &mut self.cells {
            *v *= factor;
        }
    }

    pub fn max_value(&self) -> u64 {
        self.cells.iter().copied().max().unwrap_or(0)
    }

    /// Total grains on the grid. Widened to u128 so the sum cannot wrap on
    /// large grids with large counts.
    pub fn total_grains(&self) -> u128 {
        self.cells.iter().map(|&v| v as u128).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn von_neumann_threshold_is_four() {
        let k = Kernel::von_neumann();
        assert_eq!(k.threshold(), 4);
        assert_eq!(k.taps().len(), 4);
    }

    #[test]
    fn hexagonal_threshold_is_six() {
        let k = Kernel::hexagonal();
        assert_eq!(k.threshold(), 6);
        assert_eq!(k.taps().len(), 6);
    }

    #[test]
    fn asymmetric_kernel_rejected() {
        let result = Kernel::new(vec![(0, 1, 1), (1, 0, 1)]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_weight_tap_rejected() {
        let result = Kernel::new(vec![(0, 1, 0), (0, -1, 0)]);
        assert!(result.is_err());
    }

    #[test]
    fn default_seed_lands_on_center() {
        let grid = Grid::seeded(5, 5, 1, 40, &[]);
        assert_eq!(grid.get(2, 2), 41);
        assert_eq!(grid.get(0, 0), 1);
        assert_eq!(grid.total_grains(), 25 + 40);
    }

    #[test]
    fn explicit_seeds_override_center_default() {
        let grid = Grid::seeded(5, 5, 0, 40, &[(0, 0, 3), (4, 4, 5)]);
        assert_eq!(grid.get(0, 0), 3);
        assert_eq!(grid.get(4, 4), 5);
        assert_eq!(grid.get(2, 2), 0);
        assert_eq!(grid.total_grains(), 8);
    }

    #[test]
    fn scale_doubles_every_cell() {
        let mut grid = Grid::seeded(3, 3, 1, 2, &[]);
        grid.scale(2);
        assert_eq!(grid.get(1, 1), 6);
        assert_eq!(grid.get(0, 0), 2);
    }
}
