use ndarray::Array2;

use super::psd::PsdPoint;

/// Steps below this are treated as a collapsed axis
const DEGENERATE_STEP: f64 = 1e-12;

/// Occupancy grid over the (energy, ratio) bounding box of a point set
#[derive(Debug, Clone, PartialEq)]
pub struct DensityGrid {
    levels: usize,
    energy_range: (f64, f64),
    ratio_range: (f64, f64),
    occupancy: Array2<u32>,
}

impl DensityGrid {
    /// Returns None when either axis collapses to a single value or there are no points
    pub fn build(points: &[PsdPoint], levels: usize) -> Option<Self> {
        if points.is_empty() || levels < 2 {
            return None;
        }
        let energy_range = bounds(points.iter().map(|p| p.energy));
        let ratio_range = bounds(points.iter().map(|p| p.ratio));
        let span = (levels - 1) as f64;
        if (energy_range.1 - energy_range.0) / span < DEGENERATE_STEP
            || (ratio_range.1 - ratio_range.0) / span < DEGENERATE_STEP
        {
            return None;
        }

        let mut grid = Self {
            levels,
            energy_range,
            ratio_range,
            occupancy: Array2::zeros([levels + 1, levels + 1]),
        };
        for point in points {
            let cell = grid.cell(point);
            grid.occupancy[cell] += 1;
        }
        Some(grid)
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn energy_range(&self) -> (f64, f64) {
        self.energy_range
    }

    pub fn ratio_range(&self) -> (f64, f64) {
        self.ratio_range
    }

    pub fn occupancy(&self) -> &Array2<u32> {
        &self.occupancy
    }

    /// Grid cell a point falls in, clamped into the grid
    pub fn cell(&self, point: &PsdPoint) -> [usize; 2] {
        [
            axis_index(point.energy, self.energy_range, self.levels),
            axis_index(point.ratio, self.ratio_range, self.levels),
        ]
    }

    /// Occupancy of the cell holding `point`
    pub fn density_at(&self, point: &PsdPoint) -> u32 {
        self.occupancy[self.cell(point)]
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

fn axis_index(value: f64, range: (f64, f64), levels: usize) -> usize {
    let step = (range.1 - range.0) / (levels - 1) as f64;
    let index = ((value - range.0) / step).round();
    index.clamp(0.0, levels as f64) as usize
}

/// Per-point density: each point gets the occupancy of its own cell.
///
/// Empty when the point set is degenerate on either axis.
pub fn point_density(points: &[PsdPoint], levels: usize) -> Vec<u32> {
    match DensityGrid::build(points, levels) {
        Some(grid) => points.iter().map(|p| grid.density_at(p)).collect(),
        None => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(energy: f64, ratio: f64) -> PsdPoint {
        PsdPoint { energy, ratio }
    }

    #[test]
    fn test_same_energy_is_degenerate() {
        let points: Vec<PsdPoint> = (0..10).map(|i| point(700.0, 0.1 * i as f64)).collect();
        assert!(DensityGrid::build(&points, 200).is_none());
        assert!(point_density(&points, 200).is_empty());
        assert!(point_density(&[], 200).is_empty());
    }

    #[test]
    fn test_density_counts_shared_cells() {
        let points = vec![
            point(0.0, 0.0),
            point(0.0, 0.0),
            point(100.0, 1.0),
            point(50.0, 0.5),
            point(50.0001, 0.5),
        ];
        let density = point_density(&points, 11);
        assert_eq!(density, vec![2, 2, 1, 2, 2]);
    }

    #[test]
    fn test_every_point_lands_in_one_cell() {
        let points: Vec<PsdPoint> = (0..500)
            .map(|i| point(600.0 + i as f64 * 0.7, 0.2 + (i % 37) as f64 * 0.01))
            .collect();
        let grid = DensityGrid::build(&points, 200).unwrap();
        assert_eq!(grid.occupancy().shape(), &[201, 201]);
        assert_eq!(grid.occupancy().sum(), points.len() as u32);
        let top = grid.cell(&point(grid.energy_range().1, grid.ratio_range().1));
        assert_eq!(top, [199, 199]);
    }
}
