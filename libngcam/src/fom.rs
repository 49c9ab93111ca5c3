use serde::{Deserialize, Serialize};

use super::constants::*;
use super::fit::{GaussianFit, GaussianFitter, GaussianParams};
use super::psd::PsdPoint;

/// Fixed-width histogram of PSD ratios over [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub x: Vec<f64>,
    pub counts: Vec<f64>,
}

impl Histogram {
    /// Bin the ratios of points whose energy lies strictly inside the FOM window.
    /// Ratios that round outside the bin range are dropped.
    pub fn from_points(points: &[PsdPoint]) -> Self {
        let x: Vec<f64> = (0..HISTOGRAM_BINS)
            .map(|i| i as f64 * HISTOGRAM_STEP)
            .collect();
        let mut counts = vec![0.0; HISTOGRAM_BINS];
        for point in points
            .iter()
            .filter(|p| p.energy > FOM_ENERGY_MIN && p.energy < FOM_ENERGY_MAX)
        {
            let bin = (point.ratio / HISTOGRAM_STEP + 0.5).floor();
            if bin >= 0.0 && bin < HISTOGRAM_BINS as f64 {
                counts[bin as usize] += 1.0;
            }
        }
        Self { x, counts }
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    pub fn max(&self) -> f64 {
        self.counts.iter().copied().fold(0.0, f64::max)
    }

    /// Too few counts to attempt a fit
    pub fn is_low_statistics(&self) -> bool {
        self.max() < LOW_STATS_MAX_COUNT || self.total() < LOW_STATS_TOTAL_COUNT
    }
}

/// Strict interior local maxima, tallest first, at most `MAX_PEAKS` of them kept
/// `PEAK_MIN_SEPARATION` bins apart. Returned in ascending bin order.
pub fn find_peaks(counts: &[f64]) -> Vec<usize> {
    if counts.len() < 3 {
        return vec![];
    }
    let mut candidates: Vec<usize> = (1..counts.len() - 1)
        .filter(|&i| {
            counts[i] >= PEAK_MIN_HEIGHT && counts[i] > counts[i - 1] && counts[i] > counts[i + 1]
        })
        .collect();
    candidates.sort_by(|a, b| counts[*b].total_cmp(&counts[*a]));

    let mut accepted: Vec<usize> = Vec::with_capacity(MAX_PEAKS);
    for candidate in candidates {
        if accepted.len() == MAX_PEAKS {
            break;
        }
        if accepted
            .iter()
            .all(|p| p.abs_diff(candidate) >= PEAK_MIN_SEPARATION)
        {
            accepted.push(candidate);
        }
    }
    accepted.sort_unstable();
    accepted
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FomOutcome {
    Fitted,
    LowStatistics,
    TooFewPeaks,
    FitFailed,
}

/// Two-peak fit of a PSD histogram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FomResult {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub y_fit1: Vec<f64>,
    pub y_fit2: Vec<f64>,
    pub r1: f64,
    pub r2: f64,
    pub x_range: (f64, f64),
    pub peaks: Vec<usize>,
    pub left: Option<GaussianParams>,
    pub right: Option<GaussianParams>,
    pub outcome: FomOutcome,
}

impl FomResult {
    /// Raw histogram with flat fits
    fn unfitted(histogram: Histogram, peaks: Vec<usize>, outcome: FomOutcome) -> Self {
        let n = histogram.x.len();
        Self {
            x: histogram.x,
            y: histogram.counts,
            y_fit1: vec![0.0; n],
            y_fit2: vec![0.0; n],
            r1: 0.0,
            r2: 0.0,
            x_range: (0.0, 1.0),
            peaks,
            left: None,
            right: None,
            outcome,
        }
    }

    pub fn success(&self) -> bool {
        self.outcome == FomOutcome::Fitted
    }

    /// Peak separation over the summed full widths at half maximum
    pub fn fom(&self) -> Option<f64> {
        let (left, right) = (self.left?, self.right?);
        let widths = left.fwhm() + right.fwhm();
        if widths <= 0.0 || !widths.is_finite() {
            return None;
        }
        Some((right.centre - left.centre).abs() / widths)
    }

    /// Fit both halves of the histogram, split midway between its two peaks
    pub fn from_histogram(histogram: Histogram, fitter: &dyn GaussianFitter) -> Self {
        let peaks = find_peaks(&histogram.counts);
        if histogram.is_low_statistics() {
            spdlog::info!(
                "Histogram too sparse to fit (max {}, total {})",
                histogram.max(),
                histogram.total()
            );
            return Self::unfitted(histogram, peaks, FomOutcome::LowStatistics);
        }
        if peaks.len() < MAX_PEAKS {
            spdlog::info!("Found {} histogram peaks, need {}", peaks.len(), MAX_PEAKS);
            return Self::unfitted(histogram, peaks, FomOutcome::TooFewPeaks);
        }

        let division = peaks.iter().sum::<usize>() / peaks.len();
        let fit_half = |range: std::ops::Range<usize>, peak: usize| {
            fitter.fit(
                &histogram.x[range.clone()],
                &histogram.counts[range],
                GaussianParams::new(histogram.counts[peak], histogram.x[peak], FIT_INITIAL_WIDTH),
            )
        };
        let left = fit_half(0..division, peaks[0]);
        let right = fit_half(division..histogram.x.len(), peaks[1]);
        let (left, right): (GaussianFit, GaussianFit) = match (left, right) {
            (Ok(l), Ok(r)) => (l, r),
            (l, r) => {
                for e in [l.err(), r.err()].into_iter().flatten() {
                    spdlog::warn!("Gaussian fit failed: {e}");
                }
                return Self::unfitted(histogram, peaks, FomOutcome::FitFailed);
            }
        };

        let y_fit1 = histogram.x.iter().map(|x| left.params.eval(*x)).collect();
        let y_fit2 = histogram.x.iter().map(|x| right.params.eval(*x)).collect();
        let half_span = |p: &GaussianParams| DISPLAY_WIDTH_FACTOR * p.width.abs() / 2f64.sqrt();
        let x_range = (
            left.params.centre - half_span(&left.params),
            right.params.centre + half_span(&right.params),
        );
        Self {
            x: histogram.x,
            y: histogram.counts,
            y_fit1,
            y_fit2,
            r1: left.r2,
            r2: right.r2,
            x_range,
            peaks,
            left: Some(left.params),
            right: Some(right.params),
            outcome: FomOutcome::Fitted,
        }
    }
}

/// Histogram the points inside the energy window and fit them
pub fn figure_of_merit(points: &[PsdPoint], fitter: &dyn GaussianFitter) -> FomResult {
    FomResult::from_histogram(Histogram::from_points(points), fitter)
}
