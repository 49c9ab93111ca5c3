use serde::{Deserialize, Serialize};

use super::constants::*;
use super::pulse::Pulse;

/// Tuning of the pulse-shape discrimination stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsdParameters {
    /// Peak position window, 1-based and exclusive on both ends
    pub peak_index_min: usize,
    pub peak_index_max: usize,
    pub min_raw_peak: i16,
    pub min_undershoot: i16,
    pub cfd_fraction: f64,
    pub long_gate_offset: usize,
    pub long_gate_length: usize,
    pub short_gate_delay: usize,
    pub energy_slope: f64,
    pub energy_offset: f64,
}

impl Default for PsdParameters {
    fn default() -> Self {
        Self {
            peak_index_min: PEAK_INDEX_MIN,
            peak_index_max: PEAK_INDEX_MAX,
            min_raw_peak: MIN_RAW_PEAK,
            min_undershoot: MIN_UNDERSHOOT,
            cfd_fraction: CFD_FRACTION,
            long_gate_offset: LONG_GATE_OFFSET,
            long_gate_length: LONG_GATE_LENGTH,
            short_gate_delay: SHORT_GATE_DELAY,
            energy_slope: ENERGY_SLOPE,
            energy_offset: ENERGY_OFFSET,
        }
    }
}

impl PsdParameters {
    pub fn calibrate(&self, peak: f64) -> f64 {
        peak * self.energy_slope + self.energy_offset
    }
}

/// One accepted pulse: calibrated energy and short/long charge ratio
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PsdPoint {
    pub energy: f64,
    pub ratio: f64,
}

/// Survivor count after each filtering stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsdReport {
    pub input: usize,
    pub peak_position: usize,
    pub amplitude: usize,
    pub undershoot: usize,
    pub threshold: usize,
    pub accepted: usize,
}

impl PsdReport {
    /// Counts in pipeline order
    pub fn stages(&self) -> [usize; 6] {
        [
            self.input,
            self.peak_position,
            self.amplitude,
            self.undershoot,
            self.threshold,
            self.accepted,
        ]
    }
}

impl std::fmt::Display for PsdReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pulses -> position {} -> amplitude {} -> undershoot {} -> threshold {} -> accepted {}",
            self.input,
            self.peak_position,
            self.amplitude,
            self.undershoot,
            self.threshold,
            self.accepted
        )
    }
}

/// Mean of the leading samples, rounded half away from zero and saturated to i16
pub fn baseline(pulse: &Pulse) -> i16 {
    let sum: i64 = pulse.samples()[..BASELINE_SAMPLES]
        .iter()
        .map(|s| *s as i64)
        .sum();
    let mean = (sum as f64 / BASELINE_SAMPLES as f64).round();
    mean.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Baseline-corrected copy of a pulse. The input is never touched.
pub fn subtract_baseline(pulse: &Pulse) -> Pulse {
    let base = baseline(pulse);
    let mut corrected = pulse.clone();
    for sample in corrected.samples_mut().iter_mut() {
        *sample = sample.saturating_sub(base);
    }
    corrected
}

/// First index before the peak where the pulse crosses `fraction * peak` going upward
pub fn cfd_crossing(samples: &[i16], peak: i16, peak_index: usize, fraction: f64) -> Option<usize> {
    let threshold = fraction * peak as f64;
    let end = peak_index.min(samples.len().saturating_sub(1));
    (0..end).find(|&i| samples[i] as f64 <= threshold && samples[i + 1] as f64 > threshold)
}

/// Short/long charge ratio with gates anchored at the threshold crossing.
///
/// Gates are inclusive of their last sample. Returns None when a gate would start past the
/// record or the long integral is zero.
pub fn charge_ratio(samples: &[i16], crossing: usize, params: &PsdParameters) -> Option<f64> {
    let last = samples.len().checked_sub(1)?;
    let start_long = crossing + params.long_gate_offset;
    let end_long = (crossing + params.long_gate_length).min(last);
    let start_short = start_long + params.short_gate_delay;
    if start_long > last || start_short > last {
        return None;
    }
    let integrate = |start: usize| -> i64 {
        if start > end_long {
            return 0;
        }
        samples[start..=end_long].iter().map(|s| *s as i64).sum()
    };
    let long = integrate(start_long);
    if long == 0 {
        return None;
    }
    Some(integrate(start_short) as f64 / long as f64)
}

/// Run the discrimination pipeline over a pulse collection.
///
/// Every rejection is a drop; an empty stage ends the run early. The returned points are
/// sorted by ascending calibrated energy.
pub fn discriminate(pulses: &[Pulse], params: &PsdParameters) -> (Vec<PsdPoint>, PsdReport) {
    let mut report = PsdReport {
        input: pulses.len(),
        ..Default::default()
    };

    let positioned: Vec<(&Pulse, i16)> = pulses
        .iter()
        .filter_map(|pulse| {
            let (peak, index) = pulse.peak();
            let one_based = index + 1;
            (one_based > params.peak_index_min && one_based < params.peak_index_max)
                .then_some((pulse, peak))
        })
        .collect();
    report.peak_position = positioned.len();
    if positioned.is_empty() {
        return (vec![], report);
    }

    let formed: Vec<&Pulse> = positioned
        .into_iter()
        .filter(|(_, peak)| *peak > params.min_raw_peak)
        .map(|(pulse, _)| pulse)
        .collect();
    report.amplitude = formed.len();
    if formed.is_empty() {
        return (vec![], report);
    }

    let corrected: Vec<Pulse> = formed
        .into_iter()
        .map(subtract_baseline)
        .filter(|pulse| pulse.min() > params.min_undershoot)
        .collect();
    report.undershoot = corrected.len();
    if corrected.is_empty() {
        return (vec![], report);
    }

    let crossed: Vec<(&Pulse, i16, usize)> = corrected
        .iter()
        .filter_map(|pulse| {
            let (peak, index) = pulse.peak();
            cfd_crossing(pulse.samples(), peak, index, params.cfd_fraction)
                .map(|crossing| (pulse, peak, crossing))
        })
        .collect();
    report.threshold = crossed.len();
    if crossed.is_empty() {
        return (vec![], report);
    }

    let mut points: Vec<PsdPoint> = crossed
        .into_iter()
        .filter_map(|(pulse, peak, crossing)| {
            let ratio = charge_ratio(pulse.samples(), crossing, params)?;
            (peak > 0 && ratio > 0.0 && ratio < 1.0).then_some(PsdPoint {
                energy: peak as f64,
                ratio,
            })
        })
        .collect();
    report.accepted = points.len();

    points.sort_by(|a, b| a.energy.total_cmp(&b.energy));
    for point in points.iter_mut() {
        point.energy = params.calibrate(point.energy);
    }
    (points, report)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A pulse sitting on `base` with a short rise to `height` at `peak_index` and a slow
    /// exponential tail
    pub(crate) fn shaped_pulse(base: i16, peak_index: usize, height: i16) -> Pulse {
        let mut samples = [base; PULSE_LENGTH];
        samples[peak_index - 2] = base + (height as f64 * 0.2) as i16;
        samples[peak_index - 1] = base + (height as f64 * 0.6) as i16;
        for (k, sample) in samples[peak_index..].iter_mut().enumerate() {
            *sample = base + (height as f64 * 0.97f64.powi(k as i32)) as i16;
        }
        Pulse::new(samples)
    }

    #[test]
    fn test_baseline_rounding() {
        let mut samples = [0i16; PULSE_LENGTH];
        samples[..BASELINE_SAMPLES].copy_from_slice(&[3; BASELINE_SAMPLES]);
        samples[0] = 11; // mean 3.5
        assert_eq!(baseline(&Pulse::new(samples)), 4);
        samples[..BASELINE_SAMPLES].copy_from_slice(&[-3; BASELINE_SAMPLES]);
        samples[0] = -11; // mean -3.5
        assert_eq!(baseline(&Pulse::new(samples)), -4);
    }

    #[test]
    fn test_subtract_baseline_copies() {
        let pulse = shaped_pulse(200, 30, 400);
        let corrected = subtract_baseline(&pulse);
        assert_eq!(pulse.samples()[0], 200);
        assert_eq!(corrected.samples()[0], 0);
        assert_eq!(corrected.peak(), (400, 30));
    }

    #[test]
    fn test_subtract_baseline_saturates() {
        let mut samples = [i16::MIN; PULSE_LENGTH];
        samples[100] = i16::MAX;
        let corrected = subtract_baseline(&Pulse::new(samples));
        assert_eq!(corrected.samples()[0], 0);
        assert_eq!(corrected.samples()[100], i16::MAX);
    }

    #[test]
    fn test_cfd_crossing() {
        let mut samples = [0i16; PULSE_LENGTH];
        samples[19] = 100;
        samples[20] = 300;
        samples[21] = 500;
        samples[22] = 250;
        assert_eq!(cfd_crossing(&samples, 500, 21, 0.3), Some(19));
        // a pulse that starts above threshold never crosses
        let flat = [400i16; PULSE_LENGTH];
        assert_eq!(cfd_crossing(&flat, 400, 30, 0.3), None);
    }

    #[test]
    fn test_charge_ratio_gates() {
        let params = PsdParameters::default();
        let samples = [1i16; PULSE_LENGTH];
        // long gate 15..=100 (86 samples), short gate 45..=100 (56 samples)
        let ratio = charge_ratio(&samples, 0, &params).unwrap();
        assert!((ratio - 56.0 / 86.0).abs() < 1e-12);
        // gate clipped at the last sample
        let ratio = charge_ratio(&samples, 450, &params).unwrap();
        assert!((ratio - 17.0 / 47.0).abs() < 1e-12);
        // short gate would start past the record
        assert_eq!(charge_ratio(&samples, 470, &params), None);
        assert_eq!(charge_ratio(&[0i16; PULSE_LENGTH], 0, &params), None);
    }

    #[test]
    fn test_single_pulse_accepted() {
        let pulse = shaped_pulse(0, 21, 500);
        let (points, report) = discriminate(&[pulse], &PsdParameters::default());
        assert_eq!(points.len(), 1);
        assert_eq!(report.accepted, 1);
        assert!(points[0].ratio > 0.0 && points[0].ratio < 1.0);
        assert!((points[0].energy - (500.0 * ENERGY_SLOPE + ENERGY_OFFSET)).abs() < 1e-9);
    }

    #[test]
    fn test_pulse_without_tail_dropped_at_ratio() {
        let mut samples = [0i16; PULSE_LENGTH];
        samples[19..24].copy_from_slice(&[100, 300, 500, 250, 80]);
        let pulse = Pulse::new(samples);
        assert_eq!(pulse.peak(), (500, 21));
        // crosses 0.3 * 500 between samples 19 and 20
        assert_eq!(cfd_crossing(&samples, 500, 21, CFD_FRACTION), Some(19));
        // long gate 34..=119 holds only zeros
        assert_eq!(charge_ratio(&samples, 19, &PsdParameters::default()), None);

        let (points, report) = discriminate(&[pulse], &PsdParameters::default());
        assert!(points.is_empty());
        assert_eq!(report.stages(), [1, 1, 1, 1, 1, 0]);
    }

    #[test]
    fn test_early_peak_rejected() {
        let pulse = shaped_pulse(0, 5, 30000);
        let (points, report) = discriminate(&[pulse], &PsdParameters::default());
        assert!(points.is_empty());
        assert_eq!(report.peak_position, 0);
        assert_eq!(report.accepted, 0);
    }

    #[test]
    fn test_rejection_stages() {
        let params = PsdParameters::default();
        let small = shaped_pulse(0, 30, 90);
        let mut undershoot = shaped_pulse(0, 30, 800);
        undershoot.samples_mut()[300] = -200;
        let mut no_tail = [0i16; PULSE_LENGTH];
        no_tail[28] = 100;
        no_tail[29] = 300;
        no_tail[30] = 500;
        let good = shaped_pulse(0, 30, 800);
        let late = shaped_pulse(0, 60, 800);
        let pulses = vec![small, undershoot, Pulse::new(no_tail), good, late];
        let (points, report) = discriminate(&pulses, &params);
        assert_eq!(report.input, 5);
        assert_eq!(report.peak_position, 4);
        assert_eq!(report.amplitude, 3);
        assert_eq!(report.undershoot, 2);
        assert_eq!(report.threshold, 2);
        assert_eq!(report.accepted, 1);
        assert_eq!(points.len(), 1);
        let stages = report.stages();
        assert!(stages.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_calibration_and_sort() {
        // a raised baseline keeps the raw peaks above the amplitude floor
        let pulses = vec![shaped_pulse(100, 30, 20), shaped_pulse(100, 25, 10)];
        let (points, _) = discriminate(&pulses, &PsdParameters::default());
        assert_eq!(points.len(), 2);
        assert!((points[0].energy - 40.052).abs() < 1e-9);
        assert!((points[1].energy - 45.639).abs() < 1e-9);
        assert!(points.windows(2).all(|w| w[0].energy <= w[1].energy));
    }

    #[test]
    fn test_empty_input() {
        let (points, report) = discriminate(&[], &PsdParameters::default());
        assert!(points.is_empty());
        assert_eq!(report, PsdReport::default());
    }
}
