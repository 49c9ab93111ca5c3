use hdf5::File;
use ndarray::{Array2, ArrayView1};
use std::path::Path;

use super::constants::PULSE_LENGTH;
use super::error::PulseSourceError;

/// One digitized detector event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pulse {
    samples: [i16; PULSE_LENGTH],
}

impl Pulse {
    pub fn new(samples: [i16; PULSE_LENGTH]) -> Self {
        Self { samples }
    }

    /// Build a pulse from the leading samples, padding the rest with zeros
    pub fn from_slice(samples: &[i16]) -> Self {
        let mut buf = [0i16; PULSE_LENGTH];
        let n = samples.len().min(PULSE_LENGTH);
        buf[..n].copy_from_slice(&samples[..n]);
        Self { samples: buf }
    }

    fn from_row(row: ArrayView1<'_, i16>) -> Self {
        let mut buf = [0i16; PULSE_LENGTH];
        for (dst, src) in buf.iter_mut().zip(row.iter()) {
            *dst = *src;
        }
        Self { samples: buf }
    }

    pub fn samples(&self) -> &[i16; PULSE_LENGTH] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [i16; PULSE_LENGTH] {
        &mut self.samples
    }

    /// Largest sample and its (0-based) index; the first occurrence wins ties
    pub fn peak(&self) -> (i16, usize) {
        let mut peak = (self.samples[0], 0);
        for (idx, value) in self.samples.iter().enumerate().skip(1) {
            if *value > peak.0 {
                peak = (*value, idx);
            }
        }
        peak
    }

    pub fn min(&self) -> i16 {
        self.samples.iter().copied().min().unwrap_or_default()
    }
}

/// Cut a de-interleaved channel stream into consecutive fixed-length pulse records.
///
/// A trailing partial record is discarded.
pub fn split_records(samples: &[i16]) -> Vec<Pulse> {
    samples
        .chunks_exact(PULSE_LENGTH)
        .map(Pulse::from_slice)
        .collect()
}

/// Stack pulses into a (count × 512) matrix
pub fn pulses_to_matrix(pulses: &[Pulse]) -> Array2<i16> {
    let mut matrix = Array2::<i16>::zeros([pulses.len(), PULSE_LENGTH]);
    for (mut row, pulse) in matrix.rows_mut().into_iter().zip(pulses) {
        for (dst, src) in row.iter_mut().zip(pulse.samples.iter()) {
            *dst = *src;
        }
    }
    matrix
}

/// Read the offline pulse collection: a single 2-D i16 dataset of shape (pulses × 512)
pub fn read_pulse_file(path: &Path, dataset: &str) -> Result<Vec<Pulse>, PulseSourceError> {
    if !path.exists() {
        return Err(PulseSourceError::BadFilePath(path.to_path_buf()));
    }
    let file = File::open(path)?;
    let data: Array2<i16> = file.dataset(dataset)?.read_2d::<i16>()?;
    if data.ncols() != PULSE_LENGTH {
        return Err(PulseSourceError::BadShape(data.ncols()));
    }
    let pulses: Vec<Pulse> = data.rows().into_iter().map(Pulse::from_row).collect();
    spdlog::info!(
        "Read {} pulses from {}:{}",
        pulses.len(),
        path.display(),
        dataset
    );
    Ok(pulses)
}
