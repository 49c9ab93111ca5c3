use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::Instant;

use super::config::Config;
use super::constants::{NUMBER_OF_CHANNELS, PULSE_LENGTH, SPECTRUM_BUFFER_SIZE};
use super::device::{Card, CardClaim, PollOutcome, Registers};
use super::error::CaptureError;
use super::packet::{
    decode_spectrum, decode_waveform, waveform_channel, Deinterleaver, PointInterleaved,
    SpectrumRecord,
};
use super::persist::{Pack, PersistSummary, PersistWorker};
use super::pulse::Pulse;
use super::worker_status::{CardStatus, StatusKind};

/// Where a card's capture loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Prepared,
    WaitingFull,
    Draining,
    Resetting,
    Finished,
}

/// Per-card, per-run bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSession {
    pub card: usize,
    pub target_packs: u64,
    pub packs_remaining: u64,
    pub directory: PathBuf,
    pub shot: String,
}

impl CaptureSession {
    pub fn new(card: usize, config: &Config, shot: &str) -> Self {
        let target_packs = config.target_packs();
        Self {
            card,
            target_packs,
            packs_remaining: target_packs,
            directory: config.shot_directory(shot),
            shot: shot.to_string(),
        }
    }

    pub fn packs_done(&self) -> u64 {
        self.target_packs - self.packs_remaining
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub card: usize,
    pub packs_captured: u64,
    pub corrupt_packs: u64,
    pub read_failures: u64,
    pub cancelled: bool,
    pub persist: PersistSummary,
}

/// Payload bytes holding the first record of every channel
const FIRST_RECORD_BYTES: usize = PULSE_LENGTH * NUMBER_OF_CHANNELS * 2;

/// Result of decoding one drained pack for display
#[derive(Debug, Clone, Default)]
struct PackInspection {
    corrupt: bool,
    waveform: Option<Pulse>,
    spectra: Vec<SpectrumRecord>,
}

fn inspect_pack(raw: &[u8], spectrum: &[u8], camera: usize, big_endian: bool) -> PackInspection {
    let mut inspection = PackInspection::default();
    match decode_waveform(raw) {
        Ok(packet) => {
            // only the leading record is shown, so only that much is de-interleaved
            let head = &packet.payload[..packet.payload.len().min(FIRST_RECORD_BYTES)];
            let mut streams = PointInterleaved.deinterleave(head, big_endian);
            let stream = std::mem::take(&mut streams[waveform_channel(camera)]);
            if !stream.is_empty() {
                inspection.waveform = Some(Pulse::from_slice(&stream));
            }
        }
        Err(e) => {
            spdlog::debug!("Raw waveform buffer rejected: {e}");
            inspection.corrupt = true;
        }
    }
    match decode_spectrum(spectrum, camera) {
        Ok(pack) => {
            inspection.corrupt |= pack.corrupt > 0;
            inspection.spectra = pack.records;
        }
        Err(e) => {
            spdlog::debug!("Spectrum buffer rejected: {e}");
            inspection.corrupt = true;
        }
    }
    inspection
}

/// The capture state machine of one card.
///
/// Drives the arm / wait-full / drain / reset handshake, paces each cycle to the packing
/// duration, and hands every drained pack to the card's persistence worker.
pub struct CardCapture<'a> {
    claim: &'a CardClaim<'a>,
    registers: Registers<'a>,
    config: &'a Config,
    session: CaptureSession,
    cancel: &'a AtomicBool,
    tx: &'a Sender<CardStatus>,
    state: CaptureState,
    summary: CaptureSummary,
}

impl<'a> CardCapture<'a> {
    pub fn new(
        claim: &'a CardClaim<'a>,
        config: &'a Config,
        session: CaptureSession,
        cancel: &'a AtomicBool,
        tx: &'a Sender<CardStatus>,
    ) -> Self {
        let summary = CaptureSummary {
            card: claim.index(),
            ..Default::default()
        };
        Self {
            claim,
            registers: claim.registers(config.poll_interval(), config.poll_timeout()),
            config,
            session,
            cancel,
            tx,
            state: CaptureState::Idle,
            summary,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    fn set_state(&mut self, state: CaptureState) {
        spdlog::trace!(
            "Card {}: {:?} -> {:?}",
            self.session.card,
            self.state,
            state
        );
        self.state = state;
    }

    fn report(&self, kind: StatusKind) {
        let status = CardStatus::new(
            self.session.card,
            self.session.packs_done(),
            self.session.target_packs,
            kind,
        );
        if self.tx.send(status).is_err() {
            spdlog::debug!("Card {}: status receiver is gone", self.session.card);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Read both buffers of a full pack. None if the raw read failed.
    fn drain(&mut self) -> Option<Pack> {
        self.set_state(CaptureState::Draining);
        let mut raw = vec![0u8; self.config.raw_buffer_bytes];
        let mut spectrum = vec![0u8; SPECTRUM_BUFFER_SIZE];
        if let Err(e) = self.claim.read_raw(&mut raw) {
            spdlog::error!("Card {}: raw buffer read failed: {e}", self.session.card);
            self.summary.read_failures += 1;
            return None;
        }
        if let Err(e) = self.claim.read_spectrum(&mut spectrum) {
            spdlog::error!("Card {}: spectrum read failed: {e}", self.session.card);
            self.summary.read_failures += 1;
        }
        Some(Pack { raw, spectrum })
    }

    /// Run packs until the target count is reached or cancellation is requested
    fn capture_packs(&mut self, worker: &mut PersistWorker) -> Result<(), CaptureError> {
        self.set_state(CaptureState::Prepared);
        self.registers.arm();
        while self.session.packs_remaining > 0 {
            let cycle_start = Instant::now();
            if self.is_cancelled() {
                self.summary.cancelled = true;
                break;
            }

            self.set_state(CaptureState::WaitingFull);
            if self.registers.wait_full(self.cancel)? == PollOutcome::Cancelled {
                self.summary.cancelled = true;
                break;
            }

            if let Some(pack) = self.drain() {
                let inspection = inspect_pack(
                    &pack.raw,
                    &pack.spectrum,
                    self.config.display_camera,
                    self.config.big_endian_samples,
                );
                if inspection.corrupt {
                    self.summary.corrupt_packs += 1;
                    spdlog::warn!(
                        "Card {}: corrupt pack ({} so far)",
                        self.session.card,
                        self.summary.corrupt_packs
                    );
                }
                worker.submit(pack)?;
                self.summary.packs_captured += 1;
                if let Some(waveform) = inspection.waveform {
                    self.report(StatusKind::Waveform(waveform));
                }
                if !inspection.spectra.is_empty() {
                    self.report(StatusKind::Spectrum(inspection.spectra));
                }
            }
            self.session.packs_remaining -= 1;
            self.report(StatusKind::Progress);

            self.set_state(CaptureState::Resetting);
            if self.registers.clear_full(self.cancel)? == PollOutcome::Cancelled {
                self.summary.cancelled = true;
                break;
            }
            if self.session.packs_remaining > 0 {
                self.registers.arm();
            }

            let elapsed = cycle_start.elapsed();
            std::thread::sleep(self.config.packing_duration().saturating_sub(elapsed));
        }
        Ok(())
    }

    /// Run the whole session: spawn the persistence worker, capture, then drain and join it
    pub fn run(mut self) -> Result<CaptureSummary, CaptureError> {
        let mut worker = PersistWorker::spawn(
            self.session.card,
            &self.session.directory,
            self.config.queue_capacity,
            self.config.overflow_policy,
            self.config.drain_quiet(),
        )?;
        spdlog::info!(
            "Card {}: capturing {} packs for shot {}",
            self.session.card,
            self.session.target_packs,
            self.session.shot
        );
        let captured = self.capture_packs(&mut worker);
        self.set_state(CaptureState::Finished);
        self.report(StatusKind::Finished);
        let persisted = worker.finish();
        captured?;
        self.summary.persist = persisted?;
        spdlog::info!(
            "Card {}: {} packs captured, {} corrupt, {} read failures{}",
            self.session.card,
            self.summary.packs_captured,
            self.summary.corrupt_packs,
            self.summary.read_failures,
            if self.summary.cancelled { " (cancelled)" } else { "" }
        );
        Ok(self.summary)
    }
}

/// Claim a card and run one capture session on it
pub fn run_capture(
    card: &Card,
    config: &Config,
    shot: &str,
    cancel: &AtomicBool,
    tx: &Sender<CardStatus>,
) -> Result<CaptureSummary, CaptureError> {
    let claim = card.claim()?;
    let session = CaptureSession::new(card.index(), config, shot);
    CardCapture::new(&claim, config, session, cancel, tx).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::*;
    use crate::device::SimulatedCard;
    use crate::error::DeviceError;
    use crate::packet::tests::{spectrum_buffer, tagged_waveform_buffer, waveform_buffer};
    use crate::persist::raw_file_path;
    use std::sync::mpsc;
    use std::time::Duration;

    const RAW_LEN: usize = 256;

    fn test_config(save: &std::path::Path, duration_ms: u64, packing_ms: u64) -> Config {
        Config {
            save_path: save.to_path_buf(),
            capture_duration_ms: duration_ms,
            packing_duration_ms: packing_ms,
            poll_interval_us: 10,
            poll_timeout_ms: 200,
            raw_buffer_bytes: RAW_LEN,
            drain_quiet_secs: 0,
            display_camera: 3,
            ..Default::default()
        }
    }

    fn good_card() -> SimulatedCard {
        SimulatedCard::new(waveform_buffer(RAW_LEN, 1), spectrum_buffer(7), 2)
    }

    #[test]
    fn test_session_counts_down() {
        let config = test_config(std::path::Path::new("/data"), 100, 50);
        let mut session = CaptureSession::new(2, &config, "7");
        assert_eq!(session.target_packs, 2);
        assert_eq!(session.directory, PathBuf::from("/data/shot_7"));
        session.packs_remaining -= 1;
        assert_eq!(session.packs_done(), 1);
    }

    #[test]
    fn test_full_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 20, 5);
        let sim = good_card();
        let card = sim.card(1);
        let cancel = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel();

        let summary = run_capture(&card, &config, "1", &cancel, &tx).unwrap();
        assert_eq!(summary.packs_captured, 4);
        assert_eq!(summary.corrupt_packs, 0);
        assert!(!summary.cancelled);
        assert_eq!(summary.persist.packs_written, 4);
        assert!(!card.is_running());

        let shot_dir = config.shot_directory("1");
        for idx in 1..=4 {
            let raw = std::fs::read(raw_file_path(&shot_dir, 1, idx)).unwrap();
            assert_eq!(raw.len(), RAW_LEN);
        }

        // arm, then (clear, arm) per pack except the last which only clears
        let words = sim.written_words();
        assert_eq!(&words[..4], &ARM_SEQUENCE);
        assert_eq!(words.len(), 4 + 3 * (2 + 4) + 2);
        assert_eq!(&words[words.len() - 2..], &CLEAR_FULL_SEQUENCE);

        let statuses: Vec<CardStatus> = rx.try_iter().collect();
        let progress = statuses
            .iter()
            .filter(|s| matches!(s.kind, StatusKind::Progress))
            .count();
        assert_eq!(progress, 4);
        let spectrum = statuses
            .iter()
            .find_map(|s| match &s.kind {
                StatusKind::Spectrum(records) => Some(records.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(spectrum.len(), SPECTRUM_RECORDS_PER_PACK);
        assert_eq!(spectrum[0].channel, 3);
        assert_eq!(spectrum[0].block, 7);
        let last = statuses.last().unwrap();
        assert!(matches!(last.kind, StatusKind::Finished));
        assert_eq!(last.progress, 1.0);
    }

    #[test]
    fn test_display_camera_selects_waveform_and_spectrum() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 5, 5);
        config.display_camera = 1;
        let sim = SimulatedCard::new(tagged_waveform_buffer(RAW_LEN, 1), spectrum_buffer(2), 0);
        let card = sim.card(1);
        let (tx, rx) = mpsc::channel();
        run_capture(&card, &config, "w", &AtomicBool::new(false), &tx).unwrap();

        let statuses: Vec<CardStatus> = rx.try_iter().collect();
        let waveform = statuses
            .iter()
            .find_map(|s| match &s.kind {
                StatusKind::Waveform(pulse) => Some(pulse.clone()),
                _ => None,
            })
            .unwrap();
        // camera 1 shows waveform channel 0: 14 groups of 2 samples in a 256 byte pack
        let samples = waveform.samples();
        assert_eq!(&samples[..4], &[100, 101, 102, 103]);
        assert_eq!(samples[27], 127);
        assert_eq!(samples[28], 0);

        let spectrum = statuses
            .iter()
            .find_map(|s| match &s.kind {
                StatusKind::Spectrum(records) => Some(records.clone()),
                _ => None,
            })
            .unwrap();
        assert!(spectrum.iter().all(|r| r.channel == 1));
        assert_eq!(spectrum[0].gamma[3], 103);

        let waveform_at = statuses
            .iter()
            .position(|s| matches!(s.kind, StatusKind::Waveform(_)))
            .unwrap();
        let progress_at = statuses
            .iter()
            .position(|s| matches!(s.kind, StatusKind::Progress))
            .unwrap();
        assert!(waveform_at < progress_at);
    }

    #[test]
    fn test_corrupt_packs_are_counted_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 10, 5);
        let sim = SimulatedCard::new(vec![0u8; RAW_LEN], spectrum_buffer(1), 0);
        let card = sim.card(2);
        let (tx, _rx) = mpsc::channel();
        let summary = run_capture(&card, &config, "c", &AtomicBool::new(false), &tx).unwrap();
        assert_eq!(summary.packs_captured, 2);
        assert_eq!(summary.corrupt_packs, 2);
        assert_eq!(summary.persist.packs_written, 2);
    }

    #[test]
    fn test_cancel_before_first_pack() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 1000, 5);
        let card = good_card().card(1);
        let (tx, rx) = mpsc::channel();
        let summary = run_capture(&card, &config, "x", &AtomicBool::new(true), &tx).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.packs_captured, 0);
        assert!(rx
            .try_iter()
            .any(|s| matches!(s.kind, StatusKind::Finished)));
    }

    #[test]
    fn test_stalled_card_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 100, 5);
        config.poll_timeout_ms = 20;
        let card = good_card().stalled().card(1);
        let (tx, _rx) = mpsc::channel();
        match run_capture(&card, &config, "s", &AtomicBool::new(false), &tx) {
            Err(CaptureError::DeviceError(DeviceError::Timeout { expected, .. })) => {
                assert_eq!(expected, STATUS_FULL)
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert!(!card.is_running());
    }

    #[test]
    fn test_cycles_are_paced() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 60, 20);
        let card = good_card().card(1);
        let (tx, _rx) = mpsc::channel();
        let start = Instant::now();
        let summary = run_capture(&card, &config, "p", &AtomicBool::new(false), &tx).unwrap();
        assert_eq!(summary.packs_captured, 3);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_busy_card_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 10, 5);
        let card = good_card().card(5);
        let _held = card.claim().unwrap();
        let (tx, _rx) = mpsc::channel();
        assert!(matches!(
            run_capture(&card, &config, "b", &AtomicBool::new(false), &tx),
            Err(CaptureError::DeviceError(DeviceError::Busy(5)))
        ));
    }
}
