use bit_set::BitSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::capture::{run_capture, CaptureSummary};
use super::command::{write_to_card, Command, CommandFrame, CommandLink, UdpCommandLink};
use super::config::{default_shot, Config};
use super::device::Card;
use super::error::{CaptureError, CoordinatorError};
use super::persist::OverflowPolicy;
use super::worker_status::{CardStatus, StatusKind};

/// Shared record of which cards are done with the current run
#[derive(Debug)]
pub struct FinishedSet {
    cards: Mutex<BitSet>,
    total: usize,
}

impl FinishedSet {
    pub fn new(total: usize) -> Self {
        Self {
            cards: Mutex::new(BitSet::with_capacity(total + 1)),
            total,
        }
    }

    /// Mark a card finished. Returns true only for the call that completes the set.
    pub fn mark(&self, card: usize) -> bool {
        let mut cards = match self.cards.lock() {
            Ok(cards) => cards,
            Err(poisoned) => poisoned.into_inner(),
        };
        cards.insert(card) && cards.len() == self.total
    }

    pub fn count(&self) -> usize {
        match self.cards.lock() {
            Ok(cards) => cards.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.total
    }
}

/// Acquisition settings that only take effect on the next run
#[derive(Debug, Clone, Default)]
pub struct OfflineParameters {
    pub capture_duration_ms: Option<u64>,
    pub packing_duration_ms: Option<u64>,
    pub save_path: Option<PathBuf>,
    pub shot: Option<String>,
    pub display_camera: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub overflow_policy: Option<OverflowPolicy>,
}

/// Pin the calling thread to one core
#[cfg(target_os = "linux")]
fn pin_current_thread(core: usize) -> std::io::Result<()> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(std::io::ErrorKind::InvalidInput.into());
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(_core: usize) -> std::io::Result<()> {
    Err(std::io::ErrorKind::Unsupported.into())
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Owns every card and fans capture runs out to one thread per card.
///
/// Status messages from all capture threads arrive on a single channel; the thread that
/// finishes last also reports [`StatusKind::AllFinished`].
pub struct Coordinator {
    config: Config,
    cards: Vec<Arc<Card>>,
    workers: Vec<(usize, JoinHandle<Result<CaptureSummary, CaptureError>>)>,
    cancel: Arc<AtomicBool>,
    finished: Arc<FinishedSet>,
    status_tx: Sender<CardStatus>,
    status_rx: Receiver<CardStatus>,
    link: Option<Box<dyn CommandLink>>,
    shot: Option<String>,
}

impl Coordinator {
    pub fn new(config: Config, cards: Vec<Card>) -> Self {
        let (status_tx, status_rx) = mpsc::channel::<CardStatus>();
        let n_cards = cards.len();
        Self {
            config,
            cards: cards.into_iter().map(Arc::new).collect(),
            workers: vec![],
            cancel: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(FinishedSet::new(n_cards)),
            status_tx,
            status_rx,
            link: None,
            shot: None,
        }
    }

    /// Open every card listed in the config. Cards are numbered from 1 in config order.
    pub fn open(config: Config) -> Result<Self, CoordinatorError> {
        if config.cards.is_empty() {
            return Err(CoordinatorError::NoCards);
        }
        let mut cards = Vec::with_capacity(config.cards.len());
        for (idx, paths) in config.cards.iter().enumerate() {
            cards.push(Card::open(idx + 1, &paths.data_path, &paths.control_path)?);
        }
        spdlog::info!("Opened {} cards", cards.len());
        Ok(Self::new(config, cards))
    }

    pub fn with_command_link(mut self, link: Box<dyn CommandLink>) -> Self {
        self.link = Some(link);
        self
    }

    /// Use a UDP link to the instrument address in the config for online parameters
    pub fn connect_command_link(&mut self) -> Result<(), CoordinatorError> {
        let link = UdpCommandLink::connect(self.config.command_address()?)?;
        self.link = Some(Box::new(link));
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn n_cards(&self) -> usize {
        self.cards.len()
    }

    /// Shot identifier of the current or last run
    pub fn shot(&self) -> Option<&str> {
        self.shot.as_deref()
    }

    /// Check if there are any capture threads still doing stuff
    pub fn is_running(&self) -> bool {
        self.workers.iter().any(|(_, worker)| !worker.is_finished())
    }

    pub fn all_finished(&self) -> bool {
        self.finished.is_complete()
    }

    /// Start a run on every card. The shot falls back to the config, then to the current time.
    pub fn start(&mut self, shot: Option<&str>) -> Result<String, CoordinatorError> {
        if self.is_running() {
            return Err(CoordinatorError::CaptureRunning("capture"));
        }
        if self.cards.is_empty() {
            return Err(CoordinatorError::NoCards);
        }
        self.config.validate_capture()?;
        if !self.workers.is_empty() {
            spdlog::warn!("Collecting results of the previous run before starting");
            for result in self.join() {
                if let Err(e) = result {
                    spdlog::error!("Previous run: {e}");
                }
            }
        }

        let shot = shot
            .map(str::to_string)
            .or_else(|| self.config.shot.clone())
            .unwrap_or_else(default_shot);
        self.cancel.store(false, Ordering::SeqCst);
        self.finished = Arc::new(FinishedSet::new(self.cards.len()));
        let cores = available_cores();
        let shared_config = Arc::new(self.config.clone());

        for (k, card) in self.cards.iter().enumerate() {
            let card = card.clone();
            let config = shared_config.clone();
            let cancel = self.cancel.clone();
            let finished = self.finished.clone();
            let tx = self.status_tx.clone();
            let run_shot = shot.clone();
            let index = card.index();
            let core = k % cores;
            let handle = std::thread::Builder::new()
                .name(format!("capture-{index}"))
                .spawn(move || {
                    if config.pin_threads {
                        match pin_current_thread(core) {
                            Ok(()) => spdlog::debug!("Card {index} pinned to core {core}"),
                            Err(e) => spdlog::warn!("Card {index} could not be pinned: {e}"),
                        }
                    }
                    let result = run_capture(&card, &config, &run_shot, &cancel, &tx);
                    if let Err(e) = &result {
                        spdlog::error!("Card {index} capture failed: {e}");
                        let _ = tx.send(CardStatus::new(index, 0, 0, StatusKind::Failed(e.to_string())));
                    }
                    if finished.mark(index) {
                        spdlog::info!("All cards finished");
                        let _ = tx.send(CardStatus::new(index, 0, 0, StatusKind::AllFinished));
                    }
                    result
                })?;
            self.workers.push((index, handle));
        }
        spdlog::info!(
            "Started shot {} on {} cards ({} packs each)",
            shot,
            self.cards.len(),
            self.config.target_packs()
        );
        self.shot = Some(shot.clone());
        Ok(shot)
    }

    /// Ask every capture thread to stop at its next poll, then wait for them
    pub fn stop(&mut self) -> Vec<Result<CaptureSummary, CoordinatorError>> {
        spdlog::info!("Stop requested");
        self.cancel.store(true, Ordering::SeqCst);
        self.join()
    }

    /// Wait for every capture thread and collect its outcome in card order
    pub fn join(&mut self) -> Vec<Result<CaptureSummary, CoordinatorError>> {
        self.workers
            .drain(..)
            .map(|(index, worker)| match worker.join() {
                Ok(Ok(summary)) => Ok(summary),
                Ok(Err(e)) => Err(CoordinatorError::from(e)),
                Err(_) => {
                    spdlog::error!("An error occured joining the capture thread of card {index}!");
                    Err(CoordinatorError::ThreadPanicked(index))
                }
            })
            .collect()
    }

    pub fn recv_status_timeout(&self, timeout: Duration) -> Option<CardStatus> {
        self.status_rx.recv_timeout(timeout).ok()
    }

    /// Change acquisition settings between runs
    pub fn set_offline_parameters(&mut self, params: OfflineParameters) -> Result<(), CoordinatorError> {
        if self.is_running() {
            return Err(CoordinatorError::CaptureRunning("offline parameters"));
        }
        let mut config = self.config.clone();
        if let Some(v) = params.capture_duration_ms {
            config.capture_duration_ms = v;
        }
        if let Some(v) = params.packing_duration_ms {
            config.packing_duration_ms = v;
        }
        if let Some(v) = params.save_path {
            config.save_path = v;
        }
        if let Some(v) = params.shot {
            config.shot = Some(v);
        }
        if let Some(v) = params.display_camera {
            config.display_camera = v;
        }
        if let Some(v) = params.queue_capacity {
            config.queue_capacity = v;
        }
        if let Some(v) = params.overflow_policy {
            config.overflow_policy = v;
        }
        config.validate_capture()?;
        self.config = config;
        Ok(())
    }

    /// Send one configuration frame to the instrument and remember the value.
    ///
    /// Frames go over the command link when one is set, otherwise to each card's control
    /// register. Without a link this is refused while a capture owns the cards.
    pub fn set_online_parameter(&mut self, frame: CommandFrame) -> Result<(), CoordinatorError> {
        self.check_online_allowed()?;
        self.send_frame(&frame)?;
        match (frame.command, frame.sub) {
            (Command::DeadTime, _) => self.config.dead_time = frame.parameter,
            (Command::TriggerThreshold, _) => self.config.trigger_threshold = frame.parameter,
            (Command::WaveformMode, 1) => self.config.waveform_length = frame.parameter,
            (Command::WaveformMode, _) => self.config.waveform_mode = frame.parameter,
            (Command::SpectrumRefresh, _) => self.config.spectrum_refresh_ms = frame.parameter,
            (Command::WorkMode, _) => self.config.trigger_mode = frame.parameter,
            (Command::StartStop, _) => (),
        }
        Ok(())
    }

    /// Push every online parameter of the config to the instrument
    pub fn apply_online_config(&mut self) -> Result<(), CoordinatorError> {
        self.check_online_allowed()?;
        for frame in self.config.online_frames() {
            self.send_frame(&frame)?;
        }
        spdlog::info!("Instrument configured");
        Ok(())
    }

    fn check_online_allowed(&self) -> Result<(), CoordinatorError> {
        if self.link.is_none() && self.is_running() {
            return Err(CoordinatorError::CaptureRunning("online parameters"));
        }
        Ok(())
    }

    fn send_frame(&mut self, frame: &CommandFrame) -> Result<(), CoordinatorError> {
        match self.link.as_mut() {
            Some(link) => link.send(frame)?,
            None => {
                for card in self.cards.iter() {
                    let claim = card.claim()?;
                    write_to_card(&claim, frame)?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            for result in self.stop() {
                if let Err(e) = result {
                    spdlog::error!("Capture error on shutdown: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::RecordingLink;
    use crate::device::SimulatedCard;
    use crate::packet::tests::{spectrum_buffer, waveform_buffer};
    use crate::persist::raw_file_path;
    use std::time::Instant;

    const RAW_LEN: usize = 256;

    fn test_config(save: &std::path::Path) -> Config {
        Config {
            save_path: save.to_path_buf(),
            capture_duration_ms: 60,
            packing_duration_ms: 20,
            poll_interval_us: 10,
            poll_timeout_ms: 5000,
            raw_buffer_bytes: RAW_LEN,
            drain_quiet_secs: 0,
            pin_threads: true,
            ..Default::default()
        }
    }

    fn sim() -> SimulatedCard {
        SimulatedCard::new(waveform_buffer(RAW_LEN, 1), spectrum_buffer(3), 1)
    }

    fn wait_all_finished(coordinator: &Coordinator) -> Vec<CardStatus> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = vec![];
        while Instant::now() < deadline {
            if let Some(status) = coordinator.recv_status_timeout(Duration::from_millis(50)) {
                let done = matches!(status.kind, StatusKind::AllFinished);
                seen.push(status);
                if done {
                    break;
                }
            }
        }
        seen
    }

    #[test]
    fn test_finished_set() {
        let set = FinishedSet::new(2);
        assert!(!set.mark(1));
        assert!(!set.mark(1));
        assert!(set.mark(2));
        assert!(!set.mark(2));
        assert!(set.is_complete());
    }

    #[test]
    fn test_run_two_cards() {
        let dir = tempfile::tempdir().unwrap();
        let sims = [sim(), sim()];
        let cards = vec![sims[0].card(1), sims[1].card(2)];
        let mut coordinator = Coordinator::new(test_config(dir.path()), cards);
        let shot = coordinator.start(Some("7")).unwrap();
        assert_eq!(shot, "7");

        let statuses = wait_all_finished(&coordinator);
        let all_finished = statuses
            .iter()
            .filter(|s| matches!(s.kind, StatusKind::AllFinished))
            .count();
        assert_eq!(all_finished, 1);
        for card in [1, 2] {
            assert!(statuses
                .iter()
                .any(|s| s.card == card && matches!(s.kind, StatusKind::Finished)));
        }

        let results = coordinator.join();
        assert_eq!(results.len(), 2);
        let shot_dir = dir.path().join("shot_7");
        for (result, card) in results.into_iter().zip([1, 2]) {
            let summary = result.unwrap();
            assert_eq!(summary.card, card);
            assert_eq!(summary.packs_captured, 3);
            assert!(raw_file_path(&shot_dir, card, 3).exists());
        }
        assert!(coordinator.all_finished());
    }

    #[test]
    fn test_stop_cancels_stalled_cards() {
        let dir = tempfile::tempdir().unwrap();
        let stalled = sim().stalled();
        let mut coordinator = Coordinator::new(test_config(dir.path()), vec![stalled.card(1)]);
        coordinator.start(Some("stall")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(coordinator.is_running());
        assert!(matches!(
            coordinator.start(None),
            Err(CoordinatorError::CaptureRunning(_))
        ));
        assert!(matches!(
            coordinator.set_offline_parameters(OfflineParameters::default()),
            Err(CoordinatorError::CaptureRunning(_))
        ));

        let results = coordinator.stop();
        let summary = results.into_iter().next().unwrap().unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.packs_captured, 0);
        assert!(!coordinator.is_running());
    }

    #[test]
    fn test_no_cards() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path()), vec![]);
        assert!(matches!(coordinator.start(None), Err(CoordinatorError::NoCards)));
        assert!(matches!(
            Coordinator::open(Config::default()),
            Err(CoordinatorError::NoCards)
        ));
    }

    #[test]
    fn test_offline_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = Coordinator::new(test_config(dir.path()), vec![sim().card(1)]);
        coordinator
            .set_offline_parameters(OfflineParameters {
                capture_duration_ms: Some(500),
                overflow_policy: Some(OverflowPolicy::DropOldest),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(coordinator.config().capture_duration_ms, 500);
        assert_eq!(coordinator.config().overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(coordinator.config().target_packs(), 25);

        let rejected = coordinator.set_offline_parameters(OfflineParameters {
            packing_duration_ms: Some(0),
            ..Default::default()
        });
        assert!(matches!(rejected, Err(CoordinatorError::ConfigError(_))));
        assert_eq!(coordinator.config().packing_duration_ms, 20);
    }

    #[test]
    fn test_online_parameters_over_link() {
        let dir = tempfile::tempdir().unwrap();
        let link = RecordingLink::default();
        let mut coordinator = Coordinator::new(test_config(dir.path()), vec![sim().card(1)])
            .with_command_link(Box::new(link.clone()));
        coordinator
            .set_online_parameter(CommandFrame::new(Command::TriggerThreshold, 0, 250))
            .unwrap();
        coordinator
            .set_online_parameter(CommandFrame::new(Command::WaveformMode, 1, 256))
            .unwrap();
        assert_eq!(coordinator.config().trigger_threshold, 250);
        assert_eq!(coordinator.config().waveform_length, 256);
        coordinator.apply_online_config().unwrap();
        let sent = link.frames();
        assert_eq!(sent.len(), 2 + 6);
        assert_eq!(sent[0], CommandFrame::new(Command::TriggerThreshold, 0, 250));
    }

    #[test]
    fn test_online_parameters_during_run() {
        let dir = tempfile::tempdir().unwrap();
        let link = RecordingLink::default();
        let mut linked = Coordinator::new(test_config(dir.path()), vec![sim().stalled().card(1)])
            .with_command_link(Box::new(link.clone()));
        linked.start(Some("linked")).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(linked.is_running());
        linked
            .set_online_parameter(CommandFrame::new(Command::DeadTime, 0, 7))
            .unwrap();
        assert_eq!(link.frames(), vec![CommandFrame::new(Command::DeadTime, 0, 7)]);
        assert_eq!(linked.config().dead_time, 7);
        linked.stop();

        let stalled = sim().stalled();
        let mut direct = Coordinator::new(test_config(dir.path()), vec![stalled.card(1)]);
        direct.start(Some("direct")).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            direct.set_online_parameter(CommandFrame::new(Command::DeadTime, 0, 7)),
            Err(CoordinatorError::CaptureRunning(_))
        ));
        assert!(stalled.written_frames().is_empty());
        direct.stop();
    }

    #[test]
    fn test_online_parameters_to_cards() {
        let dir = tempfile::tempdir().unwrap();
        let sims = [sim(), sim()];
        let mut coordinator =
            Coordinator::new(test_config(dir.path()), vec![sims[0].card(1), sims[1].card(2)]);
        let frame = CommandFrame::new(Command::DeadTime, 0, 40);
        coordinator.set_online_parameter(frame).unwrap();
        for sim in sims.iter() {
            assert_eq!(sim.written_frames(), vec![frame.encode().to_vec()]);
        }
        assert_eq!(coordinator.config().dead_time, 40);
    }
}
