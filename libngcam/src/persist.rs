use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::error::PersistError;

const RECV_POLL: Duration = Duration::from_millis(100);

/// What the capture thread does when the persistence queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Wait for the worker to make room
    #[default]
    Block,
    /// Discard the oldest queued pack to make room
    DropOldest,
}

/// One drained raw + spectrum buffer pair
#[derive(Debug, Clone, Default)]
pub struct Pack {
    pub raw: Vec<u8>,
    pub spectrum: Vec<u8>,
}

/// Producer side of the bounded pack queue
#[derive(Debug)]
pub struct PackQueue {
    tx: Sender<Pack>,
    // Only held under DropOldest, to evict from the front of the queue
    evict: Option<Receiver<Pack>>,
    policy: OverflowPolicy,
    dropped: u64,
}

impl PackQueue {
    pub fn bounded(capacity: usize, policy: OverflowPolicy) -> (Self, Receiver<Pack>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let queue = Self {
            tx,
            evict: match policy {
                OverflowPolicy::Block => None,
                OverflowPolicy::DropOldest => Some(rx.clone()),
            },
            policy,
            dropped: 0,
        };
        (queue, rx)
    }

    /// Hand a pack to the consumer. Returns false if the consumer is gone.
    pub fn push(&mut self, mut pack: Pack) -> bool {
        match self.policy {
            OverflowPolicy::Block => self.tx.send(pack).is_ok(),
            OverflowPolicy::DropOldest => loop {
                match self.tx.try_send(pack) {
                    Ok(()) => return true,
                    Err(TrySendError::Full(returned)) => {
                        let evicted = self.evict.as_ref().map(|rx| rx.try_recv().is_ok());
                        if evicted == Some(true) {
                            self.dropped += 1;
                            spdlog::warn!(
                                "Persistence queue full, dropped oldest pack ({} so far)",
                                self.dropped
                            );
                        }
                        pack = returned;
                    }
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            },
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub packs_written: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    pub packs_dropped: u64,
}

/// Path of the raw buffer file for a pack
pub fn raw_file_path(directory: &Path, card: usize, pack_index: u64) -> PathBuf {
    directory.join(format!("{card}data{pack_index}.bin"))
}

/// Path of the spectrum buffer file for a pack
pub fn spectrum_file_path(directory: &Path, card: usize, pack_index: u64) -> PathBuf {
    directory.join(format!("{card}spec{pack_index}.bin"))
}

/// Write-behind worker streaming one card's packs to numbered files.
///
/// The capture thread never touches the disk; it only pushes into the bounded queue. On
/// [`PersistWorker::finish`] the worker keeps draining until the queue has stayed empty for
/// the quiet period or every producer is gone, so a normal stop loses nothing.
#[derive(Debug)]
pub struct PersistWorker {
    card: usize,
    queue: PackQueue,
    exit: Arc<AtomicBool>,
    handle: JoinHandle<PersistSummary>,
}

impl PersistWorker {
    pub fn spawn(
        card: usize,
        directory: &Path,
        capacity: usize,
        policy: OverflowPolicy,
        drain_quiet: Duration,
    ) -> Result<Self, PersistError> {
        std::fs::create_dir_all(directory)?;
        let (queue, rx) = PackQueue::bounded(capacity, policy);
        let exit = Arc::new(AtomicBool::new(false));
        let worker_exit = exit.clone();
        let dir = directory.to_path_buf();
        let handle = std::thread::Builder::new()
            .name(format!("persist-{card}"))
            .spawn(move || write_packs(card, &dir, rx, &worker_exit, drain_quiet))?;
        spdlog::info!(
            "Persistence worker for card {card} writing to {}",
            directory.display()
        );
        Ok(Self {
            card,
            queue,
            exit,
            handle,
        })
    }

    pub fn submit(&mut self, pack: Pack) -> Result<(), PersistError> {
        if !self.handle.is_finished() && self.queue.push(pack) {
            Ok(())
        } else {
            Err(PersistError::Disconnected(self.card))
        }
    }

    /// Signal exit and join the worker once the queue has been empty for the quiet period.
    ///
    /// The producer side stays connected until the worker is joined.
    pub fn finish(self) -> Result<PersistSummary, PersistError> {
        self.exit.store(true, Ordering::Release);
        let joined = self.handle.join();
        let dropped = self.queue.dropped();
        drop(self.queue);
        let mut summary = joined.map_err(|_| PersistError::Panicked(self.card))?;
        summary.packs_dropped = dropped;
        Ok(summary)
    }
}

fn write_pack(directory: &Path, card: usize, pack_index: u64, pack: &Pack) -> std::io::Result<u64> {
    std::fs::write(raw_file_path(directory, card, pack_index), &pack.raw)?;
    std::fs::write(spectrum_file_path(directory, card, pack_index), &pack.spectrum)?;
    Ok((pack.raw.len() + pack.spectrum.len()) as u64)
}

fn write_packs(
    card: usize,
    directory: &Path,
    rx: Receiver<Pack>,
    exit: &AtomicBool,
    drain_quiet: Duration,
) -> PersistSummary {
    let mut summary = PersistSummary::default();
    let mut pack_index: u64 = 1;
    let mut idle_since: Option<Instant> = None;
    loop {
        match rx.recv_timeout(RECV_POLL) {
            Ok(pack) => {
                idle_since = None;
                match write_pack(directory, card, pack_index, &pack) {
                    Ok(bytes) => {
                        summary.packs_written += 1;
                        summary.bytes_written += bytes;
                    }
                    Err(e) => {
                        summary.write_failures += 1;
                        spdlog::error!("Card {card} failed to write pack {pack_index}: {e}");
                    }
                }
                pack_index += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                if exit.load(Ordering::Acquire) {
                    let since = idle_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= drain_quiet {
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    spdlog::info!(
        "Card {card} persisted {} packs ({})",
        summary.packs_written,
        human_bytes::human_bytes(summary.bytes_written as f64)
    );
    summary
}
