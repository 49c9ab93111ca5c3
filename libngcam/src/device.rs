//! Thin synchronous register access to a DMA card.
//!
//! A card exposes two channels opened from the OS: a data channel the raw waveform buffer is
//! read from, and a control/status channel which takes 4-byte little-endian command words at
//! [`CONTROL_REGISTER_OFFSET`] and answers 1-byte status reads at [`STATUS_REGISTER_OFFSET`].
//! The spectrum buffer is read from the control/status channel as well.
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::constants::*;
use super::error::DeviceError;
use super::packet::{framed_spectrum_buffer, framed_waveform_buffer};

/// Absolute-offset IO on a device handle
pub trait DeviceChannel: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()>;
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()>;
}

/// A device node (or any regular file) opened for read/write
#[derive(Debug)]
pub struct FileChannel {
    file: File,
    path: PathBuf,
}

impl FileChannel {
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DeviceError::Open(path.to_path_buf(), e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(target_family = "unix")]
impl DeviceChannel for FileChannel {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }
}

#[cfg(target_family = "windows")]
impl DeviceChannel for FileChannel {
    fn read_at(&self, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_read(buf, offset)? {
                0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
                n => {
                    let rest = buf;
                    buf = &mut rest[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }

    fn write_at(&self, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_write(buf, offset)? {
                0 => return Err(std::io::ErrorKind::WriteZero.into()),
                n => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}

/// One physical acquisition board.
///
/// Cards live for the whole process. A capture session borrows a card through [`Card::claim`],
/// which guarantees that only one thread addresses the card's channels at a time.
pub struct Card {
    index: usize,
    data: Box<dyn DeviceChannel>,
    control: Box<dyn DeviceChannel>,
    running: AtomicBool,
}

impl std::fmt::Debug for Card {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Card")
            .field("index", &self.index)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Card {
    /// Create a card from already opened channels. `index` is 1-based.
    pub fn new(
        index: usize,
        data: Box<dyn DeviceChannel>,
        control: Box<dyn DeviceChannel>,
    ) -> Self {
        Self {
            index,
            data,
            control,
            running: AtomicBool::new(false),
        }
    }

    /// Open both device nodes of a card
    pub fn open(index: usize, data_path: &Path, control_path: &Path) -> Result<Self, DeviceError> {
        let data = FileChannel::open(data_path)?;
        let control = FileChannel::open(control_path)?;
        spdlog::info!(
            "Opened card {index}: data {}, control {}",
            data.path().display(),
            control.path().display()
        );
        Ok(Self::new(index, Box::new(data), Box::new(control)))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Take exclusive use of the card. The claim is released on drop.
    pub fn claim(&self) -> Result<CardClaim<'_>, DeviceError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DeviceError::Busy(self.index))?;
        Ok(CardClaim { card: self })
    }
}

/// Exclusive access to a card's channels for the duration of a capture session
#[derive(Debug)]
pub struct CardClaim<'a> {
    card: &'a Card,
}

impl<'a> CardClaim<'a> {
    pub fn index(&self) -> usize {
        self.card.index
    }

    pub fn registers(&self, poll_interval: Duration, timeout: Duration) -> Registers<'a> {
        Registers {
            channel: self.card.control.as_ref(),
            poll_interval,
            timeout,
        }
    }

    /// Read the full raw waveform buffer from the data channel
    pub fn read_raw(&self, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.card
            .data
            .read_at(buf, DATA_READ_OFFSET)
            .map_err(|source| DeviceError::Io {
                offset: DATA_READ_OFFSET,
                source,
            })
    }

    /// Read the full spectrum buffer from the control/status channel
    pub fn read_spectrum(&self, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.card
            .control
            .read_at(buf, STATUS_REGISTER_OFFSET)
            .map_err(|source| DeviceError::Io {
                offset: STATUS_REGISTER_OFFSET,
                source,
            })
    }

    /// Write an arbitrary byte frame to the control register
    pub fn write_frame(&self, frame: &[u8]) -> Result<(), DeviceError> {
        self.card
            .control
            .write_at(frame, CONTROL_REGISTER_OFFSET)
            .map_err(|source| DeviceError::Io {
                offset: CONTROL_REGISTER_OFFSET,
                source,
            })
    }
}

impl Drop for CardClaim<'_> {
    fn drop(&mut self) {
        self.card.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Reached,
    Cancelled,
}

/// Register-level handshake on a claimed card's control channel
pub struct Registers<'a> {
    channel: &'a dyn DeviceChannel,
    poll_interval: Duration,
    timeout: Duration,
}

impl Registers<'_> {
    pub fn write_word(&self, word: u32) -> Result<(), DeviceError> {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, word);
        self.channel
            .write_at(&bytes, CONTROL_REGISTER_OFFSET)
            .map_err(|source| DeviceError::Io {
                offset: CONTROL_REGISTER_OFFSET,
                source,
            })
    }

    /// Write every word even if one fails; returns the first failure
    pub fn write_sequence(&self, words: &[u32]) -> Result<(), DeviceError> {
        let mut first_error = None;
        for word in words {
            if let Err(e) = self.write_word(*word) {
                spdlog::warn!("Register write of {word:#010x} failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn read_status(&self) -> Result<u8, DeviceError> {
        let mut status = [0u8; 1];
        self.channel
            .read_at(&mut status, STATUS_REGISTER_OFFSET)
            .map_err(|source| DeviceError::Io {
                offset: STATUS_REGISTER_OFFSET,
                source,
            })?;
        Ok(status[0])
    }

    /// Spin on the status register until it reads `expected`.
    ///
    /// The cancel flag is checked before every read. Failed reads are logged and retried until
    /// the timeout runs out.
    pub fn wait_for_status(
        &self,
        expected: u8,
        cancel: &AtomicBool,
    ) -> Result<PollOutcome, DeviceError> {
        let start = Instant::now();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(PollOutcome::Cancelled);
            }
            match self.read_status() {
                Ok(status) if status == expected => return Ok(PollOutcome::Reached),
                Ok(_) => (),
                Err(e) => spdlog::warn!("Status read failed: {e}"),
            }
            if start.elapsed() >= self.timeout {
                return Err(DeviceError::Timeout {
                    expected,
                    timeout: self.timeout,
                });
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Issue the arm sequence. Failures are logged; arming is safe to repeat.
    pub fn arm(&self) {
        if let Err(e) = self.write_sequence(&ARM_SEQUENCE) {
            spdlog::error!("Arm sequence incomplete: {e}");
        }
    }

    /// Wait for the buffers to report full
    pub fn wait_full(&self, cancel: &AtomicBool) -> Result<PollOutcome, DeviceError> {
        self.wait_for_status(STATUS_FULL, cancel)
    }

    /// Clear the full flag and wait for the status register to report empty
    pub fn clear_full(&self, cancel: &AtomicBool) -> Result<PollOutcome, DeviceError> {
        if let Err(e) = self.write_sequence(&CLEAR_FULL_SEQUENCE) {
            spdlog::error!("Clear sequence incomplete: {e}");
        }
        self.wait_for_status(STATUS_EMPTY, cancel)
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    status: u8,
    armed: bool,
    polls_until_full: u32,
    fill_after: u32,
    never_fill: bool,
    raw: Vec<u8>,
    spectrum: Vec<u8>,
    words: Vec<u32>,
    frames: Vec<Vec<u8>>,
}

/// In-memory stand-in for a card, used for dry runs and tests.
///
/// Writing the arm sequence makes the status register report full after `fill_after` status
/// reads; writing the clear sequence makes it report empty again.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCard {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedCard {
    pub fn new(raw: Vec<u8>, spectrum: Vec<u8>, fill_after: u32) -> Self {
        let state = SimulatedState {
            fill_after,
            raw,
            spectrum,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A simulation serving empty packs with valid framing
    pub fn framed(raw_len: usize, fill_after: u32) -> Self {
        Self::new(
            framed_waveform_buffer(raw_len, 1),
            framed_spectrum_buffer(1),
            fill_after,
        )
    }

    /// The status register never reports full
    pub fn stalled(self) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.never_fill = true;
        }
        self
    }

    /// Build a card backed by this simulation
    pub fn card(&self, index: usize) -> Card {
        Card::new(
            index,
            Box::new(MemoryChannel {
                state: self.state.clone(),
                role: ChannelRole::Data,
            }),
            Box::new(MemoryChannel {
                state: self.state.clone(),
                role: ChannelRole::Control,
            }),
        )
    }

    /// Every command word written to the control register so far
    pub fn written_words(&self) -> Vec<u32> {
        self.state
            .lock()
            .map(|state| state.words.clone())
            .unwrap_or_default()
    }

    /// Every frame that was not a single command word
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .map(|state| state.frames.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
enum ChannelRole {
    Data,
    Control,
}

#[derive(Debug)]
struct MemoryChannel {
    state: Arc<Mutex<SimulatedState>>,
    role: ChannelRole,
}

fn poisoned() -> std::io::Error {
    std::io::Error::other("simulated card state poisoned")
}

fn copy_padded(src: &[u8], dst: &mut [u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(0);
}

impl DeviceChannel for MemoryChannel {
    fn read_at(&self, buf: &mut [u8], _offset: u64) -> std::io::Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        match self.role {
            ChannelRole::Data => copy_padded(&state.raw, buf),
            ChannelRole::Control if buf.len() == 1 => {
                if state.armed && state.status == STATUS_EMPTY && !state.never_fill {
                    if state.polls_until_full == 0 {
                        state.status = STATUS_FULL;
                    } else {
                        state.polls_until_full -= 1;
                    }
                }
                buf[0] = state.status;
            }
            ChannelRole::Control => copy_padded(&state.spectrum, buf),
        }
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if let ChannelRole::Data = self.role {
            return Err(std::io::Error::other("data channel is read only"));
        }
        if offset != CONTROL_REGISTER_OFFSET {
            return Err(std::io::ErrorKind::InvalidInput.into());
        }
        if buf.len() != 4 {
            state.frames.push(buf.to_vec());
            return Ok(());
        }
        let word = LittleEndian::read_u32(buf);
        state.words.push(word);
        if word == ARM_SEQUENCE[2] {
            state.armed = true;
            state.polls_until_full = state.fill_after;
        } else if word == CLEAR_FULL_SEQUENCE[0] {
            state.status = STATUS_EMPTY;
            state.armed = false;
        }
        Ok(())
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    fn registers<'a>(claim: &CardClaim<'a>) -> Registers<'a> {
        claim.registers(Duration::from_micros(10), Duration::from_millis(200))
    }

    #[test]
    fn test_words_are_little_endian() {
        let sim = SimulatedCard::new(vec![], vec![], 0);
        let card = sim.card(1);
        let claim = card.claim().unwrap();
        registers(&claim).write_word(0x01E03412).unwrap();
        assert_eq!(sim.written_words(), vec![0x01E03412]);
    }

    #[test]
    fn test_arm_then_clear() {
        let sim = SimulatedCard::new(vec![], vec![], 3);
        let card = sim.card(1);
        let claim = card.claim().unwrap();
        let regs = registers(&claim);
        let cancel = AtomicBool::new(false);
        regs.arm();
        assert_eq!(regs.wait_full(&cancel).unwrap(), PollOutcome::Reached);
        assert_eq!(regs.read_status().unwrap(), STATUS_FULL);
        assert_eq!(regs.clear_full(&cancel).unwrap(), PollOutcome::Reached);
        assert_eq!(regs.read_status().unwrap(), STATUS_EMPTY);
        let mut expected = ARM_SEQUENCE.to_vec();
        expected.extend_from_slice(&CLEAR_FULL_SEQUENCE);
        assert_eq!(sim.written_words(), expected);
    }

    #[test]
    fn test_stalled_card_times_out() {
        let sim = SimulatedCard::new(vec![], vec![], 0).stalled();
        let card = sim.card(2);
        let claim = card.claim().unwrap();
        let regs = claim.registers(Duration::from_micros(50), Duration::from_millis(20));
        let cancel = AtomicBool::new(false);
        regs.arm();
        match regs.wait_full(&cancel) {
            Err(DeviceError::Timeout { expected, .. }) => assert_eq!(expected, STATUS_FULL),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_breaks_poll() {
        let sim = SimulatedCard::new(vec![], vec![], 0).stalled();
        let card = sim.card(1);
        let claim = card.claim().unwrap();
        let cancel = AtomicBool::new(true);
        let regs = registers(&claim);
        regs.arm();
        assert_eq!(regs.wait_full(&cancel).unwrap(), PollOutcome::Cancelled);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let sim = SimulatedCard::new(vec![], vec![], 0);
        let card = sim.card(4);
        let claim = card.claim().unwrap();
        assert!(card.is_running());
        assert!(matches!(card.claim(), Err(DeviceError::Busy(4))));
        drop(claim);
        assert!(!card.is_running());
        assert!(card.claim().is_ok());
    }

    #[test]
    fn test_buffers_read_from_their_channels() {
        let sim = SimulatedCard::new(vec![1, 2, 3], vec![9; 8], 0);
        let card = sim.card(1);
        let claim = card.claim().unwrap();
        let mut raw = [0u8; 5];
        claim.read_raw(&mut raw).unwrap();
        assert_eq!(raw, [1, 2, 3, 0, 0]);
        let mut spec = [0u8; 4];
        claim.read_spectrum(&mut spec).unwrap();
        assert_eq!(spec, [9; 4]);
    }
}
