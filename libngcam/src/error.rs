use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::constants::*;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device channel {0:?} could not be opened: {1}")]
    Open(PathBuf, std::io::Error),
    #[error("Device IO error at offset {offset:#x}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("Device status did not reach {expected} within {timeout:?}")]
    Timeout { expected: u8, timeout: Duration },
    #[error("Card {0} is already capturing")]
    Busy(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("Buffer of {0} bytes is too short; expected at least {1}")]
    TooShort(usize, usize),
    #[error("Bad packet header: magic {magic:#06x} type {kind:#06x}; expected {exp_magic:#06x} {exp_kind:#06x}", exp_magic=HEADER_MAGIC)]
    BadMagic { magic: u16, kind: u16, exp_kind: u16 },
    #[error("Spectrum record index {0} is outside 1..={max}", max=SPECTRUM_RECORDS_PER_PACK)]
    BadRecordIndex(u8),
    #[error("Channel {0} does not exist; cards have {n} channels", n=NUMBER_OF_CHANNELS)]
    BadChannel(usize),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command frame has {0} bytes; expected {exp}", exp=COMMAND_FRAME_SIZE)]
    BadLength(usize),
    #[error("Command frame envelope is malformed")]
    BadEnvelope,
    #[error("Unknown command code {0:#04x}")]
    UnknownCommand(u8),
    #[error("Command link failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Persistence worker failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Persistence worker for card {0} has already shut down")]
    Disconnected(usize),
    #[error("Persistence worker for card {0} panicked")]
    Panicked(usize),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture failed due to device error: {0}")]
    DeviceError(#[from] DeviceError),
    #[error("Capture failed due to persistence error: {0}")]
    PersistError(#[from] PersistError),
    #[error("Capture failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Coordinator failed due to capture error: {0}")]
    CaptureError(#[from] CaptureError),
    #[error("Coordinator failed due to device error: {0}")]
    DeviceError(#[from] DeviceError),
    #[error("Coordinator failed due to command error: {0}")]
    CommandError(#[from] CommandError),
    #[error("Coordinator failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Coordinator cannot change {0} while a capture is running")]
    CaptureRunning(&'static str),
    #[error("Coordinator has no cards")]
    NoCards,
    #[error("Capture thread for card {0} panicked")]
    ThreadPanicked(usize),
    #[error("Coordinator failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PulseSourceError {
    #[error("Pulse source failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("Could not open pulse file {0:?} because it does not exist")]
    BadFilePath(PathBuf),
    #[error("Pulse dataset has {0} samples per pulse; expected {len}", len=PULSE_LENGTH)]
    BadShape(usize),
}

#[derive(Debug, Error)]
pub enum HDF5WriterError {
    #[error("HDF5Writer failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("HDF5Writer failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("HDF5Writer was given channel {0}, boards have four")]
    BadChannel(usize),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("Fit needs at least {need} points, got {got}")]
    TooFewPoints { need: usize, got: usize },
    #[error("Fit normal equations became singular at iteration {0}")]
    Singular(usize),
    #[error("Fit produced non-finite parameters at iteration {0}")]
    NonFinite(usize),
    #[error("Fit did not converge within {0} iterations")]
    NoConvergence(usize),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Analysis failed due to pulse source error: {0}")]
    PulseSourceError(#[from] PulseSourceError),
    #[error("Analysis failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Analysis failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Analysis failed to convert to yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid value for {0}")]
    InvalidValue(&'static str),
}
