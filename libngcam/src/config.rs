use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::macros::format_description;

use super::command::{Command, CommandFrame};
use super::constants::*;
use super::error::ConfigError;
use super::persist::OverflowPolicy;
use super::psd::PsdParameters;

/// Device nodes of one card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardPaths {
    pub data_path: PathBuf,
    pub control_path: PathBuf,
}

/// Structure representing the application configuration. Contains device, acquisition and
/// analysis settings.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub cards: Vec<CardPaths>,
    pub save_path: PathBuf,
    pub shot: Option<String>,
    pub capture_duration_ms: u64,
    pub packing_duration_ms: u64,
    pub poll_interval_us: u64,
    pub poll_timeout_ms: u64,
    pub raw_buffer_bytes: usize,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub drain_quiet_secs: u64,
    pub pin_threads: bool,
    pub display_camera: usize,
    #[serde(default = "default_big_endian")]
    pub big_endian_samples: bool,
    pub device_ip: String,
    pub device_port: u16,
    pub dead_time: u32,
    pub trigger_threshold: u32,
    pub trigger_mode: u32,
    pub waveform_mode: u32,
    pub waveform_length: u32,
    pub spectrum_refresh_ms: u32,
    pub pulse_path: Option<PathBuf>,
    pub pulse_dataset: String,
    pub density_levels: usize,
    #[serde(default)]
    pub psd: PsdParameters,
}

impl Default for Config {
    /// Generate a new Config object with the standard instrument settings and no cards
    fn default() -> Self {
        Self {
            cards: vec![],
            save_path: PathBuf::from("None"),
            shot: None,
            capture_duration_ms: 1000,
            packing_duration_ms: PACKING_DURATION_MS,
            poll_interval_us: 10,
            poll_timeout_ms: 5000,
            raw_buffer_bytes: RAW_BUFFER_SIZE,
            queue_capacity: 16,
            overflow_policy: OverflowPolicy::Block,
            drain_quiet_secs: DRAIN_QUIET_SECS,
            pin_threads: true,
            display_camera: 1,
            big_endian_samples: true,
            device_ip: String::from("192.168.1.10"),
            device_port: 8080,
            dead_time: 0,
            trigger_threshold: 100,
            trigger_mode: 0,
            waveform_mode: 0,
            waveform_length: PULSE_LENGTH as u32,
            spectrum_refresh_ms: 1000,
            pulse_path: None,
            pulse_dataset: String::from("waveform"),
            density_levels: DEFAULT_DENSITY_LEVELS,
            psd: PsdParameters::default(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        std::fs::write(config_path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Check the values a capture run depends on
    pub fn validate_capture(&self) -> Result<(), ConfigError> {
        if self.packing_duration_ms == 0 {
            return Err(ConfigError::InvalidValue("packing_duration_ms"));
        }
        if self.raw_buffer_bytes < 2 * BLOCK_SIZE {
            return Err(ConfigError::InvalidValue("raw_buffer_bytes"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("queue_capacity"));
        }
        if self.display_camera == 0 {
            return Err(ConfigError::InvalidValue("display_camera"));
        }
        Ok(())
    }

    /// Check the values an offline analysis depends on
    pub fn validate_analysis(&self) -> Result<(), ConfigError> {
        if self.pulse_path.is_none() {
            return Err(ConfigError::InvalidValue("pulse_path"));
        }
        if self.density_levels < 2 {
            return Err(ConfigError::InvalidValue("density_levels"));
        }
        Ok(())
    }

    /// Number of packs a capture of `capture_duration_ms` takes
    pub fn target_packs(&self) -> u64 {
        target_pack_count(self.capture_duration_ms, self.packing_duration_ms)
    }

    /// Directory a shot's packs are written to
    pub fn shot_directory(&self, shot: &str) -> PathBuf {
        self.save_path.join(format!("shot_{shot}"))
    }

    pub fn packing_duration(&self) -> Duration {
        Duration::from_millis(self.packing_duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_quiet(&self) -> Duration {
        Duration::from_secs(self.drain_quiet_secs)
    }

    /// Address of the instrument's command port
    pub fn command_address(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .device_ip
            .parse()
            .map_err(|_| ConfigError::InvalidValue("device_ip"))?;
        Ok(SocketAddr::new(ip, self.device_port))
    }

    /// The configuration frames that bring the instrument in line with this config
    pub fn online_frames(&self) -> Vec<CommandFrame> {
        vec![
            CommandFrame::new(Command::DeadTime, 0, self.dead_time),
            CommandFrame::new(Command::TriggerThreshold, 0, self.trigger_threshold),
            CommandFrame::new(Command::WaveformMode, 0, self.waveform_mode),
            CommandFrame::new(Command::WaveformMode, 1, self.waveform_length),
            CommandFrame::new(Command::SpectrumRefresh, 0, self.spectrum_refresh_ms),
            CommandFrame::new(Command::WorkMode, 0, self.trigger_mode),
        ]
    }
}

/// `ceil(duration / packing) + 0.4`, truncated
pub fn target_pack_count(duration_ms: u64, packing_ms: u64) -> u64 {
    if packing_ms == 0 {
        return 0;
    }
    ((duration_ms as f64 / packing_ms as f64).ceil() + PACK_COUNT_ROUNDING) as u64
}

/// A shot identifier from the current UTC time, e.g. `20260131_235959`
pub fn default_shot() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

fn default_big_endian() -> bool {
    true
}
