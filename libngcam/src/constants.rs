// Control register protocol
pub const CONTROL_REGISTER_OFFSET: u64 = 0x20000;
pub const STATUS_REGISTER_OFFSET: u64 = 0;
pub const DATA_READ_OFFSET: u64 = 0;
pub const STATUS_EMPTY: u8 = 0; // ready to arm
pub const STATUS_FULL: u8 = 1; // buffers full, ready to drain
pub const ARM_SEQUENCE: [u32; 4] = [0x01E03412, 0x00D03412, 0x00E03412, 0x00D03412];
pub const CLEAR_FULL_SEQUENCE: [u32; 2] = [0x01F03412, 0x00D03412];

// Configuration command frame
pub const COMMAND_FRAME_SIZE: usize = 12;
pub const COMMAND_FRAME_HEAD: [u8; 4] = [0x12, 0x34, 0x00, 0x0F];
pub const COMMAND_FRAME_TAIL: [u8; 2] = [0xAB, 0xCD];

// Packet framing
pub const BLOCK_SIZE: usize = 16; // header and trailer
pub const HEADER_MAGIC: u16 = 0xFFAB;
pub const TRAILER_MAGIC: u16 = 0xFFCD;
pub const WAVEFORM_TYPE: u16 = 0x00D3;
pub const SPECTRUM_TYPE: u16 = 0x00D2;

// Buffer geometry
pub const RAW_BUFFER_SIZE: usize = 200_000_000;
pub const NUMBER_OF_CHANNELS: usize = 4;
pub const SPECTRUM_RECORDS_PER_PACK: usize = 50;
pub const SPECTRUM_RECORD_SIZE: usize = 1024;
pub const SPECTRUM_BUFFER_SIZE: usize = SPECTRUM_RECORDS_PER_PACK * SPECTRUM_RECORD_SIZE;
pub const SPECTRUM_BINS: usize = 62;
pub const SPECTRUM_CHANNEL_BYTES: usize = SPECTRUM_BINS * 2; // 124
pub const SPECTRUM_BLOCK_SIZE: usize = NUMBER_OF_CHANNELS * SPECTRUM_CHANNEL_BYTES; // 496

// Timing
pub const PACKING_DURATION_MS: u64 = 50;
pub const PACK_COUNT_ROUNDING: f64 = 0.4;
pub const DRAIN_QUIET_SECS: u64 = 3;

// Pulses
pub const PULSE_LENGTH: usize = 512;
pub const BASELINE_SAMPLES: usize = 16;

// PSD pipeline
pub const PEAK_INDEX_MIN: usize = 20; // 1-based, exclusive
pub const PEAK_INDEX_MAX: usize = 50; // 1-based, exclusive
pub const MIN_RAW_PEAK: i16 = 100;
pub const MIN_UNDERSHOOT: i16 = -70;
pub const CFD_FRACTION: f64 = 0.3;
pub const LONG_GATE_OFFSET: usize = 15;
pub const LONG_GATE_LENGTH: usize = 100;
pub const SHORT_GATE_DELAY: usize = 30;
pub const ENERGY_SLOPE: f64 = 0.5587;
pub const ENERGY_OFFSET: f64 = 34.465;

// Density / histogram / FOM
pub const DEFAULT_DENSITY_LEVELS: usize = 200;
pub const HISTOGRAM_BINS: usize = 501;
pub const HISTOGRAM_STEP: f64 = 0.002;
pub const FOM_ENERGY_MIN: f64 = 600.0; // exclusive
pub const FOM_ENERGY_MAX: f64 = 1000.0; // exclusive
pub const PEAK_MIN_HEIGHT: f64 = 1.0;
pub const PEAK_MIN_SEPARATION: usize = 5;
pub const MAX_PEAKS: usize = 2;
pub const LOW_STATS_MAX_COUNT: f64 = 20.0;
pub const LOW_STATS_TOTAL_COUNT: f64 = 100.0;
pub const FIT_INITIAL_WIDTH: f64 = 0.001;
pub const FIT_DIFF_STEP: f64 = 1.49e-8;
pub const FIT_TOLERANCE: f64 = 1e-6;
pub const FIT_MAX_ITERATIONS: usize = 10_000;
pub const DISPLAY_WIDTH_FACTOR: f64 = 8.0;
