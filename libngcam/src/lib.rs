//! # libngcam
//!
//! libngcam is the acquisition and analysis engine of the neutron/gamma camera, written in
//! Rust. It drives the DMA acquisition cards of the camera, streams every 50 ms pack of raw
//! waveforms and spectra to disk, and runs the pulse-shape discrimination (PSD) analysis
//! which separates neutron events from gamma events and grades that separation with a
//! figure of merit (FOM).
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, see the
//! [Rust docs](https://www.rust-lang.org/tools/install) for installation instructions.
//!
//! ### HDF5
//!
//! Offline pulse files and waveform exports are HDF5, so HDF5 must be installed. If the
//! install is not auto detected, write the following snippet into `.cargo/config.toml`:
//!
//! ```toml
//! [env]
//! HDF5_DIR="/path/to/my/hdf5/install/"
//!
//! [build]
//! rustflags="-C link-args=-Wl,-rpath,/path/to/my/hdf5/install/lib"
//! ```
//!
//! ## Acquisition
//!
//! Each card exposes a data channel (raw waveform buffer) and a control channel (status
//! register, command register and spectrum buffer). A run is driven by the
//! [`coordinator::Coordinator`], which starts one capture thread per card. Each capture
//! thread loops through arm, wait for full, drain, clear until its pack count is reached,
//! handing every pack to a write-behind worker which writes
//!
//! ```text
//! <save_path>/shot_<shot>/
//! |---- <card>data<pack>.bin   raw waveform buffer
//! |---- <card>spec<pack>.bin   spectrum buffer (50 x 1024 byte records)
//! ```
//!
//! Pack numbers start at 1.
//!
//! ## Analysis
//!
//! [`analysis::run_analysis`] reads a `(pulses x 512)` i16 dataset and runs
//!
//! - the PSD pipeline ([`psd`]): peak position, amplitude, baseline, undershoot, constant
//! fraction timing, charge integration, energy calibration
//! - per-point density over a 2-D occupancy grid ([`density`])
//! - the PSD ratio histogram and two-Gaussian FOM fit ([`fom`], [`fit`])
//!
//! ## Configuration
//!
//! Every setting lives in [`config::Config`], stored as YAML. A template can be made with
//! `ngcam_cli new -p config.yml`.
pub mod analysis;
pub mod capture;
pub mod command;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod density;
pub mod device;
pub mod error;
pub mod fit;
pub mod fom;
pub mod packet;
pub mod persist;
pub mod psd;
pub mod pulse;
pub mod waveform_writer;
pub mod worker_status;
