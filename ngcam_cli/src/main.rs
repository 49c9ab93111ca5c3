//! # ngcam_cli
//!
//! Part of the ngcam crate family.
//!
//! Command line front end for the neutron/gamma camera.
//!
//! ## Use
//!
//! ```bash
//! ngcam_cli new -p config.yml
//! ngcam_cli capture -p config.yml [--shot 42] [--simulate] [--configure]
//! ngcam_cli analyze -p config.yml [--summary]
//! ngcam_cli export -p config.yml --shot 42 --output shot_42.h5
//! ```
//!
//! `new` writes a template configuration. `capture` runs one shot on every card listed in
//! the configuration; `--simulate` swaps the cards for in-memory stand-ins and
//! `--configure` pushes the online parameters to the instrument first. `analyze` runs the
//! PSD/FOM analysis over the configured pulse file. `export` converts the raw packs of a shot
//! into an HDF5 waveform file.
//!
//! Detailed library logs are written to `ngcam.log` in the working directory.
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use libngcam::analysis::run_analysis;
use libngcam::config::Config;
use libngcam::coordinator::Coordinator;
use libngcam::device::SimulatedCard;
use libngcam::packet::PointInterleaved;
use libngcam::waveform_writer::{export_card, WaveformWriter};
use libngcam::worker_status::StatusKind;

/// Simulated cards report full after this many status polls
const SIMULATED_FILL_POLLS: u32 = 10;
/// Raw buffer size used for simulated cards
const SIMULATED_RAW_BYTES: usize = 1 << 20;

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).expect("Could not serialize template config!");
    std::fs::write(path, yaml_str).expect("Failed to write yaml data to file!");
}

fn init_file_logger() {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./ngcam.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .expect("Could not create log file!"),
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .level_filter(spdlog::LevelFilter::All)
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()
            .expect("Could not create file logger!"),
    );
    spdlog::set_default_logger(logger);
    spdlog::info!("Starting ngcam_cli");
}

fn capture(mut config: Config, args: &ArgMatches, pb_manager: &MultiProgress) {
    let simulate = args.get_flag("simulate");
    let shot = args.get_one::<String>("shot").map(String::as_str);

    let coordinator = if simulate {
        let n_cards = config.cards.len().max(1);
        config.raw_buffer_bytes = config.raw_buffer_bytes.min(SIMULATED_RAW_BYTES);
        log::info!(
            "Simulating {n_cards} cards with {} raw buffers",
            human_bytes::human_bytes(config.raw_buffer_bytes as f64)
        );
        let cards = (1..=n_cards)
            .map(|idx| SimulatedCard::framed(config.raw_buffer_bytes, SIMULATED_FILL_POLLS).card(idx))
            .collect();
        Ok(Coordinator::new(config, cards))
    } else {
        Coordinator::open(config)
    };
    let mut coordinator = match coordinator {
        Ok(c) => c,
        Err(e) => {
            log::error!("Initialization failed: {e}");
            return;
        }
    };

    if args.get_flag("configure") && !simulate {
        if let Err(e) = coordinator
            .connect_command_link()
            .and_then(|_| coordinator.apply_online_config())
        {
            log::error!("Initialization failed: {e}");
            return;
        }
        log::info!("Instrument parameters sent.");
    }

    let shot = match coordinator.start(shot) {
        Ok(shot) => shot,
        Err(e) => {
            log::error!("Initialization failed: {e}");
            return;
        }
    };
    log::info!(
        "Capturing shot {shot} to {}",
        coordinator.config().shot_directory(&shot).display()
    );

    let style = ProgressStyle::with_template("card {prefix} [{bar:40.cyan/blue}] {pos}/{len} packs")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let bars: Vec<ProgressBar> = (1..=coordinator.n_cards())
        .map(|idx| {
            let pb = pb_manager.add(ProgressBar::new(coordinator.config().target_packs()));
            pb.set_style(style.clone());
            pb.set_prefix(idx.to_string());
            pb
        })
        .collect();

    loop {
        match coordinator.recv_status_timeout(Duration::from_millis(100)) {
            Some(status) => {
                let bar = status.card.checked_sub(1).and_then(|i| bars.get(i));
                match status.kind {
                    StatusKind::Progress => {
                        if let Some(pb) = bar {
                            pb.set_position(status.packs_done);
                        }
                    }
                    StatusKind::Waveform(pulse) => {
                        let (height, index) = pulse.peak();
                        log::debug!(
                            "Card {} pack {}: waveform peak {height} at sample {index}",
                            status.card,
                            status.packs_done
                        );
                    }
                    StatusKind::Spectrum(records) => {
                        let gamma: u64 = records
                            .iter()
                            .flat_map(|r| r.gamma.iter())
                            .map(|v| *v as u64)
                            .sum();
                        let neutron: u64 = records
                            .iter()
                            .flat_map(|r| r.neutron.iter())
                            .map(|v| *v as u64)
                            .sum();
                        log::debug!(
                            "Card {} pack {}: gamma {gamma} neutron {neutron}",
                            status.card,
                            status.packs_done
                        );
                    }
                    StatusKind::Finished => {
                        if let Some(pb) = bar {
                            pb.finish();
                        }
                    }
                    StatusKind::Failed(message) => {
                        log::error!("Card {} failed: {message}", status.card);
                    }
                    StatusKind::AllFinished => break,
                }
            }
            None => {
                if !coordinator.is_running() {
                    break;
                }
            }
        }
    }

    for result in coordinator.join() {
        match result {
            Ok(summary) => log::info!(
                "Card {}: {} packs, {} corrupt, {} written ({} dropped)",
                summary.card,
                summary.packs_captured,
                summary.corrupt_packs,
                summary.persist.packs_written,
                summary.persist.packs_dropped
            ),
            Err(e) => log::error!("Capture failed with error: {e}"),
        }
    }
}

fn analyze(config: Config, args: &ArgMatches) {
    match run_analysis(&config, args.get_flag("summary")) {
        Ok(result) => {
            log::info!("PSD stages: {}", result.report);
            match result.fom.fom() {
                Some(fom) => log::info!(
                    "FOM: {fom:.3} (R1 {:.4}, R2 {:.4})",
                    result.fom.r1,
                    result.fom.r2
                ),
                None => log::warn!("No FOM: {:?}", result.fom.outcome),
            }
        }
        Err(e) => log::error!("Analysis failed with error: {e}"),
    }
}

fn export(config: Config, args: &ArgMatches) {
    let Some(shot) = args.get_one::<String>("shot") else {
        log::error!("export requires --shot");
        return;
    };
    let shot_dir = config.shot_directory(shot);
    let output = args
        .get_one::<String>("output")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.save_path.join(format!("shot_{shot}.h5")));
    let big_endian = config.big_endian_samples && !args.get_flag("little-endian");

    let mut writer = match WaveformWriter::new(&output) {
        Ok(w) => w,
        Err(e) => {
            log::error!("Could not create {}: {e}", output.display());
            return;
        }
    };
    for card in 1..=config.cards.len().max(1) {
        match export_card(&mut writer, &shot_dir, card, &PointInterleaved, big_endian) {
            Ok(summary) => log::info!(
                "Card {card}: {} packs exported, {} skipped",
                summary.packs_read,
                summary.packs_skipped
            ),
            Err(e) => log::error!("Export of card {card} failed: {e}"),
        }
    }
    match writer.close() {
        Ok(()) => log::info!("Waveforms written to {}", output.display()),
        Err(e) => log::error!("Could not close {}: {e}", output.display()),
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("ngcam_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("capture")
                .about("Capture one shot on every card")
                .arg(Arg::new("shot").short('s').long("shot").help("Shot identifier"))
                .arg(
                    Arg::new("simulate")
                        .long("simulate")
                        .action(ArgAction::SetTrue)
                        .help("Use in-memory cards instead of the devices"),
                )
                .arg(
                    Arg::new("configure")
                        .long("configure")
                        .action(ArgAction::SetTrue)
                        .help("Send the online parameters to the instrument first"),
                ),
        )
        .subcommand(
            Command::new("analyze")
                .about("Run the PSD/FOM analysis on the configured pulse file")
                .arg(
                    Arg::new("summary")
                        .long("summary")
                        .action(ArgAction::SetTrue)
                        .help("Write a YAML summary next to the pulse file"),
                ),
        )
        .subcommand(
            Command::new("export")
                .about("Convert the raw packs of a shot to HDF5 waveforms")
                .arg(Arg::new("shot").short('s').long("shot").help("Shot identifier"))
                .arg(Arg::new("output").short('o').long("output").help("Output HDF5 file"))
                .arg(
                    Arg::new("little-endian")
                        .long("little-endian")
                        .action(ArgAction::SetTrue)
                        .help("Raw samples are little-endian"),
                ),
        )
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    // Initialize feedback
    init_file_logger();
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    // Parse the cli
    let config_path = matches
        .subcommand()
        .and_then(|(_, sub)| sub.get_one::<String>("path"))
        .or_else(|| matches.get_one::<String>("path"))
        .map(PathBuf::from);
    let Some(config_path) = config_path else {
        log::error!("A configuration path is required (-p/--path)");
        return;
    };

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        log::info!("Done.");
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!("Cards: {}", config.cards.len());
    log::info!("Save Path: {}", config.save_path.to_string_lossy());

    match matches.subcommand() {
        Some(("capture", args)) => capture(config, args, &pb_manager),
        Some(("analyze", args)) => analyze(config, args),
        Some(("export", args)) => export(config, args),
        _ => log::error!("Unknown command; see --help"),
    }

    log::info!("Done.");
}
