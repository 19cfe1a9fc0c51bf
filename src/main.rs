//! Lensless Dataset Capture and Reconstruction
//!
//! Entry point for the lensless-dataset command line tool.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use lensless_dataset::align::{align_directory, Homography};
use lensless_dataset::capture::{
    emulated_devices, prepare_session, session_timestamp, CancelToken, CaptureOrchestrator,
    CaptureOutcome, CaptureRequest, LoggingPresenter,
};
use lensless_dataset::config::DatasetConfig;
use lensless_dataset::imaging::ChannelOrder;
use lensless_dataset::pipeline::reconstruct_session;
use lensless_dataset::undistort::{undistort_directory, CalibrationBundle, LensCorrector, UndistortOptions};

#[derive(Parser)]
#[command(name = "lensless-dataset", version, about = "Lensless dataset capture and processing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Display stimuli and capture them with every camera of the rig
    Capture {
        /// Exclusive end index into the stimulus folder
        end: usize,
        /// First stimulus index
        start: usize,
        /// Root folder for session directories
        dest_root: PathBuf,
        /// Folder of stimulus images
        source: PathBuf,
        /// Display the stimuli are shown on
        #[arg(default_value_t = 0)]
        display: usize,
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the log to `log.txt` inside the session directory
        #[arg(long)]
        log_to_file: bool,
        /// Width of emulated frames
        #[arg(long, default_value_t = 720)]
        frame_width: u32,
        /// Height of emulated frames
        #[arg(long, default_value_t = 540)]
        frame_height: u32,
    },
    /// Correct lens distortion of a folder of captures
    Undistort {
        /// Folder of raw captures
        images: PathBuf,
        /// Calibration bundle (JSON)
        #[arg(long)]
        calibration: PathBuf,
        /// Results go to `{root}/undistorted_images`
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Free scaling of the corrected view, 0 crops to valid pixels
        #[arg(long, default_value_t = 0.0)]
        alpha: f64,
        /// Keep the original orientation instead of mirroring
        #[arg(long)]
        no_mirror: bool,
        /// Input frames are stored blue-green-red
        #[arg(long)]
        bgr: bool,
    },
    /// Warp a folder of images into the reference frame
    Align {
        /// Folder of images to warp
        input: PathBuf,
        /// Homography artifact (JSON)
        #[arg(long)]
        homography: PathBuf,
        /// Output folder
        #[arg(long)]
        output: PathBuf,
        /// Target width; defaults to each image's own
        #[arg(long, requires = "height")]
        width: Option<u32>,
        /// Target height; defaults to each image's own
        #[arg(long, requires = "width")]
        height: Option<u32>,
    },
    /// Reconstruct the lensless captures of a session
    Reconstruct {
        /// Session directory produced by `capture`
        session: PathBuf,
        /// Folder holding `psf_cam_N` / `mask_cam_N` artifacts
        #[arg(long)]
        psf_dir: Option<PathBuf>,
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_logging(file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();

    if let Some(path) = file {
        let log_file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<DatasetConfig> {
    match path {
        Some(path) => DatasetConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => Ok(DatasetConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Capture {
            end,
            start,
            dest_root,
            source,
            display,
            config,
            log_to_file,
            frame_width,
            frame_height,
        } => {
            if !log_to_file {
                init_logging(None)?;
            }
            let config = load_config(config.as_deref())?;

            let timestamp = session_timestamp(&chrono::Local::now());
            let (devices, layout) = prepare_session(
                emulated_devices(&config.capture, frame_width, frame_height),
                &config.capture,
                &dest_root,
                &timestamp,
            )
            .context("Failed to prepare capture session")?;
            if log_to_file {
                init_logging(Some(layout.log_path().as_path()))?;
            }
            log::info!("Lensless dataset capture starting in {}", layout.root().display());

            let cancel = CancelToken::new();
            cancel
                .cancel_on_stdin_line()
                .context("Failed to start quit listener")?;
            log::info!("Press Enter to stop after the current stimulus");

            let orchestrator = CaptureOrchestrator::new(
                config.capture.clone(),
                devices,
                LoggingPresenter { display },
                layout,
                cancel,
            );
            let summary = orchestrator.run(&CaptureRequest {
                source_dir: source,
                start_index: start,
                end_index: end,
            })?;

            if summary.outcome == CaptureOutcome::Cancelled {
                log::warn!("Capture was stopped early");
            }
            for record in summary.ledger.failures() {
                log::warn!(
                    "Missing: stimulus {} ({}) on camera {}: {}",
                    record.stimulus_index,
                    record.filename,
                    record.slot,
                    record.reason
                );
            }
        }
        Command::Undistort {
            images,
            calibration,
            root,
            alpha,
            no_mirror,
            bgr,
        } => {
            init_logging(None)?;
            let bundle = CalibrationBundle::load(&calibration)
                .with_context(|| format!("Failed to load calibration {}", calibration.display()))?;
            let options = UndistortOptions {
                alpha,
                mirror: !no_mirror,
                input_order: if bgr { ChannelOrder::Bgr } else { ChannelOrder::Rgb },
            };
            let corrector = LensCorrector::new(&bundle, options)?;
            let written = undistort_directory(&images, &root.join("undistorted_images"), &corrector)?;
            log::info!("Undistorted {} images", written.len());
        }
        Command::Align {
            input,
            homography,
            output,
            width,
            height,
        } => {
            init_logging(None)?;
            let matrix = Homography::load(&homography)
                .with_context(|| format!("Failed to load homography {}", homography.display()))?;
            let target = width.zip(height);
            align_directory(&input, &output, &matrix, target)?;
        }
        Command::Reconstruct {
            session,
            psf_dir,
            config,
        } => {
            init_logging(None)?;
            let config = load_config(config.as_deref())?;
            let report = reconstruct_session(&session, psf_dir.as_deref(), &config);
            if report.succeeded() < report.cameras.len() {
                anyhow::bail!(
                    "{} of {} cameras could not be reconstructed",
                    report.cameras.len() - report.succeeded(),
                    report.cameras.len()
                );
            }
        }
    }

    Ok(())
}
