use std::{
    error::Error,
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::{Parser, Subcommand};
use log::LevelFilter;
use stereo_calib::core::synthetic::{GaussianPixelNoise, SyntheticScene};
use stereo_calib::{calibrate_stereo, CalibrationInput, CalibrationReport, StereoCalibConfig};

/// Stereo rig calibration from planar checkerboard detections.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log level (off, error, warn, info, debug, trace). With `tracing`,
    /// `RUST_LOG` takes precedence when set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[cfg(feature = "tracing")]
    #[arg(long, global = true)]
    json_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Calibrate a rig from a JSON file of per-frame detections.
    Calibrate {
        /// JSON `CalibrationInput`: image size, pattern and frames.
        #[arg(long)]
        input: PathBuf,
        /// Optional JSON `StereoCalibConfig`; defaults are used if omitted.
        /// Pattern and image size always come from the input.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Where to write the report; stdout if omitted.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Write the detections of a synthetic reference rig.
    Synth {
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 10)]
        views: usize,
        /// Pixel noise standard deviation.
        #[arg(long, default_value_t = 0.1)]
        noise: f64,
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let level = LevelFilter::from_str(&cli.log_level)
        .map_err(|_| format!("invalid log level `{}`", cli.log_level))?;

    #[cfg(not(feature = "tracing"))]
    stereo_calib::core::init_with_level(level).map_err(|e| e.to_string())?;

    #[cfg(feature = "tracing")]
    stereo_calib::core::init_tracing(cli.json_log, level);

    match cli.command {
        Command::Calibrate {
            input,
            config,
            output,
        } => calibrate(&input, config.as_deref(), output.as_deref()),
        Command::Synth {
            output,
            views,
            noise,
            seed,
        } => {
            let scene = SyntheticScene::reference(views);
            let input = CalibrationInput::from_scene(&scene, &GaussianPixelNoise::new(seed, noise));
            input.write_json(&output)?;
            log::info!("wrote {} synthetic frames to {}", views, output.display());
            Ok(())
        }
    }
}

fn calibrate(
    input_path: &Path,
    config_path: Option<&Path>,
    output_path: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let input = CalibrationInput::load_json(input_path)?;
    let mut config = match config_path {
        Some(path) => StereoCalibConfig::load_json(path)?,
        None => StereoCalibConfig::default(),
    };
    config.pattern = input.pattern;
    config.image_size = input.image_size;

    let output = calibrate_stereo(&config, &input.frames)?;
    for rejected in &output.views.rejected {
        log::warn!("frame {}: {}", rejected.frame, rejected.reason);
    }
    let report = CalibrationReport::from_output(&output);
    match output_path {
        Some(path) => {
            report.write_json(path)?;
            log::info!("report written to {}", path.display());
        }
        None => println!("{}", report.to_json_string()?),
    }
    Ok(())
}
