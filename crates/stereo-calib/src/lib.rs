//! End-to-end stereo rig calibration.
//!
//! This crate ties the workspace together:
//! - [`calibrate_stereo`] runs the whole pipeline on per-frame corner
//!   detections and reports which step failed, if any;
//! - [`StereoCalibConfig`] holds every option, loadable from JSON;
//! - [`CalibrationInput`] / [`CalibrationReport`] are the JSON documents the
//!   `stereo-calib` binary reads and writes.
//!
//! The underlying crates are re-exported as [`core`], [`solver`] and
//! [`rectify`].
//!
//! ## Quickstart
//!
//! ```
//! use stereo_calib::{calibrate_stereo, StereoCalibConfig};
//! use stereo_calib::core::synthetic::{GaussianPixelNoise, SyntheticScene};
//!
//! let scene = SyntheticScene::reference(8);
//! let frames = scene.frames(&GaussianPixelNoise::new(1, 0.1));
//! let config = StereoCalibConfig::default();
//!
//! let output = calibrate_stereo(&config, &frames)?;
//! assert!(output.calibration.rms < 0.5);
//! assert!(output.rectification.is_some());
//! # Ok::<(), stereo_calib::CalibrationFailure>(())
//! ```

pub use stereo_calib_core as core;
pub use stereo_calib_rectify as rectify;
pub use stereo_calib_solver as solver;

mod config;
mod error;
mod io;
mod pipeline;

pub use config::StereoCalibConfig;
pub use error::{CalibrationFailure, CalibrationStage, ConfigError, IoError, StageError};
pub use io::{CalibrationInput, CalibrationReport};
pub use pipeline::{
    calibrate_stereo, CalibrationOutput, DroppedView, RejectedFrame, ViewReport,
};

pub use stereo_calib_core::{Detection, FramePair, PatternSpec};
