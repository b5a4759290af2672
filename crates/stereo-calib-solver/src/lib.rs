//! Calibration solvers for a two-camera rig observing a planar pattern.
//!
//! The pipeline is split in the same stages the facade reports on:
//!
//! 1. [`initialize_camera`]: per-view homographies, closed-form intrinsics
//!    and per-view board poses;
//! 2. [`refine_mono`] / [`calibrate_mono`]: single-camera bundle adjustment;
//! 3. [`refine_stereo`]: joint refinement of both cameras and the rigid
//!    left-to-right transform;
//! 4. [`StereoCalibration::from_estimate`]: essential and fundamental
//!    matrices.
//!
//! All refinement runs through [`minimize`], a dense Levenberg-Marquardt
//! loop over a [`LeastSquaresProblem`].
//!
//! ```
//! use stereo_calib_core::synthetic::{GaussianPixelNoise, SyntheticScene};
//! use stereo_calib_core::Side;
//! use stereo_calib_solver::{calibrate_mono, InitOptions, IntrinsicsFlags, LmOptions};
//!
//! let scene = SyntheticScene::reference(5);
//! let samples = scene.samples(&GaussianPixelNoise::default());
//! let left = calibrate_mono(
//!     &samples,
//!     Side::Left,
//!     scene.rig.image_size,
//!     &InitOptions::default(),
//!     &IntrinsicsFlags::default(),
//!     &LmOptions::default(),
//! )?;
//! assert!(left.rms < 1e-6);
//! # Ok::<(), stereo_calib_solver::SolverError>(())
//! ```

mod epipolar;
mod error;
mod init;
mod lm;
mod mono;
mod params;
mod stereo;

pub use epipolar::{epipolar_residual, essential_matrix, fundamental_matrix};
pub use error::SolverError;
pub use init::{
    homography_rms, init_camera_matrix_2d, initialize_camera, intrinsics_from_homographies,
    pose_from_homography, CameraInit, InitOptions, IntrinsicsInit, ViewDropReason,
};
pub use lm::{minimize, LeastSquaresProblem, LmOptions, LmReport, Termination};
pub use mono::{calibrate_mono, refine_mono, reprojection_rms, MonoCalibration};
pub use params::IntrinsicsFlags;
pub use stereo::{
    initial_relative_pose, refine_stereo, StereoCalibration, StereoEstimate, StereoFlags,
};
