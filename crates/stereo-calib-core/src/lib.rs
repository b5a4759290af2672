//! Core camera, pose and observation types for stereo rig calibration.
//!
//! This crate is purely geometric: pinhole projection with Brown-Conrady
//! distortion, rigid transforms, planar homographies and the data model the
//! solvers consume. It does *not* depend on any concrete corner detector.

mod camera;
mod error;
mod homography;
mod image;
mod logger;
mod pattern;
pub mod pose;
pub mod projection;
pub mod synthetic;
mod view;

pub use camera::{CameraIntrinsics, Distortion, ImageSize, NUM_INTRINSIC_PARAMS};
pub use error::CoreError;
pub use homography::{estimate_homography, homography_from_4pt, Homography};
pub use image::{sample_bilinear, sample_bilinear_u8, GrayImage, GrayImageView};
pub use pattern::PatternSpec;
pub use pose::Pose;
pub use projection::{project_point, project_with_jacobian, ProjectionJacobian};
pub use view::{
    collect_samples, detect_frames, CornerDetector, Detection, FramePair, FrameRejection, Side,
    ViewSample,
};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
