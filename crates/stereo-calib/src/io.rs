//! JSON documents: the detection input and the calibration report.

use crate::{CalibrationOutput, IoError};
use nalgebra::{Matrix3, SMatrix, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;
use stereo_calib_core::{
    synthetic::{GaussianPixelNoise, SyntheticScene},
    CameraIntrinsics, CoreError, Distortion, FramePair, ImageSize, PatternSpec, Pose,
};

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, IoError> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

pub(crate) fn write_json<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<(), IoError> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Detections of a capture session.
///
/// Each frame holds the ordered corner list per camera, or `null` when the
/// detector did not find the pattern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationInput {
    pub image_size: ImageSize,
    pub pattern: PatternSpec,
    pub frames: Vec<FramePair>,
}

impl CalibrationInput {
    /// Detections of a synthetic scene, with out-of-view frames as `null`.
    pub fn from_scene(scene: &SyntheticScene, noise: &GaussianPixelNoise) -> Self {
        Self {
            image_size: scene.rig.image_size,
            pattern: scene.pattern,
            frames: scene.frames(noise),
        }
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, IoError> {
        read_json(path)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), IoError> {
        write_json(self, path)
    }
}

fn rows<const R: usize, const C: usize>(m: &SMatrix<f64, R, C>) -> [[f64; C]; R] {
    std::array::from_fn(|r| std::array::from_fn(|c| m[(r, c)]))
}

fn from_rows<const R: usize, const C: usize>(rows: &[[f64; C]; R]) -> SMatrix<f64, R, C> {
    SMatrix::from_fn(|r, c| rows[r][c])
}

/// Calibration result with OpenCV-style field names; matrices are row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    #[serde(rename = "RMS_error")]
    pub rms_error: f64,
    #[serde(rename = "cameraMatrix1")]
    pub camera_matrix1: [[f64; 3]; 3],
    /// `(k1, k2, p1, p2, k3)`.
    #[serde(rename = "distCoeffs1")]
    pub dist_coeffs1: [f64; 5],
    #[serde(rename = "cameraMatrix2")]
    pub camera_matrix2: [[f64; 3]; 3],
    #[serde(rename = "distCoeffs2")]
    pub dist_coeffs2: [f64; 5],
    pub relative_rotation: [[f64; 3]; 3],
    pub relative_transformation: [f64; 3],
    pub essential_matrix: [[f64; 3]; 3],
    pub fundamental_matrix: [[f64; 3]; 3],
    #[serde(rename = "R1", default, skip_serializing_if = "Option::is_none")]
    pub r1: Option<[[f64; 3]; 3]>,
    #[serde(rename = "R2", default, skip_serializing_if = "Option::is_none")]
    pub r2: Option<[[f64; 3]; 3]>,
    #[serde(rename = "P1", default, skip_serializing_if = "Option::is_none")]
    pub p1: Option<[[f64; 4]; 3]>,
    #[serde(rename = "P2", default, skip_serializing_if = "Option::is_none")]
    pub p2: Option<[[f64; 4]; 3]>,
    #[serde(rename = "Q", default, skip_serializing_if = "Option::is_none")]
    pub q: Option<[[f64; 4]; 4]>,
    /// `[x, y, width, height]`.
    #[serde(rename = "validPixROI1", default, skip_serializing_if = "Option::is_none")]
    pub valid_pix_roi1: Option<[i32; 4]>,
    #[serde(rename = "validPixROI2", default, skip_serializing_if = "Option::is_none")]
    pub valid_pix_roi2: Option<[i32; 4]>,
    pub image_size: ImageSize,
    pub left_rms: f64,
    pub right_rms: f64,
    pub used_frames: Vec<usize>,
}

impl CalibrationReport {
    pub fn from_output(output: &CalibrationOutput) -> Self {
        let calib = &output.calibration;
        let rect = output.rectification.as_ref();
        Self {
            rms_error: calib.rms,
            camera_matrix1: rows(&calib.left.k_matrix()),
            dist_coeffs1: calib.left.distortion.to_opencv(),
            camera_matrix2: rows(&calib.right.k_matrix()),
            dist_coeffs2: calib.right.distortion.to_opencv(),
            relative_rotation: rows(calib.relative.rotation.matrix()),
            relative_transformation: calib.relative.translation.into(),
            essential_matrix: rows(&calib.essential),
            fundamental_matrix: rows(&calib.fundamental),
            r1: rect.map(|r| rows(&r.r1)),
            r2: rect.map(|r| rows(&r.r2)),
            p1: rect.map(|r| rows(&r.p1)),
            p2: rect.map(|r| rows(&r.p2)),
            q: rect.map(|r| rows(&r.q)),
            valid_pix_roi1: rect.map(|r| r.roi1.to_array()),
            valid_pix_roi2: rect.map(|r| r.roi2.to_array()),
            image_size: output.image_size,
            left_rms: calib.left_rms,
            right_rms: calib.right_rms,
            used_frames: output.views.used_frames.clone(),
        }
    }

    pub fn left_intrinsics(&self) -> CameraIntrinsics {
        CameraIntrinsics::from_k_matrix(
            &from_rows(&self.camera_matrix1),
            Distortion::from_opencv(self.dist_coeffs1),
        )
    }

    pub fn right_intrinsics(&self) -> CameraIntrinsics {
        CameraIntrinsics::from_k_matrix(
            &from_rows(&self.camera_matrix2),
            Distortion::from_opencv(self.dist_coeffs2),
        )
    }

    /// Left-to-right transform; fails when the stored rotation was edited into
    /// a non-rotation.
    pub fn relative_pose(&self) -> Result<Pose, CoreError> {
        let r: Matrix3<f64> = from_rows(&self.relative_rotation);
        Pose::from_matrix(&r, Vector3::from(self.relative_transformation))
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, IoError> {
        read_json(path)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), IoError> {
        write_json(self, path)
    }

    pub fn to_json_string(&self) -> Result<String, IoError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
