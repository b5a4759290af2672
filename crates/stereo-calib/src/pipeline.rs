//! Detections in, calibrated and rectified rig out.

use crate::error::AtStage;
use crate::{CalibrationFailure, CalibrationStage, StereoCalibConfig};
use serde::{Deserialize, Serialize};
use stereo_calib_core::{collect_samples, FramePair, FrameRejection, ImageSize, Side};
use stereo_calib_rectify::{stereo_rectify, RectificationTransform};
use stereo_calib_solver::{
    initial_relative_pose, initialize_camera, refine_mono, refine_stereo, MonoCalibration,
    SolverError, StereoCalibration, ViewDropReason,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// A frame that never became a view.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RejectedFrame {
    pub frame: usize,
    pub reason: FrameRejection,
}

/// A view one camera's initialization left out.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DroppedView {
    pub frame: usize,
    pub side: Side,
    pub reason: ViewDropReason,
}

/// What happened to every input frame. Indices refer to the input frames.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewReport {
    pub total_frames: usize,
    pub rejected: Vec<RejectedFrame>,
    pub dropped: Vec<DroppedView>,
    /// Frames that took part in the stereo refinement.
    pub used_frames: Vec<usize>,
    /// Stereo reprojection RMS per input frame; `None` for unused frames.
    pub per_frame_rms: Vec<Option<f64>>,
}

impl ViewReport {
    pub fn used_views(&self) -> usize {
        self.used_frames.len()
    }
}

/// Result of [`calibrate_stereo`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOutput {
    pub image_size: ImageSize,
    pub calibration: StereoCalibration,
    pub left: MonoCalibration,
    pub right: MonoCalibration,
    /// `None` when the config disables rectification.
    pub rectification: Option<RectificationTransform>,
    pub views: ViewReport,
}

fn ensure_views(
    got: usize,
    needed: usize,
    stage: CalibrationStage,
) -> Result<(), CalibrationFailure> {
    if got < needed {
        return Err::<(), _>(SolverError::InsufficientViews { needed, got }).at(stage);
    }
    Ok(())
}

/// Run the full pipeline: collect views, initialize and refine each camera,
/// refine the rig, derive `E`/`F` and (optionally) rectify.
///
/// Frames with a missing or incomplete detection, and views a camera's
/// initialization rejects, are skipped and listed in [`ViewReport`]; the run
/// fails only when fewer than [`StereoCalibConfig::required_views`] remain.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip_all, fields(frames = frames.len())))]
pub fn calibrate_stereo(
    config: &StereoCalibConfig,
    frames: &[FramePair],
) -> Result<CalibrationOutput, CalibrationFailure> {
    config.validate().at(CalibrationStage::Preflight)?;
    let required = config.required_views();

    let (samples, rejected) = collect_samples(&config.pattern, frames);
    let mut is_rejected = vec![false; frames.len()];
    for (idx, _) in &rejected {
        is_rejected[*idx] = true;
    }
    let frame_of: Vec<usize> = (0..frames.len()).filter(|i| !is_rejected[*i]).collect();
    ensure_views(samples.len(), required, CalibrationStage::CollectViews)?;

    let init_left = initialize_camera(&samples, Side::Left, config.image_size, &config.init)
        .at(CalibrationStage::InitLeft)?;
    ensure_views(init_left.kept_views(), required, CalibrationStage::InitLeft)?;
    let init_right = initialize_camera(&samples, Side::Right, config.image_size, &config.init)
        .at(CalibrationStage::InitRight)?;
    ensure_views(init_right.kept_views(), required, CalibrationStage::InitRight)?;

    let left = refine_mono(&samples, Side::Left, &init_left, &config.intrinsics, &config.lm)
        .at(CalibrationStage::RefineLeft)?;
    let right = refine_mono(&samples, Side::Right, &init_right, &config.intrinsics, &config.lm)
        .at(CalibrationStage::RefineRight)?;

    let shared = left
        .poses
        .iter()
        .zip(&right.poses)
        .filter(|(l, r)| l.is_some() && r.is_some())
        .count();
    ensure_views(shared, required, CalibrationStage::InitStereo)?;
    let initial = initial_relative_pose(&left, &right).at(CalibrationStage::InitStereo)?;
    log::info!(
        "initial rig from {shared} views: |T|={:.4}",
        initial.translation.norm()
    );

    let estimate = refine_stereo(&samples, &left, &right, &initial, &config.stereo, &config.lm)
        .at(CalibrationStage::RefineStereo)?;
    let calibration =
        StereoCalibration::from_estimate(estimate).at(CalibrationStage::Epipolar)?;

    let rectification = config
        .rectify
        .as_ref()
        .map(|options| {
            stereo_rectify(
                &calibration.left,
                &calibration.right,
                &calibration.relative.rotation,
                &calibration.relative.translation,
                config.image_size,
                options,
            )
        })
        .transpose()
        .at(CalibrationStage::Rectify)?;

    let frame_of = &frame_of;
    let mut dropped: Vec<DroppedView> = [(Side::Left, &left), (Side::Right, &right)]
        .into_iter()
        .flat_map(|(side, mono)| {
            mono.dropped.iter().map(move |(idx, reason)| DroppedView {
                frame: frame_of[*idx],
                side,
                reason: *reason,
            })
        })
        .collect();
    dropped.sort_by_key(|d| d.frame);

    let mut per_frame_rms = vec![None; frames.len()];
    let mut used_frames = Vec::new();
    for (idx, rms) in calibration.per_view_rms.iter().enumerate() {
        if let Some(rms) = rms {
            per_frame_rms[frame_of[idx]] = Some(*rms);
            used_frames.push(frame_of[idx]);
        }
    }
    let views = ViewReport {
        total_frames: frames.len(),
        rejected: rejected
            .into_iter()
            .map(|(frame, reason)| RejectedFrame { frame, reason })
            .collect(),
        dropped,
        used_frames,
        per_frame_rms,
    };

    log::info!(
        "calibrated rig from {} of {} frames: rms {:.4} px, baseline {:.4}",
        views.used_views(),
        views.total_frames,
        calibration.rms,
        calibration.baseline()
    );

    Ok(CalibrationOutput {
        image_size: config.image_size,
        calibration,
        left,
        right,
        rectification,
        views,
    })
}
