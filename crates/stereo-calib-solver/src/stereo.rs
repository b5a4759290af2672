//! Joint refinement of both cameras and the rig's relative pose.
//!
//! The right camera never carries its own per-view pose: its board pose is
//! derived as `relative ∘ left_pose`, which keeps the rig rigid across views.

use crate::epipolar::{essential_matrix, fundamental_matrix};
use crate::lm::{minimize, LeastSquaresProblem, LmOptions, LmReport};
use crate::mono::{
    find_unprojectable, pose_label, reprojection_rms, write_pose_block, MonoCalibration,
    POSE_PARAM_NAMES,
};
use crate::params::{IntrinsicsFlags, IntrinsicsLayout};
use crate::SolverError;
use nalgebra::{DMatrix, DVector, Matrix3, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use stereo_calib_core::{
    pose::{mean_rotation, rotation_angle_between},
    project_point, project_with_jacobian, CameraIntrinsics, Pose, Side, ViewSample,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Options of the joint refinement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoFlags {
    /// Applied to both cameras.
    pub intrinsics: IntrinsicsFlags,
    /// Refine only the relative pose and the view poses.
    pub fix_intrinsics: bool,
    /// Both cameras share one pair of focal lengths, started at the mean of
    /// the two mono estimates. Combined with `intrinsics.fix_focal_length`
    /// the shared pair stays at that mean. Ignored under `fix_intrinsics`.
    pub same_focal_length: bool,
}

/// Output of [`refine_stereo`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoEstimate {
    pub left: CameraIntrinsics,
    pub right: CameraIntrinsics,
    /// Left camera frame into the right camera frame.
    pub relative: Pose,
    /// Board pose in the left camera per input view; `None` for unused views.
    pub left_poses: Vec<Option<Pose>>,
    /// RMS over the observations of both cameras, in pixels.
    pub rms: f64,
    pub left_rms: f64,
    pub right_rms: f64,
    pub per_view_rms: Vec<Option<f64>>,
    pub report: LmReport,
}

impl StereoEstimate {
    pub fn used_views(&self) -> usize {
        self.left_poses.iter().filter(|p| p.is_some()).count()
    }
}

/// Full stereo calibration, including the epipolar geometry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoCalibration {
    pub left: CameraIntrinsics,
    pub right: CameraIntrinsics,
    pub relative: Pose,
    pub essential: Matrix3<f64>,
    pub fundamental: Matrix3<f64>,
    pub rms: f64,
    pub left_rms: f64,
    pub right_rms: f64,
    pub left_poses: Vec<Option<Pose>>,
    pub per_view_rms: Vec<Option<f64>>,
    pub report: LmReport,
}

impl StereoCalibration {
    /// Derive `E` and `F` for a refined rig.
    pub fn from_estimate(est: StereoEstimate) -> Result<Self, SolverError> {
        let essential = essential_matrix(&est.relative);
        let fundamental = fundamental_matrix(&est.left, &est.right, &essential)?;
        Ok(Self {
            left: est.left,
            right: est.right,
            relative: est.relative,
            essential,
            fundamental,
            rms: est.rms,
            left_rms: est.left_rms,
            right_rms: est.right_rms,
            left_poses: est.left_poses,
            per_view_rms: est.per_view_rms,
            report: est.report,
        })
    }

    pub fn used_views(&self) -> usize {
        self.left_poses.iter().filter(|p| p.is_some()).count()
    }

    /// Baseline length `|T|`.
    pub fn baseline(&self) -> f64 {
        self.relative.translation.norm()
    }
}

/// Indices of views both mono calibrations kept.
fn shared_views(left: &MonoCalibration, right: &MonoCalibration) -> Vec<(usize, Pose, Pose)> {
    left.poses
        .iter()
        .zip(&right.poses)
        .enumerate()
        .filter_map(|(idx, (l, r))| Some((idx, (*l)?, (*r)?)))
        .collect()
}

/// Initial left-to-right transform: per-view `right ∘ left^-1`, rotations
/// averaged on the quaternion sphere and translations arithmetically.
pub fn initial_relative_pose(
    left: &MonoCalibration,
    right: &MonoCalibration,
) -> Result<Pose, SolverError> {
    let shared = shared_views(left, right);
    if shared.is_empty() {
        return Err(SolverError::InsufficientViews { needed: 1, got: 0 });
    }
    let per_view: Vec<Pose> = shared
        .iter()
        .map(|(_, l, r)| l.inverse().then(r))
        .collect();
    let rotations: Vec<Rotation3<f64>> = per_view.iter().map(|p| p.rotation).collect();
    let rotation = mean_rotation(&rotations).ok_or(SolverError::DegenerateHomographies {
        reason: "per-view relative rotations cancel out",
    })?;
    let translation =
        per_view.iter().map(|p| p.translation).sum::<Vector3<f64>>() / per_view.len() as f64;

    let spread = rotations
        .iter()
        .map(|r| rotation_angle_between(r, &rotation))
        .fold(0.0_f64, f64::max);
    log::debug!(
        "initial relative pose from {} views: |T|={:.4}, max rotation spread {:.3} deg",
        per_view.len(),
        translation.norm(),
        spread.to_degrees()
    );
    Ok(Pose::new(rotation, translation))
}

#[derive(Clone, Debug)]
struct StereoState {
    left: CameraIntrinsics,
    right: CameraIntrinsics,
    relative: Pose,
    poses: Vec<Pose>,
}

struct StereoProblem<'a> {
    views: Vec<(usize, &'a ViewSample)>,
    left_layout: IntrinsicsLayout,
    right_layout: IntrinsicsLayout,
    /// First column of the relative pose block.
    rel_col: usize,
    n_residuals: usize,
}

impl StereoProblem<'_> {
    fn view_col(&self, v: usize) -> usize {
        self.rel_col + 6 + 6 * v
    }

    fn retract_pose(pose: &Pose, delta: &DVector<f64>, col: usize) -> Pose {
        pose.retract(
            &delta.fixed_rows::<3>(col).into_owned(),
            &delta.fixed_rows::<3>(col + 3).into_owned(),
        )
    }
}

impl LeastSquaresProblem for StereoProblem<'_> {
    type State = StereoState;

    fn num_params(&self) -> usize {
        self.rel_col + 6 + 6 * self.views.len()
    }

    fn residuals(&self, state: &StereoState) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(self.n_residuals);
        let mut row = 0;
        for ((_, sample), pose) in self.views.iter().zip(&state.poses) {
            for (x, uv) in sample.object_points().iter().zip(sample.left()) {
                let px = project_point(&state.left, &pose.transform_point(x))?;
                r[row] = px.x - uv.x;
                r[row + 1] = px.y - uv.y;
                row += 2;
            }
            for (x, uv) in sample.object_points().iter().zip(sample.right()) {
                let xr = state.relative.transform_point(&pose.transform_point(x));
                let px = project_point(&state.right, &xr)?;
                r[row] = px.x - uv.x;
                r[row + 1] = px.y - uv.y;
                row += 2;
            }
        }
        Some(r)
    }

    fn linearize(&self, state: &StereoState) -> Option<(DVector<f64>, DMatrix<f64>)> {
        let mut r = DVector::zeros(self.n_residuals);
        let mut jac = DMatrix::zeros(self.n_residuals, self.num_params());
        let rel_r = *state.relative.rotation.matrix();
        let mut row = 0;
        for (v, ((_, sample), pose)) in self.views.iter().zip(&state.poses).enumerate() {
            let col = self.view_col(v);
            for (x, uv) in sample.object_points().iter().zip(sample.left()) {
                let rotated = pose.rotation * x.coords;
                let xl = Point3::from(rotated + pose.translation);
                let (px, pj) = project_with_jacobian(&state.left, &xl)?;
                r[row] = px.x - uv.x;
                r[row + 1] = px.y - uv.y;
                self.left_layout.scatter(&mut jac, row, &pj.d_intrinsics);
                write_pose_block(&mut jac, row, col, &pj.d_point, &rotated);
                row += 2;
            }
            for (x, uv) in sample.object_points().iter().zip(sample.right()) {
                let rotated = pose.rotation * x.coords;
                let xl = rotated + pose.translation;
                let rel_rotated = rel_r * xl;
                let xr = Point3::from(rel_rotated + state.relative.translation);
                let (px, pj) = project_with_jacobian(&state.right, &xr)?;
                r[row] = px.x - uv.x;
                r[row + 1] = px.y - uv.y;
                self.right_layout.scatter(&mut jac, row, &pj.d_intrinsics);
                write_pose_block(&mut jac, row, self.rel_col, &pj.d_point, &rel_rotated);
                write_pose_block(&mut jac, row, col, &(pj.d_point * rel_r), &rotated);
                row += 2;
            }
        }
        Some((r, jac))
    }

    fn retract(&self, state: &StereoState, delta: &DVector<f64>) -> StereoState {
        StereoState {
            left: self.left_layout.apply(&state.left, delta),
            right: self.right_layout.apply(&state.right, delta),
            relative: Self::retract_pose(&state.relative, delta, self.rel_col),
            poses: state
                .poses
                .iter()
                .enumerate()
                .map(|(v, p)| Self::retract_pose(p, delta, self.view_col(v)))
                .collect(),
        }
    }

    fn parameter_label(&self, index: usize) -> String {
        if index < self.rel_col {
            if let Some(name) = self.left_layout.label(index) {
                return format!("left.{name}");
            }
            if let Some(name) = self.right_layout.label(index) {
                return format!("right.{name}");
            }
            return format!("intrinsic[{index}]");
        }
        let k = index - self.rel_col;
        if k < 6 {
            return format!("relative.{}", POSE_PARAM_NAMES[k]);
        }
        let v = (k - 6) / 6;
        pose_label(self.views[v].0, (k - 6) % 6)
    }
}

/// Jointly refine both cameras, the relative pose and the left view poses,
/// starting from `initial` (usually [`initial_relative_pose`]).
///
/// Only views kept by both mono calibrations take part.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip_all, fields(views = samples.len())))]
pub fn refine_stereo(
    samples: &[ViewSample],
    left: &MonoCalibration,
    right: &MonoCalibration,
    initial: &Pose,
    flags: &StereoFlags,
    lm: &LmOptions,
) -> Result<StereoEstimate, SolverError> {
    let shared = shared_views(left, right);
    if shared.is_empty() {
        return Err(SolverError::InsufficientViews { needed: 1, got: 0 });
    }
    let relative = *initial;

    let mut left_start = left.intrinsics;
    let mut right_start = right.intrinsics;
    let same_focal = flags.same_focal_length && !flags.fix_intrinsics;
    if flags.same_focal_length && flags.fix_intrinsics {
        log::warn!("same_focal_length has no effect while intrinsics are fixed");
    }
    if same_focal {
        let fx = 0.5 * (left_start.fx + right_start.fx);
        let fy = 0.5 * (left_start.fy + right_start.fy);
        left_start.fx = fx;
        left_start.fy = fy;
        right_start.fx = fx;
        right_start.fy = fy;
        log::debug!("shared focal lengths start at fx={fx:.3} fy={fy:.3}");
    }
    if !flags.fix_intrinsics {
        left_start = flags.intrinsics.constrain(&left_start);
        right_start = flags.intrinsics.constrain(&right_start);
    }
    left_start.validate()?;
    right_start.validate()?;

    let mut next_col = 0;
    let (left_layout, right_layout) = if flags.fix_intrinsics {
        (IntrinsicsLayout::fixed(), IntrinsicsLayout::fixed())
    } else {
        let l = IntrinsicsLayout::allocate(&flags.intrinsics, &left_start, &mut next_col);
        let r = if same_focal {
            let right_flags = IntrinsicsFlags {
                fix_focal_length: true,
                ..flags.intrinsics
            };
            let mut r = IntrinsicsLayout::allocate(&right_flags, &right_start, &mut next_col);
            r.share_focal_with(&l);
            r
        } else {
            IntrinsicsLayout::allocate(&flags.intrinsics, &right_start, &mut next_col)
        };
        (l, r)
    };

    let views: Vec<(usize, &ViewSample)> = shared
        .iter()
        .filter_map(|(idx, _, _)| samples.get(*idx).map(|s| (*idx, s)))
        .collect();
    if views.len() != shared.len() {
        return Err(SolverError::InsufficientViews {
            needed: shared.len(),
            got: views.len(),
        });
    }
    let poses: Vec<Pose> = shared.iter().map(|(_, l, _)| *l).collect();
    if let Some((view, point)) = find_unprojectable(&views, &poses) {
        return Err(SolverError::NotProjectable {
            side: Side::Left,
            view,
            point,
        });
    }
    let right_poses: Vec<Pose> = poses.iter().map(|p| p.then(&relative)).collect();
    if let Some((view, point)) = find_unprojectable(&views, &right_poses) {
        return Err(SolverError::NotProjectable {
            side: Side::Right,
            view,
            point,
        });
    }

    let n_residuals = 4 * views.iter().map(|(_, s)| s.len()).sum::<usize>();
    let problem = StereoProblem {
        views,
        left_layout,
        right_layout,
        rel_col: next_col,
        n_residuals,
    };
    let (state, report) = minimize(
        &problem,
        StereoState {
            left: left_start,
            right: right_start,
            relative,
            poses,
        },
        lm,
    )?;

    let residuals = problem
        .residuals(&state)
        .ok_or(SolverError::ResidualEvaluation)?;
    let rms = reprojection_rms(&residuals);

    let mut left_poses = vec![None; samples.len()];
    let mut per_view_rms = vec![None; samples.len()];
    let (mut left_sq, mut right_sq, mut n_points) = (0.0, 0.0, 0usize);
    let mut row = 0;
    for ((idx, sample), pose) in problem.views.iter().zip(&state.poses) {
        let len = 2 * sample.len();
        let l = residuals.rows(row, len).norm_squared();
        let r = residuals.rows(row + len, len).norm_squared();
        left_sq += l;
        right_sq += r;
        n_points += sample.len();
        left_poses[*idx] = Some(*pose);
        per_view_rms[*idx] = Some(((l + r) / (2 * sample.len()) as f64).sqrt());
        row += 2 * len;
    }
    let left_rms = (left_sq / n_points as f64).sqrt();
    let right_rms = (right_sq / n_points as f64).sqrt();

    if !report.termination.converged() {
        log::warn!(
            "stereo refinement stopped after {} iterations without converging",
            report.iterations
        );
    }
    log::info!(
        "stereo refined over {} views: rms {rms:.4} px (left {left_rms:.4}, right {right_rms:.4}), |T|={:.4}, {:?}",
        problem.views.len(),
        state.relative.translation.norm(),
        report.termination
    );

    Ok(StereoEstimate {
        left: state.left,
        right: state.right,
        relative: state.relative,
        left_poses,
        rms,
        left_rms,
        right_rms,
        per_view_rms,
        report,
    })
}
