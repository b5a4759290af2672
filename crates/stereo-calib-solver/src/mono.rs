//! Single-camera bundle adjustment over intrinsics, distortion and view poses.

use crate::init::{initialize_camera, CameraInit, InitOptions, ViewDropReason};
use crate::lm::{minimize, LeastSquaresProblem, LmOptions, LmReport};
use crate::params::{IntrinsicsFlags, IntrinsicsLayout};
use crate::SolverError;
use nalgebra::{DMatrix, DVector, Matrix2x3, Point3, Vector3};
use serde::{Deserialize, Serialize};
use stereo_calib_core::{
    pose::skew, project_point, project_with_jacobian, projection::MIN_DEPTH, CameraIntrinsics,
    ImageSize, Pose, Side, ViewSample,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Refined calibration of one camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonoCalibration {
    pub side: Side,
    pub intrinsics: CameraIntrinsics,
    /// Board pose per input view; `None` where the view was dropped.
    pub poses: Vec<Option<Pose>>,
    /// Reprojection RMS over all kept points, in pixels.
    pub rms: f64,
    /// Reprojection RMS per view; `None` where the view was dropped.
    pub per_view_rms: Vec<Option<f64>>,
    pub report: LmReport,
    /// Views left out during initialization, with the reason.
    pub dropped: Vec<(usize, ViewDropReason)>,
}

impl MonoCalibration {
    pub fn used_views(&self) -> usize {
        self.poses.iter().filter(|p| p.is_some()).count()
    }
}

/// `sqrt(sum |r|^2 / n_points)`: RMS of the 2D reprojection error norm.
pub fn reprojection_rms(residuals: &DVector<f64>) -> f64 {
    let n_points = residuals.len() / 2;
    if n_points == 0 {
        return 0.0;
    }
    (residuals.norm_squared() / n_points as f64).sqrt()
}

/// Write `d_pixel / d(dw, dt)` of a left-multiplied pose update into
/// `jac[row..row + 2, col..col + 6]`, pre-multiplied by `d_pixel_d_point`.
///
/// `rotated` is `R * X` (the point before translation).
pub(crate) fn write_pose_block(
    jac: &mut DMatrix<f64>,
    row: usize,
    col: usize,
    d_pixel_d_point: &Matrix2x3<f64>,
    rotated: &Vector3<f64>,
) {
    let d_rot = d_pixel_d_point * (-skew(rotated));
    jac.fixed_view_mut::<2, 3>(row, col).copy_from(&d_rot);
    jac.fixed_view_mut::<2, 3>(row, col + 3)
        .copy_from(d_pixel_d_point);
}

pub(crate) const POSE_PARAM_NAMES: [&str; 6] = ["rx", "ry", "rz", "tx", "ty", "tz"];

pub(crate) fn pose_label(view: usize, k: usize) -> String {
    format!("view{view}.{}", POSE_PARAM_NAMES[k])
}

#[derive(Clone, Debug)]
struct MonoState {
    intrinsics: CameraIntrinsics,
    poses: Vec<Pose>,
}

struct MonoProblem<'a> {
    side: Side,
    /// `(input index, sample)` for every kept view, in state order.
    views: Vec<(usize, &'a ViewSample)>,
    layout: IntrinsicsLayout,
    n_intrinsics: usize,
    n_residuals: usize,
}

impl MonoProblem<'_> {
    fn pose_col(&self, v: usize) -> usize {
        self.n_intrinsics + 6 * v
    }
}

impl LeastSquaresProblem for MonoProblem<'_> {
    type State = MonoState;

    fn num_params(&self) -> usize {
        self.n_intrinsics + 6 * self.views.len()
    }

    fn residuals(&self, state: &MonoState) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(self.n_residuals);
        let mut row = 0;
        for ((_, sample), pose) in self.views.iter().zip(&state.poses) {
            let obs = sample.observations(self.side);
            for (x, uv) in sample.object_points().iter().zip(obs) {
                let px = project_point(&state.intrinsics, &pose.transform_point(x))?;
                r[row] = px.x - uv.x;
                r[row + 1] = px.y - uv.y;
                row += 2;
            }
        }
        Some(r)
    }

    fn linearize(&self, state: &MonoState) -> Option<(DVector<f64>, DMatrix<f64>)> {
        let mut r = DVector::zeros(self.n_residuals);
        let mut jac = DMatrix::zeros(self.n_residuals, self.num_params());
        let mut row = 0;
        for (v, ((_, sample), pose)) in self.views.iter().zip(&state.poses).enumerate() {
            let obs = sample.observations(self.side);
            let col = self.pose_col(v);
            for (x, uv) in sample.object_points().iter().zip(obs) {
                let rotated = pose.rotation * x.coords;
                let pc = Point3::from(rotated + pose.translation);
                let (px, pj) = project_with_jacobian(&state.intrinsics, &pc)?;
                r[row] = px.x - uv.x;
                r[row + 1] = px.y - uv.y;
                self.layout.scatter(&mut jac, row, &pj.d_intrinsics);
                write_pose_block(&mut jac, row, col, &pj.d_point, &rotated);
                row += 2;
            }
        }
        Some((r, jac))
    }

    fn retract(&self, state: &MonoState, delta: &DVector<f64>) -> MonoState {
        let poses = state
            .poses
            .iter()
            .enumerate()
            .map(|(v, pose)| {
                let c = self.pose_col(v);
                pose.retract(
                    &delta.fixed_rows::<3>(c).into_owned(),
                    &delta.fixed_rows::<3>(c + 3).into_owned(),
                )
            })
            .collect();
        MonoState {
            intrinsics: self.layout.apply(&state.intrinsics, delta),
            poses,
        }
    }

    fn parameter_label(&self, index: usize) -> String {
        if index < self.n_intrinsics {
            let name = self.layout.label(index).unwrap_or("intrinsic");
            return format!("{}.{name}", self.side);
        }
        let v = (index - self.n_intrinsics) / 6;
        pose_label(self.views[v].0, (index - self.n_intrinsics) % 6)
    }
}

/// Locate the first point that lands behind its camera, for error reporting.
pub(crate) fn find_unprojectable(
    views: &[(usize, &ViewSample)],
    poses: &[Pose],
) -> Option<(usize, usize)> {
    views.iter().zip(poses).find_map(|((idx, sample), pose)| {
        sample
            .object_points()
            .iter()
            .position(|x| pose.transform_point(x).z <= MIN_DEPTH)
            .map(|p| (*idx, p))
    })
}

/// Refine one camera starting from [`initialize_camera`]'s output.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip_all, fields(side = %side)))]
pub fn refine_mono(
    samples: &[ViewSample],
    side: Side,
    init: &CameraInit,
    flags: &IntrinsicsFlags,
    lm: &LmOptions,
) -> Result<MonoCalibration, SolverError> {
    init.intrinsics.validate()?;
    let views: Vec<(usize, &ViewSample)> = samples
        .iter()
        .enumerate()
        .zip(&init.poses)
        .filter_map(|((idx, s), p)| p.map(|_| (idx, s)))
        .collect();
    if views.is_empty() {
        return Err(SolverError::InsufficientViews { needed: 1, got: 0 });
    }
    let poses: Vec<Pose> = init.poses.iter().flatten().copied().collect();

    let start = flags.constrain(&init.intrinsics);
    let mut n_intrinsics = 0;
    let layout = IntrinsicsLayout::allocate(flags, &start, &mut n_intrinsics);
    let n_residuals = 2 * views.iter().map(|(_, s)| s.len()).sum::<usize>();

    if let Some((view, point)) = find_unprojectable(&views, &poses) {
        return Err(SolverError::NotProjectable { side, view, point });
    }

    let problem = MonoProblem {
        side,
        views,
        layout,
        n_intrinsics,
        n_residuals,
    };
    let (state, report) = minimize(
        &problem,
        MonoState {
            intrinsics: start,
            poses,
        },
        lm,
    )?;

    let residuals = problem
        .residuals(&state)
        .ok_or(SolverError::ResidualEvaluation)?;
    let rms = reprojection_rms(&residuals);

    let mut out_poses = vec![None; samples.len()];
    let mut per_view_rms = vec![None; samples.len()];
    let mut row = 0;
    for ((idx, sample), pose) in problem.views.iter().zip(&state.poses) {
        let len = 2 * sample.len();
        out_poses[*idx] = Some(*pose);
        per_view_rms[*idx] = Some(reprojection_rms(&residuals.rows(row, len).into_owned()));
        row += len;
    }

    if !report.termination.converged() {
        log::warn!(
            "{side} refinement stopped after {} iterations without converging",
            report.iterations
        );
    }
    log::info!(
        "{side} camera refined over {} views: rms {rms:.4} px, fx={:.2} fy={:.2} cx={:.2} cy={:.2} ({:?})",
        problem.views.len(),
        state.intrinsics.fx,
        state.intrinsics.fy,
        state.intrinsics.cx,
        state.intrinsics.cy,
        report.termination
    );

    Ok(MonoCalibration {
        side,
        intrinsics: state.intrinsics,
        poses: out_poses,
        rms,
        per_view_rms,
        report,
        dropped: init.dropped.clone(),
    })
}

/// Initialize and refine one camera.
pub fn calibrate_mono(
    samples: &[ViewSample],
    side: Side,
    image_size: ImageSize,
    init: &InitOptions,
    flags: &IntrinsicsFlags,
    lm: &LmOptions,
) -> Result<MonoCalibration, SolverError> {
    let init = initialize_camera(samples, side, image_size, init)?;
    refine_mono(samples, side, &init, flags, lm)
}
