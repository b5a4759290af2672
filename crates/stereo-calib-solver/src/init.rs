//! Closed-form initialization from plane-to-image homographies.
//!
//! Distortion is ignored here; the refiners take it from zero.

use crate::SolverError;
use nalgebra::{DMatrix, DVector, Matrix3, Point2, Point3, SVector, Vector3};
use serde::{Deserialize, Serialize};
use stereo_calib_core::{
    estimate_homography,
    pose::{nearest_rotation, orthonormality_error},
    CameraIntrinsics, Homography, ImageSize, Pose, Side, ViewSample,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// How the initial camera matrix is obtained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum IntrinsicsInit {
    /// Principal point at the image center, focal lengths from the
    /// homographies; works from a single view.
    #[default]
    CameraMatrix2d,
    /// Full absolute-conic solve (needs three views); falls back to
    /// `CameraMatrix2d` with fewer.
    Zhang,
    /// Start from a user-supplied guess.
    Guess { intrinsics: CameraIntrinsics },
}

/// Options for [`initialize_camera`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitOptions {
    pub intrinsics: IntrinsicsInit,
    /// `fx / fy` imposed by [`init_camera_matrix_2d`]; `None` leaves both free.
    pub aspect_ratio: Option<f64>,
    /// Views whose homography transfer RMS exceeds this (pixels) are dropped.
    pub max_homography_rms_px: f64,
    /// Largest accepted deviation of `K^-1 [h1 h2]` from orthonormal columns.
    pub max_column_skew: f64,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            intrinsics: IntrinsicsInit::default(),
            aspect_ratio: Some(1.0),
            max_homography_rms_px: 25.0,
            max_column_skew: 0.25,
        }
    }
}

/// Why a view was left out of initialization.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewDropReason {
    /// The DLT had no unique solution.
    DegenerateHomography,
    /// The observations do not follow a plane-to-image mapping (e.g. out of order).
    InconsistentGrid { rms_px: f64 },
    /// `K^-1 H` is too far from a scaled rotation.
    NonOrthonormal { skew: f64 },
    /// Some board points end up behind the camera.
    NegativeDepth,
}

impl std::fmt::Display for ViewDropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewDropReason::DegenerateHomography => f.write_str("degenerate homography"),
            ViewDropReason::InconsistentGrid { rms_px } => {
                write!(f, "grid inconsistent with a homography (rms {rms_px:.2} px)")
            }
            ViewDropReason::NonOrthonormal { skew } => {
                write!(f, "homography columns not orthonormal (skew {skew:.3})")
            }
            ViewDropReason::NegativeDepth => f.write_str("board behind the camera"),
        }
    }
}

/// Initial estimate for one camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraInit {
    /// Camera matrix with zero distortion.
    pub intrinsics: CameraIntrinsics,
    /// One entry per input view; `None` for dropped views.
    pub poses: Vec<Option<Pose>>,
    pub dropped: Vec<(usize, ViewDropReason)>,
}

impl CameraInit {
    pub fn kept_views(&self) -> usize {
        self.poses.iter().filter(|p| p.is_some()).count()
    }
}

/// RMS transfer error of `H` over the correspondences, in pixels.
pub fn homography_rms(h: &Homography, object_xy: &[Point2<f64>], image: &[Point2<f64>]) -> f64 {
    h.rms_transfer_error(object_xy, image)
}

/// Zhang's `v_ij` row built from columns `i` and `j` of `H`.
fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);
    SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Camera matrix from at least three plane homographies (absolute conic).
///
/// The system is solved in a centered, scaled pixel frame and assumes zero
/// skew.
pub fn intrinsics_from_homographies(
    homographies: &[Matrix3<f64>],
    image_size: ImageSize,
) -> Result<CameraIntrinsics, SolverError> {
    if homographies.len() < 3 {
        return Err(SolverError::InsufficientViews {
            needed: 3,
            got: homographies.len(),
        });
    }

    let (w, h) = (image_size.width as f64, image_size.height as f64);
    let s = 2.0 / (w + h);
    let norm = Matrix3::new(s, 0.0, -s * 0.5 * w, 0.0, s, -s * 0.5 * h, 0.0, 0.0, 1.0);

    let m = homographies.len();
    let mut v = DMatrix::<f64>::zeros(2 * m + 1, 6);
    for (k, hm) in homographies.iter().enumerate() {
        let hn = norm * hm;
        let hn = hn / hn.norm();
        let v11 = v_ij(&hn, 0, 0);
        let v22 = v_ij(&hn, 1, 1);
        let v12 = v_ij(&hn, 0, 1);
        v.row_mut(2 * k).copy_from(&v12.transpose());
        v.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }
    // zero skew: B12 = 0
    v[(2 * m, 1)] = 1.0;

    let svd = v.svd(false, true);
    let v_t = svd.v_t.ok_or(SolverError::DegenerateHomographies {
        reason: "SVD failed",
    })?;
    let (min_idx, _) = svd.singular_values.argmin();
    let mut b = v_t.row(min_idx).transpose();
    if b[0] < 0.0 {
        b = -b;
    }
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() <= 1e-12 * (b11 * b11 + b22 * b22) || b11 <= 0.0 {
        return Err(SolverError::DegenerateHomographies {
            reason: "image of the absolute conic is not positive definite",
        });
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda <= 0.0 {
        return Err(SolverError::DegenerateHomographies {
            reason: "negative conic scale",
        });
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let u0 = -b13 * alpha * alpha / lambda;

    // undo the normalization: K = N^-1 K'
    let fx = alpha / s;
    let fy = beta / s;
    let cx = u0 / s + 0.5 * w;
    let cy = v0 / s + 0.5 * h;
    let intr = CameraIntrinsics::new(fx, fy, cx, cy);
    intr.validate()?;
    Ok(intr)
}

/// Camera matrix with the principal point pinned to the image center.
///
/// Focal lengths come from the orthogonality of the first two homography
/// columns and of their diagonals, solved as a least-squares problem in
/// `1/fx^2, 1/fy^2`. With `aspect_ratio = Some(a)` the result satisfies
/// `fx = a * fy`.
pub fn init_camera_matrix_2d(
    homographies: &[Matrix3<f64>],
    image_size: ImageSize,
    aspect_ratio: Option<f64>,
) -> Result<CameraIntrinsics, SolverError> {
    if homographies.is_empty() {
        return Err(SolverError::InsufficientViews { needed: 1, got: 0 });
    }
    let c = image_size.center();
    let m = homographies.len();
    let mut a = DMatrix::<f64>::zeros(2 * m, 2);
    let mut rhs = DVector::<f64>::zeros(2 * m);

    for (k, hm) in homographies.iter().enumerate() {
        let mut hm = *hm;
        for col in 0..3 {
            let w = hm[(2, col)];
            hm[(0, col)] -= w * c.x;
            hm[(1, col)] -= w * c.y;
        }
        let h = hm.column(0).into_owned();
        let v = hm.column(1).into_owned();
        let d1 = (h + v) * 0.5;
        let d2 = (h - v) * 0.5;
        let (h, v, d1, d2) = (
            h / h.norm(),
            v / v.norm(),
            d1 / d1.norm(),
            d2 / d2.norm(),
        );
        a[(2 * k, 0)] = h.x * v.x;
        a[(2 * k, 1)] = h.y * v.y;
        rhs[2 * k] = -h.z * v.z;
        a[(2 * k + 1, 0)] = d1.x * d2.x;
        a[(2 * k + 1, 1)] = d1.y * d2.y;
        rhs[2 * k + 1] = -d1.z * d2.z;
    }

    let f = a
        .svd(true, true)
        .solve(&rhs, 1e-12)
        .map_err(|reason| SolverError::DegenerateHomographies { reason })?;
    let mut fx = (1.0 / f[0].abs()).sqrt();
    let mut fy = (1.0 / f[1].abs()).sqrt();
    if let Some(ratio) = aspect_ratio {
        let tf = (fx + fy) / (ratio + 1.0);
        fx = ratio * tf;
        fy = tf;
    }
    let intr = CameraIntrinsics::new(fx, fy, c.x, c.y);
    intr.validate()?;
    Ok(intr)
}

/// Decompose a plane-to-image homography into the board pose.
///
/// `object` is used to verify every board point lies in front of the camera.
pub fn pose_from_homography(
    intrinsics: &CameraIntrinsics,
    h: &Matrix3<f64>,
    object: &[Point3<f64>],
    max_column_skew: f64,
) -> Result<Pose, ViewDropReason> {
    let k_inv = intrinsics
        .k_inverse()
        .map_err(|_| ViewDropReason::DegenerateHomography)?;
    let a1 = k_inv * h.column(0);
    let a2 = k_inv * h.column(1);
    let a3 = k_inv * h.column(2);
    let (n1, n2) = (a1.norm(), a2.norm());
    if n1 <= f64::EPSILON || n2 <= f64::EPSILON {
        return Err(ViewDropReason::DegenerateHomography);
    }

    let ratio_skew = (n1 - n2).abs() / n1.max(n2);
    let cos_skew = (a1.dot(&a2) / (n1 * n2)).abs();
    let skew = ratio_skew.max(cos_skew);
    if skew > max_column_skew {
        return Err(ViewDropReason::NonOrthonormal { skew });
    }

    let mut lambda = 2.0 / (n1 + n2);
    if a3.z * lambda < 0.0 {
        lambda = -lambda;
    }
    let r1 = a1 * lambda;
    let r2 = a2 * lambda;
    let t: Vector3<f64> = a3 * lambda;
    let raw = Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]);
    let rotation = nearest_rotation(&raw).ok_or(ViewDropReason::DegenerateHomography)?;
    debug_assert!(orthonormality_error(rotation.matrix()) < 1e-9);

    let pose = Pose::new(rotation, t);
    if object.iter().any(|p| pose.transform_point(p).z <= 0.0) {
        return Err(ViewDropReason::NegativeDepth);
    }
    Ok(pose)
}

/// Homographies, camera matrix and poses for one camera over all views.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip_all, fields(views = samples.len(), side = %side)))]
pub fn initialize_camera(
    samples: &[ViewSample],
    side: Side,
    image_size: ImageSize,
    options: &InitOptions,
) -> Result<CameraInit, SolverError> {
    let mut dropped = Vec::new();
    let mut homographies: Vec<Option<Matrix3<f64>>> = Vec::with_capacity(samples.len());

    for (idx, sample) in samples.iter().enumerate() {
        let object_xy = sample.object_xy();
        let image = sample.observations(side);
        let Some(h) = estimate_homography(&object_xy, image) else {
            log::warn!("{side} view {idx}: dropped, degenerate homography");
            dropped.push((idx, ViewDropReason::DegenerateHomography));
            homographies.push(None);
            continue;
        };
        let rms_px = homography_rms(&h, &object_xy, image);
        if rms_px > options.max_homography_rms_px {
            let reason = ViewDropReason::InconsistentGrid { rms_px };
            log::warn!("{side} view {idx}: dropped, {reason}");
            dropped.push((idx, reason));
            homographies.push(None);
            continue;
        }
        homographies.push(Some(h.h));
    }

    let kept: Vec<Matrix3<f64>> = homographies.iter().flatten().copied().collect();
    if kept.is_empty() {
        return Err(SolverError::InsufficientViews { needed: 1, got: 0 });
    }

    let intrinsics = match options.intrinsics {
        IntrinsicsInit::Guess { intrinsics } => {
            intrinsics.validate()?;
            intrinsics
        }
        IntrinsicsInit::Zhang if kept.len() >= 3 => {
            intrinsics_from_homographies(&kept, image_size)?
        }
        IntrinsicsInit::Zhang | IntrinsicsInit::CameraMatrix2d => {
            init_camera_matrix_2d(&kept, image_size, options.aspect_ratio)?
        }
    };
    log::info!(
        "{side} camera init from {} views: fx={:.2} fy={:.2} cx={:.2} cy={:.2}",
        kept.len(),
        intrinsics.fx,
        intrinsics.fy,
        intrinsics.cx,
        intrinsics.cy
    );

    let mut poses = Vec::with_capacity(samples.len());
    for (idx, (sample, h)) in samples.iter().zip(&homographies).enumerate() {
        let Some(h) = h else {
            poses.push(None);
            continue;
        };
        match pose_from_homography(&intrinsics, h, sample.object_points(), options.max_column_skew)
        {
            Ok(pose) => poses.push(Some(pose)),
            Err(reason) => {
                log::warn!("{side} view {idx}: dropped, {reason}");
                dropped.push((idx, reason));
                poses.push(None);
            }
        }
    }
    dropped.sort_by_key(|(idx, _)| *idx);

    Ok(CameraInit {
        intrinsics,
        poses,
        dropped,
    })
}
