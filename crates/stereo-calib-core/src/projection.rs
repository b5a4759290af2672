//! Pinhole projection with distortion, and its analytic Jacobians.

use crate::{CameraIntrinsics, NUM_INTRINSIC_PARAMS};
use nalgebra::{Matrix2x3, Point2, Point3, SMatrix, Vector2};

/// Points closer to the image plane than this are treated as not projectable.
pub const MIN_DEPTH: f64 = 1e-9;

/// Jacobians of a projected pixel.
#[derive(Clone, Copy, Debug)]
pub struct ProjectionJacobian {
    /// d(u, v) / d(fx, fy, cx, cy, k1, k2, p1, p2, k3)
    pub d_intrinsics: SMatrix<f64, 2, NUM_INTRINSIC_PARAMS>,
    /// d(u, v) / d(X, Y, Z) of the camera-frame point.
    pub d_point: Matrix2x3<f64>,
}

/// Project a camera-frame point to a (distorted) pixel.
#[inline]
pub fn project_point(intr: &CameraIntrinsics, pc: &Point3<f64>) -> Option<Point2<f64>> {
    if pc.z <= MIN_DEPTH {
        return None;
    }
    let p = intr.denormalize(Vector2::new(pc.x / pc.z, pc.y / pc.z));
    Some(Point2::new(p.x, p.y))
}

/// Project a camera-frame point and return the Jacobians needed by the
/// least-squares refiners.
pub fn project_with_jacobian(
    intr: &CameraIntrinsics,
    pc: &Point3<f64>,
) -> Option<(Point2<f64>, ProjectionJacobian)> {
    if pc.z <= MIN_DEPTH {
        return None;
    }
    let inv_z = 1.0 / pc.z;
    let n = Vector2::new(pc.x * inv_z, pc.y * inv_z);
    let (d, d_dist_d_n, d_dist_d_coeffs) = intr.distortion.apply_with_jacobian(n);

    let u = intr.fx * d.x + intr.cx;
    let v = intr.fy * d.y + intr.cy;

    let mut d_intrinsics = SMatrix::<f64, 2, NUM_INTRINSIC_PARAMS>::zeros();
    d_intrinsics[(0, 0)] = d.x;
    d_intrinsics[(1, 1)] = d.y;
    d_intrinsics[(0, 2)] = 1.0;
    d_intrinsics[(1, 3)] = 1.0;
    for k in 0..5 {
        d_intrinsics[(0, 4 + k)] = intr.fx * d_dist_d_coeffs[(0, k)];
        d_intrinsics[(1, 4 + k)] = intr.fy * d_dist_d_coeffs[(1, k)];
    }

    // d(normalized) / d(point)
    let d_n_d_p = Matrix2x3::new(
        inv_z,
        0.0,
        -n.x * inv_z,
        0.0,
        inv_z,
        -n.y * inv_z,
    );
    let mut d_pix_d_dist = d_dist_d_n;
    d_pix_d_dist.row_mut(0).scale_mut(intr.fx);
    d_pix_d_dist.row_mut(1).scale_mut(intr.fy);
    let d_point = d_pix_d_dist * d_n_d_p;

    Some((
        Point2::new(u, v),
        ProjectionJacobian {
            d_intrinsics,
            d_point,
        },
    ))
}
