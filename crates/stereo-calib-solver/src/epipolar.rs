//! Essential and fundamental matrices of a calibrated pair.

use crate::SolverError;
use nalgebra::{Matrix3, Point2, Vector3};
use stereo_calib_core::{pose::skew, CameraIntrinsics, Pose};

/// `E = [T]x R` for the left-to-right transform.
pub fn essential_matrix(relative: &Pose) -> Matrix3<f64> {
    skew(&relative.translation) * relative.rotation.matrix()
}

/// `F = K_r^-T E K_l^-1`, scaled so `F[2,2] = 1` when that entry is not zero.
pub fn fundamental_matrix(
    left: &CameraIntrinsics,
    right: &CameraIntrinsics,
    essential: &Matrix3<f64>,
) -> Result<Matrix3<f64>, SolverError> {
    let kl_inv = left.k_inverse()?;
    let kr_inv = right.k_inverse()?;
    let f = kr_inv.transpose() * essential * kl_inv;
    let s = f[(2, 2)];
    if s.abs() > 1e-12 * f.norm() {
        Ok(f / s)
    } else {
        Ok(f)
    }
}

/// Algebraic epipolar residual `x_r^T F x_l` for undistorted pixels.
pub fn epipolar_residual(f: &Matrix3<f64>, left: &Point2<f64>, right: &Point2<f64>) -> f64 {
    Vector3::new(right.x, right.y, 1.0).dot(&(f * Vector3::new(left.x, left.y, 1.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;
    use stereo_calib_core::project_point;

    fn rig() -> (CameraIntrinsics, CameraIntrinsics, Pose) {
        (
            CameraIntrinsics::new(610.0, 605.0, 320.0, 240.0),
            CameraIntrinsics::new(598.0, 600.0, 312.0, 247.0),
            Pose::from_axis_angle(
                Vector3::new(0.01, -0.03, 0.005),
                Vector3::new(-120.0, 2.0, 1.0),
            ),
        )
    }

    #[test]
    fn essential_satisfies_normalized_epipolar_constraint() {
        let (_, _, rel) = rig();
        let e = essential_matrix(&rel);
        let xl = Point3::new(35.0, -20.0, 800.0);
        let xr = rel.transform_point(&xl);
        let (nl, nr) = (xl.coords / xl.z, xr.coords / xr.z);
        assert!(nr.dot(&(e * nl)).abs() < 1e-9);
        // E has rank two
        assert!(e.determinant().abs() < 1e-6);
    }

    #[test]
    fn fundamental_maps_pixels_onto_epipolar_lines() {
        let (kl, kr, rel) = rig();
        let e = essential_matrix(&rel);
        let f = fundamental_matrix(&kl, &kr, &e).expect("valid intrinsics");
        assert!((f[(2, 2)] - 1.0).abs() < 1e-12);

        for xl in [
            Point3::new(0.0, 0.0, 500.0),
            Point3::new(150.0, 80.0, 900.0),
            Point3::new(-90.0, 60.0, 650.0),
        ] {
            let pl = project_point(&kl, &xl).unwrap();
            let pr = project_point(&kr, &rel.transform_point(&xl)).unwrap();
            assert!(epipolar_residual(&f, &pl, &pr).abs() < 1e-9);
        }
    }

    #[test]
    fn non_positive_focal_is_rejected() {
        let (kl, _, rel) = rig();
        let bad = CameraIntrinsics::new(-1.0, 600.0, 320.0, 240.0);
        assert_eq!(
            fundamental_matrix(&kl, &bad, &essential_matrix(&rel)),
            Err(SolverError::InvalidIntrinsics { fx: -1.0, fy: 600.0 })
        );
    }
}
