//! Rigid transforms and rotation helpers.

use crate::CoreError;
use nalgebra::{Matrix3, Matrix4, Point3, Quaternion, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Rigid transform mapping points from a source frame into a target frame:
/// `p_target = R * p_source + t`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub fn new(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Rotation3::identity(), Vector3::zeros())
    }

    /// Build from an axis-angle (Rodrigues) vector and a translation.
    pub fn from_axis_angle(rvec: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self::new(Rotation3::from_scaled_axis(rvec), translation)
    }

    /// Build from a 3x3 matrix that must already be a proper rotation.
    pub fn from_matrix(r: &Matrix3<f64>, translation: Vector3<f64>) -> Result<Self, CoreError> {
        let deviation = orthonormality_error(r);
        if deviation > 1e-6 || r.determinant() <= 0.0 {
            return Err(CoreError::NonOrthonormalRotation { deviation });
        }
        Ok(Self::new(
            Rotation3::from_matrix_unchecked(*r),
            translation,
        ))
    }

    /// Axis-angle (Rodrigues) vector of the rotation part.
    pub fn axis_angle(&self) -> Vector3<f64> {
        self.rotation.scaled_axis()
    }

    #[inline]
    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.rotation * p + self.translation
    }

    pub fn inverse(&self) -> Self {
        let r_inv = self.rotation.inverse();
        Self::new(r_inv, -(r_inv * self.translation))
    }

    /// Apply `self` first, then `next`: `next ∘ self`.
    pub fn then(&self, next: &Pose) -> Self {
        Self::new(
            next.rotation * self.rotation,
            next.rotation * self.translation + next.translation,
        )
    }

    /// Left-multiplicative update `R <- exp(dw) R`, `t <- t + dt`.
    pub fn retract(&self, dw: &Vector3<f64>, dt: &Vector3<f64>) -> Self {
        Self::new(
            Rotation3::from_scaled_axis(*dw) * self.rotation,
            self.translation + dt,
        )
    }

    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }
}

/// Cross-product matrix: `skew(a) * b == a.cross(&b)`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Frobenius norm of `R R^T - I`.
pub fn orthonormality_error(r: &Matrix3<f64>) -> f64 {
    (r * r.transpose() - Matrix3::identity()).norm()
}

/// Closest rotation in the Frobenius sense (polar decomposition via SVD).
pub fn nearest_rotation(m: &Matrix3<f64>) -> Option<Rotation3<f64>> {
    let svd = m.svd(true, true);
    let mut u = svd.u?;
    let v_t = svd.v_t?;
    if (u * v_t).determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    Some(Rotation3::from_matrix_unchecked(u * v_t))
}

/// Principal square root: the rotation about the same axis by half the angle.
pub fn rotation_sqrt(r: &Rotation3<f64>) -> Rotation3<f64> {
    Rotation3::from_scaled_axis(r.scaled_axis() * 0.5)
}

/// Sign-aligned quaternion mean of a set of rotations.
///
/// Good for tightly clustered rotations, which is what per-view relative
/// pose estimates of a rigid rig are.
pub fn mean_rotation(rotations: &[Rotation3<f64>]) -> Option<Rotation3<f64>> {
    let first = UnitQuaternion::from_rotation_matrix(rotations.first()?);
    let mut acc = Vector3::zeros();
    let mut acc_w = 0.0;
    for r in rotations {
        let q = UnitQuaternion::from_rotation_matrix(r);
        let sign = if q.coords.dot(&first.coords) < 0.0 {
            -1.0
        } else {
            1.0
        };
        acc += q.imag() * sign;
        acc_w += q.w * sign;
    }
    let q = Quaternion::from_parts(acc_w, acc);
    if q.norm() < 1e-12 {
        return None;
    }
    Some(UnitQuaternion::from_quaternion(q).to_rotation_matrix())
}

/// Angle (radians) of `a^T b`.
pub fn rotation_angle_between(a: &Rotation3<f64>, b: &Rotation3<f64>) -> f64 {
    (a.inverse() * b).angle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn then_and_inverse_compose_to_identity() {
        let a = Pose::from_axis_angle(Vector3::new(0.1, -0.2, 0.3), Vector3::new(1.0, 2.0, 3.0));
        let id = a.then(&a.inverse());
        assert_relative_eq!(id.matrix(), Matrix4::identity(), epsilon = 1e-12);

        let p = Point3::new(0.3, -0.7, 2.0);
        let b = Pose::from_axis_angle(Vector3::new(0.0, 0.4, 0.0), Vector3::new(-0.5, 0.0, 0.1));
        let chained = b.transform_point(&a.transform_point(&p));
        assert_relative_eq!(a.then(&b).transform_point(&p), chained, epsilon = 1e-12);
    }

    #[test]
    fn skew_matches_cross_product() {
        let a = Vector3::new(0.3, -1.2, 2.0);
        let b = Vector3::new(-0.7, 0.1, 0.5);
        assert_relative_eq!(skew(&a) * b, a.cross(&b), epsilon = 1e-15);
    }

    #[test]
    fn rotation_sqrt_squares_back() {
        let r = Rotation3::from_scaled_axis(Vector3::new(0.05, 0.4, -0.1));
        let h = rotation_sqrt(&r);
        assert_relative_eq!((h * h).matrix(), r.matrix(), epsilon = 1e-12);
    }

    #[test]
    fn nearest_rotation_fixes_perturbed_matrix() {
        let r = Rotation3::from_euler_angles(0.2, -0.1, 0.3);
        let noisy = r.matrix() + Matrix3::from_element(1e-4);
        let fixed = nearest_rotation(&noisy).expect("svd");
        assert!(orthonormality_error(fixed.matrix()) < 1e-12);
        assert!(fixed.matrix().determinant() > 0.0);
        assert!(rotation_angle_between(&fixed, &r) < 1e-3);
    }

    #[test]
    fn mean_rotation_handles_quaternion_sign_flips() {
        let base = Rotation3::from_euler_angles(0.1, 0.2, -0.3);
        let jitter = [
            Rotation3::from_scaled_axis(Vector3::new(1e-3, 0.0, 0.0)),
            Rotation3::from_scaled_axis(Vector3::new(-1e-3, 0.0, 0.0)),
            Rotation3::identity(),
        ];
        let rs: Vec<_> = jitter.iter().map(|j| j * base).collect();
        let mean = mean_rotation(&rs).expect("mean");
        assert!(rotation_angle_between(&mean, &base) < 1e-6);
    }

    #[test]
    fn from_matrix_rejects_non_rotations() {
        let m = Matrix3::new(1.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 1.0);
        assert!(Pose::from_matrix(&m, Vector3::zeros()).is_err());
        let reflection = Matrix3::new(-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        assert!(Pose::from_matrix(&reflection, Vector3::zeros()).is_err());
    }
}
