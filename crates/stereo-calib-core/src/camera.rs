use crate::CoreError;
use nalgebra::{Matrix2, Matrix3, SMatrix, Vector2};
use serde::{Deserialize, Serialize};

/// Number of scalar intrinsic parameters: `fx, fy, cx, cy, k1, k2, p1, p2, k3`.
pub const NUM_INTRINSIC_PARAMS: usize = 9;

/// Image dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Geometric image center `((w - 1) / 2, (h - 1) / 2)`.
    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(
            (self.width as f64 - 1.0) * 0.5,
            (self.height as f64 - 1.0) * 0.5,
        )
    }
}

/// Brown-Conrady radial/tangential lens distortion.
///
/// Coefficients follow the OpenCV order `(k1, k2, p1, p2, k3)`. The model is
/// applied to normalized (z = 1) camera coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub const ZERO: Self = Self {
        k1: 0.0,
        k2: 0.0,
        p1: 0.0,
        p2: 0.0,
        k3: 0.0,
    };

    pub fn from_opencv(c: [f64; 5]) -> Self {
        Self {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
        }
    }

    pub fn to_opencv(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_zero(&self) -> bool {
        self.to_opencv().iter().all(|c| *c == 0.0)
    }

    /// Apply the forward distortion model to a normalized point.
    #[inline]
    pub fn apply(&self, p: Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        Vector2::new(
            x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        )
    }

    /// Forward model plus its Jacobians.
    ///
    /// Returns `(distorted, d/d(x, y), d/d(k1, k2, p1, p2, k3))`.
    pub fn apply_with_jacobian(
        &self,
        p: Vector2<f64>,
    ) -> (Vector2<f64>, Matrix2<f64>, SMatrix<f64, 2, 5>) {
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        // d(radial)/d(r2)
        let d_radial = self.k1 + 2.0 * self.k2 * r2 + 3.0 * self.k3 * r4;

        let distorted = self.apply(p);

        let d_point = Matrix2::new(
            radial + 2.0 * x * x * d_radial + 2.0 * self.p1 * y + 6.0 * self.p2 * x,
            2.0 * x * y * d_radial + 2.0 * self.p1 * x + 2.0 * self.p2 * y,
            2.0 * x * y * d_radial + 2.0 * self.p1 * x + 2.0 * self.p2 * y,
            radial + 2.0 * y * y * d_radial + 6.0 * self.p1 * y + 2.0 * self.p2 * x,
        );

        let d_coeffs = SMatrix::<f64, 2, 5>::new(
            x * r2,
            x * r4,
            2.0 * x * y,
            r2 + 2.0 * x * x,
            x * r6,
            y * r2,
            y * r4,
            r2 + 2.0 * y * y,
            2.0 * x * y,
            y * r6,
        );

        (distorted, d_point, d_coeffs)
    }

    /// Invert the model with fixed-point iterations.
    ///
    /// Converges for the moderate distortion found on ordinary lenses; the
    /// result is the best estimate after `max_iters` steps.
    pub fn undistort(&self, pd: Vector2<f64>, max_iters: usize) -> Vector2<f64> {
        if self.is_zero() {
            return pd;
        }
        let mut p = pd;
        for _ in 0..max_iters {
            let (x, y) = (p.x, p.y);
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
            if radial.abs() < 1e-12 {
                break;
            }
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            let next = Vector2::new((pd.x - dx) / radial, (pd.y - dy) / radial);
            let step = (next - p).norm();
            p = next;
            if step < 1e-14 {
                break;
            }
        }
        p
    }
}

/// Pinhole intrinsics with lens distortion.
///
/// Invariant: `fx > 0` and `fy > 0`; see [`CameraIntrinsics::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub distortion: Distortion,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: Distortion::ZERO,
        }
    }

    pub fn with_distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = distortion;
        self
    }

    /// Build from a 3x3 camera matrix (skew is ignored).
    pub fn from_k_matrix(k: &Matrix3<f64>, distortion: Distortion) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
            distortion,
        }
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Closed-form inverse of the camera matrix.
    pub fn k_inverse(&self) -> Result<Matrix3<f64>, CoreError> {
        self.validate()?;
        Ok(Matrix3::new(
            1.0 / self.fx,
            0.0,
            -self.cx / self.fx,
            0.0,
            1.0 / self.fy,
            -self.cy / self.fy,
            0.0,
            0.0,
            1.0,
        ))
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let finite = [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .chain(self.distortion.to_opencv().iter())
            .all(|v| v.is_finite());
        if !finite || self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(CoreError::InvalidIntrinsics {
                fx: self.fx,
                fy: self.fy,
            });
        }
        Ok(())
    }

    /// Parameter vector `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    pub fn to_params(&self) -> [f64; NUM_INTRINSIC_PARAMS] {
        let d = &self.distortion;
        [
            self.fx, self.fy, self.cx, self.cy, d.k1, d.k2, d.p1, d.p2, d.k3,
        ]
    }

    pub fn from_params(p: &[f64; NUM_INTRINSIC_PARAMS]) -> Self {
        Self {
            fx: p[0],
            fy: p[1],
            cx: p[2],
            cy: p[3],
            distortion: Distortion {
                k1: p[4],
                k2: p[5],
                p1: p[6],
                p2: p[7],
                k3: p[8],
            },
        }
    }

    /// Map a pixel to undistorted normalized coordinates.
    pub fn normalize_pixel(&self, px: Vector2<f64>) -> Vector2<f64> {
        let pd = Vector2::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy);
        self.distortion.undistort(pd, 20)
    }

    /// Map normalized (undistorted) coordinates back to a distorted pixel.
    pub fn denormalize(&self, p: Vector2<f64>) -> Vector2<f64> {
        let d = self.distortion.apply(p);
        Vector2::new(self.fx * d.x + self.cx, self.fy * d.y + self.cy)
    }
}
