//! Rectifying rotations and projections for a calibrated stereo pair.
//!
//! After rectification both cameras share the same orientation with their x
//! axes along the baseline, so a scene point lands on the same row in both
//! images.

use crate::RectifyError;
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use stereo_calib_core::{
    pose::rotation_sqrt, projection::MIN_DEPTH, CameraIntrinsics, ImageSize,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Side length of the border grid used to find the valid image rectangles.
const BORDER_GRID: usize = 9;

/// Where the two rectified principal points go.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalPointAlignment {
    /// Both principal points coincide: points at infinity have zero disparity.
    #[default]
    ZeroDisparity,
    /// Only the rows are shared; each camera keeps its own `cx`.
    SameRow,
}

/// Options for [`stereo_rectify`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RectifyOptions {
    /// Split the relative rotation evenly between the two cameras.
    pub equalize: bool,
    pub alignment: PrincipalPointAlignment,
    /// Free scaling in `[0, 1]`: 0 keeps only valid pixels, 1 keeps every
    /// source pixel. `None` keeps the unscaled focal length.
    pub alpha: Option<f64>,
}

impl Default for RectifyOptions {
    fn default() -> Self {
        Self {
            equalize: true,
            alignment: PrincipalPointAlignment::default(),
            alpha: None,
        }
    }
}

/// Integer pixel rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    /// Overlap of two rectangles; all-zero when they do not overlap.
    pub fn intersect(&self, other: &PixelRect) -> PixelRect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        if x1 <= x0 || y1 <= y0 {
            return PixelRect::default();
        }
        PixelRect::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }

    /// `[x, y, width, height]`.
    pub fn to_array(&self) -> [i32; 4] {
        [self.x, self.y, self.width, self.height]
    }
}

/// Output of [`stereo_rectify`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RectificationTransform {
    /// Rotation from the left camera frame into the rectified left frame.
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    /// Projection of the rectified left frame into the rectified left image.
    pub p1: Matrix3x4<f64>,
    /// Projection of the rectified *left* frame into the rectified right image.
    pub p2: Matrix3x4<f64>,
    /// Disparity-to-depth reprojection matrix.
    pub q: Matrix4<f64>,
    /// Region of the rectified left image covered by valid source pixels.
    pub roi1: PixelRect,
    pub roi2: PixelRect,
    pub image_size: ImageSize,
}

impl RectificationTransform {
    /// Common focal length of both rectified cameras.
    pub fn focal(&self) -> f64 {
        self.p1[(0, 0)]
    }

    /// Signed baseline along the rectified x axis.
    pub fn baseline(&self) -> f64 {
        self.p2[(0, 3)] / self.p2[(0, 0)]
    }

    /// Reproject a rectified left pixel with disparity `x_left - x_right`
    /// into the rectified left camera frame. `None` at zero depth.
    pub fn reproject(&self, pixel: Vector2<f64>, disparity: f64) -> Option<Vector3<f64>> {
        let h = self.q * nalgebra::Vector4::new(pixel.x, pixel.y, disparity, 1.0);
        (h.w.abs() > f64::EPSILON).then(|| h.xyz() / h.w)
    }
}

/// Undistort a source pixel and map it into a rectified image.
///
/// Only the left 3x3 block of `p_rect` is used. `None` when the pixel ends up
/// behind the rectified camera.
pub fn rectify_pixel(
    camera: &CameraIntrinsics,
    r_rect: &Matrix3<f64>,
    p_rect: &Matrix3x4<f64>,
    px: Vector2<f64>,
) -> Option<Vector2<f64>> {
    let n = camera.normalize_pixel(px);
    let ray = r_rect * Vector3::new(n.x, n.y, 1.0);
    if ray.z <= MIN_DEPTH {
        return None;
    }
    let h = p_rect.fixed_view::<3, 3>(0, 0) * (ray / ray.z);
    Some(Vector2::new(h.x / h.z, h.y / h.z))
}

#[derive(Clone, Copy, Debug)]
struct FloatRect {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

impl FloatRect {
    fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    fn height(&self) -> f64 {
        self.y1 - self.y0
    }
}

/// Inscribed and bounding rectangles of the rectified image border.
fn border_rectangles(
    camera: &CameraIntrinsics,
    r_rect: &Matrix3<f64>,
    p_rect: &Matrix3x4<f64>,
    size: ImageSize,
) -> Result<(FloatRect, FloatRect), RectifyError> {
    let step_x = (size.width as f64 - 1.0) / (BORDER_GRID - 1) as f64;
    let step_y = (size.height as f64 - 1.0) / (BORDER_GRID - 1) as f64;
    let mut inner = FloatRect {
        x0: f64::MIN,
        y0: f64::MIN,
        x1: f64::MAX,
        y1: f64::MAX,
    };
    let mut outer = FloatRect {
        x0: f64::MAX,
        y0: f64::MAX,
        x1: f64::MIN,
        y1: f64::MIN,
    };
    for y in 0..BORDER_GRID {
        for x in 0..BORDER_GRID {
            let src = Vector2::new(x as f64 * step_x, y as f64 * step_y);
            let p = rectify_pixel(camera, r_rect, p_rect, src)
                .ok_or(RectifyError::DegenerateRectification)?;
            outer.x0 = outer.x0.min(p.x);
            outer.x1 = outer.x1.max(p.x);
            outer.y0 = outer.y0.min(p.y);
            outer.y1 = outer.y1.max(p.y);
            if x == 0 {
                inner.x0 = inner.x0.max(p.x);
            }
            if x == BORDER_GRID - 1 {
                inner.x1 = inner.x1.min(p.x);
            }
            if y == 0 {
                inner.y0 = inner.y0.max(p.y);
            }
            if y == BORDER_GRID - 1 {
                inner.y1 = inner.y1.min(p.y);
            }
        }
    }
    Ok((inner, outer))
}

fn projection(f: f64, c: Vector2<f64>, tx: f64) -> Matrix3x4<f64> {
    Matrix3x4::new(
        f, 0.0, c.x, tx, //
        0.0, f, c.y, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    )
}

/// Mean rectified position of the four image corners, for unit focal length
/// and zero principal point.
fn mean_corner(
    camera: &CameraIntrinsics,
    r_rect: &Matrix3<f64>,
    size: ImageSize,
) -> Result<Vector2<f64>, RectifyError> {
    let (w, h) = (size.width as f64 - 1.0, size.height as f64 - 1.0);
    let unit = projection(1.0, Vector2::zeros(), 0.0);
    let mut sum = Vector2::zeros();
    for corner in [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)] {
        sum += rectify_pixel(camera, r_rect, &unit, Vector2::new(corner.0, corner.1))
            .ok_or(RectifyError::DegenerateRectification)?;
    }
    Ok(sum / 4.0)
}

/// Scale factor that maps `rect` around `c` onto the `width x height` image
/// borders; one ratio per side.
fn side_ratios(rect: &FloatRect, c: Vector2<f64>, width: f64, height: f64) -> [f64; 4] {
    [
        c.x / (c.x - rect.x0),
        c.y / (c.y - rect.y0),
        (width - c.x) / (rect.x1 - c.x),
        (height - c.y) / (rect.y1 - c.y),
    ]
}

/// Inscribed rectangle scaled by `s` around `c`, clipped to the image.
fn valid_roi(inner: &FloatRect, c: Vector2<f64>, s: f64, size: ImageSize) -> PixelRect {
    let rect = PixelRect::new(
        ((inner.x0 - c.x) * s + c.x).ceil() as i32,
        ((inner.y0 - c.y) * s + c.y).ceil() as i32,
        (inner.width() * s).floor() as i32,
        (inner.height() * s).floor() as i32,
    );
    rect.intersect(&PixelRect::new(0, 0, size.width as i32, size.height as i32))
}

/// Compute rectifying rotations `R1, R2`, projections `P1, P2`, the
/// reprojection matrix `Q` and the valid pixel regions.
///
/// `rotation` / `translation` map left-camera coordinates into the right
/// camera (`X_r = R X_l + T`). The baseline is assumed roughly horizontal.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip_all))]
pub fn stereo_rectify(
    left: &CameraIntrinsics,
    right: &CameraIntrinsics,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    image_size: ImageSize,
    options: &RectifyOptions,
) -> Result<RectificationTransform, RectifyError> {
    if let Some(alpha) = options.alpha {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(RectifyError::InvalidAlpha(alpha));
        }
    }
    if image_size.is_empty() {
        return Err(RectifyError::EmptyImage);
    }
    left.validate()?;
    right.validate()?;
    let baseline = translation.norm();
    if !baseline.is_finite() || baseline <= 1e-12 {
        return Err(RectifyError::ZeroBaseline);
    }

    let (rot_left, rot_right) = if options.equalize {
        let half = rotation_sqrt(rotation);
        (half, half.inverse())
    } else {
        (Rotation3::identity(), rotation.inverse())
    };
    let t = rot_right * translation;
    let e1 = if t.x >= 0.0 { t / baseline } else { -t / baseline };
    let e2 = Vector3::z().cross(&e1);
    let e2_norm = e2.norm();
    if e2_norm < 1e-9 {
        return Err(RectifyError::BaselineAlongOpticalAxis);
    }
    let e2 = e2 / e2_norm;
    let e3 = e1.cross(&e2);
    let w = Matrix3::from_rows(&[e1.transpose(), e2.transpose(), e3.transpose()]);
    let r1 = w * rot_left.matrix();
    let r2 = w * rot_right.matrix();
    let t_rect = r2 * translation;

    let (width, height) = (image_size.width as f64, image_size.height as f64);
    let mut focal = f64::INFINITY;
    for camera in [left, right] {
        let mut f = camera.fy;
        let k1 = camera.distortion.k1;
        if k1 < 0.0 {
            f *= 1.0 + k1 * (width * width + height * height) / (4.0 * f * f);
        }
        focal = focal.min(f);
    }

    let center = image_size.center();
    let mut c1 = center - focal * mean_corner(left, &r1, image_size)?;
    let mut c2 = center - focal * mean_corner(right, &r2, image_size)?;
    match options.alignment {
        PrincipalPointAlignment::ZeroDisparity => {
            let mid = 0.5 * (c1 + c2);
            c1 = mid;
            c2 = mid;
        }
        PrincipalPointAlignment::SameRow => {
            let cy = 0.5 * (c1.y + c2.y);
            c1.y = cy;
            c2.y = cy;
        }
    }

    let (inner1, outer1) = border_rectangles(left, &r1, &projection(focal, c1, 0.0), image_size)?;
    let (inner2, outer2) = border_rectangles(right, &r2, &projection(focal, c2, 0.0), image_size)?;

    let scale = match options.alpha {
        Some(alpha) => {
            let s0 = side_ratios(&inner1, c1, width, height)
                .into_iter()
                .chain(side_ratios(&inner2, c2, width, height))
                .fold(f64::MIN, f64::max);
            let s1 = side_ratios(&outer1, c1, width, height)
                .into_iter()
                .chain(side_ratios(&outer2, c2, width, height))
                .fold(f64::MAX, f64::min);
            s0 * (1.0 - alpha) + s1 * alpha
        }
        None => 1.0,
    };
    let roi1 = valid_roi(&inner1, c1, scale, image_size);
    let roi2 = valid_roi(&inner2, c2, scale, image_size);
    focal *= scale;

    let tx = t_rect.x;
    let p1 = projection(focal, c1, 0.0);
    let p2 = projection(focal, c2, tx * focal);
    let q = Matrix4::new(
        1.0, 0.0, 0.0, -c1.x, //
        0.0, 1.0, 0.0, -c1.y, //
        0.0, 0.0, 0.0, focal, //
        0.0, 0.0, -1.0 / tx, (c1.x - c2.x) / tx,
    );

    log::debug!(
        "rectified: f={focal:.2}, c1=({:.2}, {:.2}), c2=({:.2}, {:.2}), tx={tx:.4}, roi1={:?}, roi2={:?}",
        c1.x,
        c1.y,
        c2.x,
        c2.y,
        roi1.to_array(),
        roi2.to_array()
    );

    Ok(RectificationTransform {
        r1,
        r2,
        p1,
        p2,
        q,
        roi1,
        roi2,
        image_size,
    })
}
