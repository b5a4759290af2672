//! Dense undistort-rectify lookup tables and a grayscale resampler.

use crate::RectifyError;
use nalgebra::{Matrix3, Matrix3x4, Vector2, Vector3};
use stereo_calib_core::{sample_bilinear_u8, CameraIntrinsics, GrayImage, GrayImageView, ImageSize};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Rays whose homogeneous depth is below this map to `NaN`.
const MIN_RAY_DEPTH: f64 = 1e-12;

/// Per destination pixel, the source pixel to sample (row-major).
///
/// Coordinates may fall outside the source image; rays that never reach the
/// source camera hold `NaN`.
#[derive(Clone, Debug, PartialEq)]
pub struct RemapTable {
    width: usize,
    height: usize,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
}

impl RemapTable {
    /// Both maps must hold exactly `width * height` entries.
    pub fn new(
        width: usize,
        height: usize,
        map_x: Vec<f32>,
        map_y: Vec<f32>,
    ) -> Result<Self, RectifyError> {
        let expected = width * height;
        for got in [map_x.len(), map_y.len()] {
            if got != expected {
                return Err(RectifyError::RemapTableSize {
                    width,
                    height,
                    expected,
                    got,
                });
            }
        }
        Ok(Self {
            width,
            height,
            map_x,
            map_y,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn map_x(&self) -> &[f32] {
        &self.map_x
    }

    pub fn map_y(&self) -> &[f32] {
        &self.map_y
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Option<(f32, f32)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = y * self.width + x;
        Some((self.map_x[i], self.map_y[i]))
    }

    pub fn len(&self) -> usize {
        self.map_x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map_x.is_empty()
    }
}

/// Build the table mapping rectified pixels back to distorted source pixels.
///
/// For each destination pixel the ray `(P[:, :3] R)^-1 [x y 1]` is
/// dehomogenized, distorted and projected through `camera`.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "debug", skip_all, fields(width = size.width, height = size.height))
)]
pub fn init_undistort_rectify_map(
    camera: &CameraIntrinsics,
    r_rect: &Matrix3<f64>,
    p_rect: &Matrix3x4<f64>,
    size: ImageSize,
) -> Result<RemapTable, RectifyError> {
    camera.validate()?;
    if size.is_empty() {
        return Err(RectifyError::EmptyImage);
    }
    let inv = (p_rect.fixed_view::<3, 3>(0, 0) * r_rect)
        .try_inverse()
        .ok_or(RectifyError::SingularProjection)?;

    let width = size.width as usize;
    let height = size.height as usize;
    let mut map_x = vec![0.0_f32; width * height];
    let mut map_y = vec![0.0_f32; width * height];

    let fill_row = |y: usize, row_x: &mut [f32], row_y: &mut [f32]| {
        for (x, (mx, my)) in row_x.iter_mut().zip(row_y.iter_mut()).enumerate() {
            let ray = inv * Vector3::new(x as f64, y as f64, 1.0);
            if ray.z.abs() < MIN_RAY_DEPTH {
                *mx = f32::NAN;
                *my = f32::NAN;
                continue;
            }
            let src = camera.denormalize(Vector2::new(ray.x / ray.z, ray.y / ray.z));
            *mx = src.x as f32;
            *my = src.y as f32;
        }
    };

    #[cfg(feature = "rayon")]
    map_x
        .par_chunks_mut(width)
        .zip(map_y.par_chunks_mut(width))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| fill_row(y, row_x, row_y));

    #[cfg(not(feature = "rayon"))]
    map_x
        .chunks_mut(width)
        .zip(map_y.chunks_mut(width))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| fill_row(y, row_x, row_y));

    Ok(RemapTable {
        width,
        height,
        map_x,
        map_y,
    })
}

/// Resample `src` through `table` with bilinear interpolation.
///
/// Destination pixels mapping outside `src` (or to `NaN`) are 0.
pub fn remap_gray(src: &GrayImageView<'_>, table: &RemapTable) -> GrayImage {
    GrayImage::from_fn(table.width, table.height, |x, y| {
        let i = y * table.width + x;
        sample_bilinear_u8(src, table.map_x[i], table.map_y[i])
    })
}
