//! Deterministic synthetic stereo datasets for tests, benches and the CLI.
//!
//! Everything here is seeded explicitly, so a dataset is stable across runs and
//! platforms. Pixel noise is Gaussian (Box-Muller over splitmix64).

use crate::{
    project_point, CameraIntrinsics, Detection, Distortion, FramePair, ImageSize, PatternSpec,
    Pose, ViewSample,
};
use nalgebra::{Point2, Rotation3, Vector2, Vector3};
use std::f64::consts::PI;

/// Ground-truth two-camera rig.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StereoRig {
    pub left: CameraIntrinsics,
    pub right: CameraIntrinsics,
    /// Maps left-camera coordinates into the right camera.
    pub relative: Pose,
    pub image_size: ImageSize,
}

impl StereoRig {
    /// 640x480 rig with a 120 mm baseline and mild barrel distortion.
    ///
    /// Lengths are in millimetres, matching [`PatternSpec::default`].
    pub fn reference() -> Self {
        let left = CameraIntrinsics::new(612.0, 608.0, 322.5, 236.0).with_distortion(Distortion {
            k1: -0.12,
            k2: 0.08,
            p1: 6e-4,
            p2: -4e-4,
            k3: 0.0,
        });
        let right = CameraIntrinsics::new(606.0, 603.5, 316.0, 243.5).with_distortion(Distortion {
            k1: -0.10,
            k2: 0.05,
            p1: -3e-4,
            p2: 5e-4,
            k3: 0.0,
        });
        let relative = Pose::from_axis_angle(
            Vector3::new(0.006, -0.021, 0.004),
            Vector3::new(-120.0, 1.2, 0.8),
        );
        Self {
            left,
            right,
            relative,
            image_size: ImageSize::new(640, 480),
        }
    }

    /// Baseline length `|T|`.
    pub fn baseline(&self) -> f64 {
        self.relative.translation.norm()
    }
}

/// Board poses (board frame into the left camera) for `n_views` views.
///
/// The board is tilted around a cone of about 20 degrees so every view adds
/// new constraints on the intrinsics, and centred between the two cameras at
/// roughly five baselines of distance.
pub fn board_poses(rig: &StereoRig, pattern: &PatternSpec, n_views: usize) -> Vec<Pose> {
    let (w, h) = pattern.extent();
    let center = Vector3::new(0.5 * w, 0.5 * h, 0.0);
    let baseline = rig.baseline();
    let distance = 5.0 * baseline;
    let n = n_views.max(1) as f64;

    (0..n_views)
        .map(|k| {
            let phase = 2.0 * PI * k as f64 / n;
            let rotation = Rotation3::from_euler_angles(
                0.30 * phase.cos(),
                0.35 * phase.sin(),
                0.08 * (2.0 * phase).sin(),
            );
            let target = Vector3::new(
                0.5 * baseline + 0.04 * distance * (3.0 * phase).cos(),
                0.03 * distance * (2.0 * phase).sin(),
                distance * (1.0 + 0.12 * (3.0 * phase + 0.5).sin()),
            );
            Pose::new(rotation, target - rotation * center)
        })
        .collect()
}

/// Deterministic zero-mean Gaussian pixel noise.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GaussianPixelNoise {
    pub seed: u64,
    pub sigma_px: f64,
}

impl GaussianPixelNoise {
    pub fn new(seed: u64, sigma_px: f64) -> Self {
        Self { seed, sigma_px }
    }

    /// Noise for `(view, camera, point)`; the same key always gives the same sample.
    pub fn sample(&self, view_idx: usize, camera_idx: usize, point_idx: usize) -> Vector2<f64> {
        if self.sigma_px == 0.0 {
            return Vector2::zeros();
        }
        let key = mix_key(self.seed, view_idx, camera_idx, point_idx);
        // (0, 1] keeps the logarithm finite.
        let u1 = 1.0 - u64_to_unit_f64(splitmix64(key));
        let u2 = u64_to_unit_f64(splitmix64(key ^ 0x94D0_49BB_1331_11EB));
        let r = (-2.0 * u1.ln()).sqrt() * self.sigma_px;
        let theta = 2.0 * PI * u2;
        Vector2::new(r * theta.cos(), r * theta.sin())
    }
}

#[inline]
fn mix_key(seed: u64, view_idx: usize, camera_idx: usize, point_idx: usize) -> u64 {
    seed ^ (view_idx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (point_idx as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9)
        ^ (camera_idx as u64).wrapping_mul(0xD6E8_FEB8_6659_FD93)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[inline]
fn u64_to_unit_f64(x: u64) -> f64 {
    // top 53 bits -> [0, 1)
    (x >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
}

/// A rig, a board and the board poses it was photographed in.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticScene {
    pub rig: StereoRig,
    pub pattern: PatternSpec,
    /// Board frame into the left camera, one per view.
    pub poses: Vec<Pose>,
}

impl SyntheticScene {
    pub fn new(rig: StereoRig, pattern: PatternSpec, n_views: usize) -> Self {
        let poses = board_poses(&rig, &pattern, n_views);
        Self {
            rig,
            pattern,
            poses,
        }
    }

    /// The reference rig looking at the default 9x6 board.
    pub fn reference(n_views: usize) -> Self {
        Self::new(StereoRig::reference(), PatternSpec::default(), n_views)
    }

    /// Project every view into both cameras.
    ///
    /// A side whose corners do not all land in front of the camera and inside
    /// the image is reported as [`Detection::NotFound`].
    pub fn frames(&self, noise: &GaussianPixelNoise) -> Vec<FramePair> {
        let object = self.pattern.object_points();
        self.poses
            .iter()
            .enumerate()
            .map(|(v, pose_left)| {
                let pose_right = pose_left.then(&self.rig.relative);
                FramePair {
                    left: self.observe(&self.rig.left, pose_left, &object, noise, v, 0),
                    right: self.observe(&self.rig.right, &pose_right, &object, noise, v, 1),
                }
            })
            .collect()
    }

    /// Like [`SyntheticScene::frames`] but keeping only fully visible frames.
    pub fn samples(&self, noise: &GaussianPixelNoise) -> Vec<ViewSample> {
        self.frames(noise)
            .iter()
            .filter_map(|f| f.to_sample(&self.pattern).ok())
            .collect()
    }

    fn observe(
        &self,
        camera: &CameraIntrinsics,
        pose: &Pose,
        object: &[nalgebra::Point3<f64>],
        noise: &GaussianPixelNoise,
        view_idx: usize,
        camera_idx: usize,
    ) -> Detection {
        let size = self.rig.image_size;
        let mut pixels = Vec::with_capacity(object.len());
        for (i, pw) in object.iter().enumerate() {
            let Some(px) = project_point(camera, &pose.transform_point(pw)) else {
                return Detection::NotFound;
            };
            let inside = px.x >= 0.0
                && px.y >= 0.0
                && px.x <= (size.width - 1) as f64
                && px.y <= (size.height - 1) as f64;
            if !inside {
                return Detection::NotFound;
            }
            let n = noise.sample(view_idx, camera_idx, i);
            pixels.push(Point2::new(px.x + n.x, px.y + n.y));
        }
        Detection::Found(pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_is_deterministic_and_keyed() {
        let noise = GaussianPixelNoise::new(7, 0.5);
        assert_eq!(noise.sample(0, 0, 0), noise.sample(0, 0, 0));
        assert_ne!(noise.sample(0, 0, 0), noise.sample(0, 1, 0));
        assert_ne!(noise.sample(0, 0, 0), noise.sample(0, 0, 1));
        assert_eq!(GaussianPixelNoise::default().sample(3, 1, 2), Vector2::zeros());
    }

    #[test]
    fn noise_has_requested_spread() {
        let sigma = 0.05;
        let noise = GaussianPixelNoise::new(42, sigma);
        let n = 20_000;
        let (mut sum, mut sum_sq) = (Vector2::zeros(), 0.0);
        for i in 0..n {
            let s = noise.sample(i / 100, 0, i % 100);
            sum += s;
            sum_sq += s.norm_squared();
        }
        let mean = sum / n as f64;
        let per_axis_std = (sum_sq / (2.0 * n as f64)).sqrt();
        assert!(mean.norm() < 3e-3);
        assert!((per_axis_std - sigma).abs() < 0.05 * sigma);
    }

    #[test]
    fn reference_scene_is_fully_visible_in_both_cameras() {
        let scene = SyntheticScene::reference(10);
        let frames = scene.frames(&GaussianPixelNoise::default());
        assert_eq!(frames.len(), 10);
        for (i, f) in frames.iter().enumerate() {
            assert!(f.left.is_found(), "left view {i} not visible");
            assert!(f.right.is_found(), "right view {i} not visible");
        }
        assert_eq!(scene.samples(&GaussianPixelNoise::default()).len(), 10);
    }

    #[test]
    fn board_faces_the_cameras() {
        let scene = SyntheticScene::reference(12);
        for pose in &scene.poses {
            let normal = pose.rotation * Vector3::z();
            assert!(normal.z.abs() > 0.9);
            assert!(pose.translation.z > 0.0);
        }
    }
}
