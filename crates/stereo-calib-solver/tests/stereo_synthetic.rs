use approx::{assert_abs_diff_eq, assert_relative_eq};
use nalgebra::Point2;
use stereo_calib_core::{
    pose::rotation_angle_between,
    synthetic::{GaussianPixelNoise, SyntheticScene},
    CameraIntrinsics, ImageSize, Side, ViewSample,
};
use stereo_calib_solver::{
    calibrate_mono, epipolar_residual, initial_relative_pose, refine_stereo, InitOptions,
    IntrinsicsFlags, LmOptions, StereoCalibration, StereoFlags,
};

fn calibrate(samples: &[ViewSample], image_size: ImageSize) -> StereoCalibration {
    let mono = |side| {
        calibrate_mono(
            samples,
            side,
            image_size,
            &InitOptions::default(),
            &IntrinsicsFlags::default(),
            &LmOptions::default(),
        )
        .expect("mono calibration")
    };
    let (left, right) = (mono(Side::Left), mono(Side::Right));
    let initial = initial_relative_pose(&left, &right).expect("initial rig");
    let est = refine_stereo(
        samples,
        &left,
        &right,
        &initial,
        &StereoFlags::default(),
        &LmOptions::default(),
    )
    .expect("stereo refinement");
    StereoCalibration::from_estimate(est).expect("epipolar geometry")
}

fn undistorted_pixel(camera: &CameraIntrinsics, px: &Point2<f64>) -> Point2<f64> {
    let n = camera.normalize_pixel(px.coords);
    Point2::new(camera.fx * n.x + camera.cx, camera.fy * n.y + camera.cy)
}

fn assert_focal_close(est: &CameraIntrinsics, gt: &CameraIntrinsics, rel: f64) {
    assert_relative_eq!(est.fx, gt.fx, max_relative = rel);
    assert_relative_eq!(est.fy, gt.fy, max_relative = rel);
}

#[test]
fn noise_free_rig_is_recovered() {
    let scene = SyntheticScene::reference(10);
    let samples = scene.samples(&GaussianPixelNoise::default());
    assert_eq!(samples.len(), 10);

    let calib = calibrate(&samples, scene.rig.image_size);
    assert!(calib.rms < 1e-5, "rms {}", calib.rms);
    assert_eq!(calib.used_views(), 10);
    for (est, gt) in [(&calib.left, &scene.rig.left), (&calib.right, &scene.rig.right)] {
        assert_abs_diff_eq!(est.fx, gt.fx, epsilon = 1e-3);
        assert_abs_diff_eq!(est.fy, gt.fy, epsilon = 1e-3);
    }
    assert_abs_diff_eq!(calib.baseline(), scene.rig.baseline(), epsilon = 1e-3);
}

#[test]
fn noisy_rig_stays_within_tolerances() {
    let scene = SyntheticScene::reference(12);
    let samples = scene.samples(&GaussianPixelNoise::new(42, 0.05));
    let calib = calibrate(&samples, scene.rig.image_size);

    assert!(calib.rms < 0.2, "rms {}", calib.rms);
    assert_focal_close(&calib.left, &scene.rig.left, 5e-3);
    assert_focal_close(&calib.right, &scene.rig.right, 5e-3);
    assert!((calib.left.cx - scene.rig.left.cx).abs() < 0.005 * scene.rig.left.cx);
    assert!((calib.right.cy - scene.rig.right.cy).abs() < 0.005 * scene.rig.right.cy);

    let angle = rotation_angle_between(&calib.relative.rotation, &scene.rig.relative.rotation);
    assert!(angle.to_degrees() < 0.1, "rotation error {} deg", angle.to_degrees());

    let t = calib.relative.translation.normalize();
    let t_gt = scene.rig.relative.translation.normalize();
    assert!((t - t_gt).norm() < 0.01, "direction {t:?} vs {t_gt:?}");
}

#[test]
fn rms_grows_with_pixel_noise() {
    let scene = SyntheticScene::reference(8);
    let rms: Vec<f64> = [0.0, 0.05, 0.2, 0.5]
        .iter()
        .map(|&sigma| {
            let samples = scene.samples(&GaussianPixelNoise::new(7, sigma));
            calibrate(&samples, scene.rig.image_size).rms
        })
        .collect();
    assert!(rms.windows(2).all(|w| w[0] < w[1]), "{rms:?}");
}

/// Per-point RMS is `|(dx, dy)|`, so pure noise of per-axis sigma lands near
/// `sqrt(2) * sigma`, slightly less after the fit absorbs some of it.
#[test]
fn rms_tracks_pixel_noise_level() {
    let scene = SyntheticScene::reference(10);
    for sigma in [0.05, 0.2, 0.5] {
        for seed in [1, 2, 3] {
            let samples = scene.samples(&GaussianPixelNoise::new(seed, sigma));
            let rms = calibrate(&samples, scene.rig.image_size).rms;
            let ratio = rms / sigma;
            assert!(
                (1.1..1.6).contains(&ratio),
                "sigma {sigma}, seed {seed}: rms {rms} ({ratio:.3} sigma)"
            );
        }
    }
}

#[test]
fn epipolar_constraint_holds_on_undistorted_observations() {
    let scene = SyntheticScene::reference(6);
    let samples = scene.samples(&GaussianPixelNoise::default());
    let calib = calibrate(&samples, scene.rig.image_size);

    for sample in &samples {
        for (pl, pr) in sample.left().iter().zip(sample.right()) {
            let r = epipolar_residual(
                &calib.fundamental,
                &undistorted_pixel(&calib.left, pl),
                &undistorted_pixel(&calib.right, pr),
            );
            assert!(r.abs() < 1e-4, "epipolar residual {r}");
        }
    }
}
