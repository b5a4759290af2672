use approx::{assert_abs_diff_eq, assert_relative_eq};
use nalgebra::Matrix3;
use stereo_calib::core::synthetic::{GaussianPixelNoise, StereoRig, SyntheticScene};
use stereo_calib::core::{Detection, FramePair, FrameRejection, PatternSpec, Side};
use stereo_calib::rectify::rectify_pixel;
use stereo_calib::solver::{IntrinsicsFlags, SolverError, StereoFlags, ViewDropReason};
use stereo_calib::{
    calibrate_stereo, CalibrationReport, CalibrationStage, StageError, StereoCalibConfig,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config_for(scene: &SyntheticScene) -> StereoCalibConfig {
    StereoCalibConfig {
        pattern: scene.pattern,
        image_size: scene.rig.image_size,
        ..Default::default()
    }
}

#[test]
fn ten_view_reference_scenario() {
    init_logger();
    let scene = SyntheticScene::reference(10);
    let frames = scene.frames(&GaussianPixelNoise::default());
    let output = calibrate_stereo(&config_for(&scene), &frames).expect("calibration");

    let calib = &output.calibration;
    assert!(calib.rms < 1e-5, "rms {}", calib.rms);
    assert_eq!(output.views.used_views(), 10);
    assert!(output.views.rejected.is_empty() && output.views.dropped.is_empty());
    for (est, gt) in [(&calib.left, &scene.rig.left), (&calib.right, &scene.rig.right)] {
        assert_abs_diff_eq!(est.fx, gt.fx, epsilon = 1e-3);
        assert_abs_diff_eq!(est.fy, gt.fy, epsilon = 1e-3);
    }
    assert_abs_diff_eq!(calib.baseline(), scene.rig.baseline(), epsilon = 1e-3);

    let rect = output.rectification.as_ref().expect("rectification");
    for r in [rect.r1, rect.r2] {
        assert!((r * r.transpose() - Matrix3::identity()).norm() < 1e-9);
    }
    let samples = scene.samples(&GaussianPixelNoise::default());
    for sample in &samples {
        for (pl, pr) in sample.left().iter().zip(sample.right()) {
            let l = rectify_pixel(&calib.left, &rect.r1, &rect.p1, pl.coords).expect("left");
            let r = rectify_pixel(&calib.right, &rect.r2, &rect.p2, pr.coords).expect("right");
            assert!((l.y - r.y).abs() < 0.5, "{l:?} vs {r:?}");
        }
    }
}

#[test]
fn shared_fixed_focal_rig_runs_end_to_end() {
    init_logger();
    let mut rig = StereoRig::reference();
    rig.right.fx = rig.left.fx;
    rig.right.fy = rig.left.fy;
    let scene = SyntheticScene::new(rig, PatternSpec::default(), 10);
    let frames = scene.frames(&GaussianPixelNoise::default());
    let config = StereoCalibConfig {
        stereo: StereoFlags {
            intrinsics: IntrinsicsFlags {
                fix_aspect_ratio: true,
                fix_focal_length: true,
                ..Default::default()
            },
            same_focal_length: true,
            ..Default::default()
        },
        ..config_for(&scene)
    };

    let output = calibrate_stereo(&config, &frames).expect("calibration");
    let calib = &output.calibration;
    let fx = 0.5 * (output.left.intrinsics.fx + output.right.intrinsics.fx);
    let fy = 0.5 * (output.left.intrinsics.fy + output.right.intrinsics.fy);
    assert_eq!((calib.left.fx, calib.left.fy), (fx, fy));
    assert_eq!((calib.right.fx, calib.right.fy), (fx, fy));
    assert_abs_diff_eq!(calib.left.fx, rig.left.fx, epsilon = 1e-3);
    assert!(calib.rms < 1e-4, "rms {}", calib.rms);
    assert_abs_diff_eq!(calib.baseline(), rig.baseline(), epsilon = 1e-3);
    assert!(output.rectification.is_some());
}

#[test]
fn broken_frames_are_skipped_and_reported() {
    init_logger();
    let scene = SyntheticScene::reference(12);
    let mut frames = scene.frames(&GaussianPixelNoise::new(21, 0.05));

    frames[1].left = Detection::NotFound;
    if let Detection::Found(pts) = &mut frames[4].right {
        pts.pop();
    }
    if let Detection::Found(pts) = &mut frames[7].left {
        let original = pts.clone();
        let n = original.len();
        for (i, p) in pts.iter_mut().enumerate() {
            *p = original[(i * 7) % n];
        }
    }

    let output = calibrate_stereo(&config_for(&scene), &frames).expect("calibration");
    let views = &output.views;
    assert_eq!(views.total_frames, 12);
    assert_eq!(views.rejected.len(), 2);
    assert_eq!(views.rejected[0].frame, 1);
    assert_eq!(views.rejected[0].reason, FrameRejection::NotFound { side: Side::Left });
    assert_eq!(views.rejected[1].frame, 4);
    assert!(matches!(
        views.rejected[1].reason,
        FrameRejection::PointCount { side: Side::Right, got: 53, .. }
    ));

    assert_eq!(views.dropped.len(), 1);
    assert_eq!(views.dropped[0].frame, 7);
    assert_eq!(views.dropped[0].side, Side::Left);
    assert!(matches!(
        views.dropped[0].reason,
        ViewDropReason::InconsistentGrid { .. } | ViewDropReason::DegenerateHomography
    ));

    assert_eq!(views.used_views(), 9);
    assert!(!views.used_frames.contains(&7));
    assert!(views.per_frame_rms[7].is_none());
    assert!(views.per_frame_rms[0].is_some());
    assert!(output.calibration.rms < 0.2, "rms {}", output.calibration.rms);
}

#[test]
fn too_few_views_fail_while_collecting() {
    init_logger();
    let scene = SyntheticScene::reference(3);
    let mut frames = scene.frames(&GaussianPixelNoise::default());
    frames[0].right = Detection::NotFound;
    frames[2] = FramePair::new(Detection::NotFound, Detection::NotFound);

    let err = calibrate_stereo(&config_for(&scene), &frames).expect_err("must fail");
    assert_eq!(err.stage, CalibrationStage::CollectViews);
    assert_eq!(
        err.source,
        StageError::Solver(SolverError::InsufficientViews { needed: 2, got: 1 })
    );
    assert!(err.to_string().contains("collect_views"));
}

#[test]
fn invalid_config_fails_preflight() {
    let scene = SyntheticScene::reference(4);
    let frames = scene.frames(&GaussianPixelNoise::default());
    let config = StereoCalibConfig {
        min_views: 0,
        ..config_for(&scene)
    };
    let err = calibrate_stereo(&config, &frames).expect_err("must fail");
    assert_eq!(err.stage, CalibrationStage::Preflight);
    assert!(matches!(err.source, StageError::Config(ref e) if e.field == "min_views"));
}

#[test]
fn rectification_can_be_disabled() {
    let scene = SyntheticScene::reference(6);
    let frames = scene.frames(&GaussianPixelNoise::new(3, 0.1));
    let config = StereoCalibConfig {
        rectify: None,
        ..config_for(&scene)
    };
    let output = calibrate_stereo(&config, &frames).expect("calibration");
    assert!(output.rectification.is_none());

    let report = CalibrationReport::from_output(&output);
    assert!(report.r1.is_none() && report.valid_pix_roi1.is_none());
    let json = report.to_json_string().expect("json");
    assert!(json.contains("\"RMS_error\"") && !json.contains("\"R1\""));
}

#[test]
fn report_survives_a_file_round_trip() {
    let scene = SyntheticScene::reference(8);
    let frames = scene.frames(&GaussianPixelNoise::new(5, 0.1));
    let output = calibrate_stereo(&config_for(&scene), &frames).expect("calibration");
    let report = CalibrationReport::from_output(&output);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("report.json");
    report.write_json(&path).expect("write");
    let text = std::fs::read_to_string(&path).expect("read");
    for key in [
        "RMS_error",
        "cameraMatrix1",
        "distCoeffs2",
        "relative_rotation",
        "relative_transformation",
        "essential_matrix",
        "fundamental_matrix",
        "P2",
        "Q",
        "validPixROI2",
    ] {
        assert!(text.contains(&format!("\"{key}\"")), "missing {key}");
    }

    let loaded = CalibrationReport::load_json(&path).expect("load");
    assert_eq!(loaded.used_frames, report.used_frames);
    assert_eq!(loaded.valid_pix_roi1, report.valid_pix_roi1);
    let left = loaded.left_intrinsics();
    assert_relative_eq!(left.fx, output.calibration.left.fx, epsilon = 1e-9);
    assert_relative_eq!(
        left.distortion.k1,
        output.calibration.left.distortion.k1,
        epsilon = 1e-12
    );
    let relative = loaded.relative_pose().expect("rotation");
    assert_relative_eq!(
        relative.translation,
        output.calibration.relative.translation,
        epsilon = 1e-9
    );
}
