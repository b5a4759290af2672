//! Pipeline configuration and its preflight check.

use crate::io::{read_json, write_json};
use crate::{ConfigError, IoError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use stereo_calib_core::{ImageSize, PatternSpec};
use stereo_calib_rectify::RectifyOptions;
use stereo_calib_solver::{InitOptions, IntrinsicsFlags, IntrinsicsInit, LmOptions, StereoFlags};

/// Everything [`crate::calibrate_stereo`] needs besides the detections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoCalibConfig {
    pub pattern: PatternSpec,
    pub image_size: ImageSize,
    /// Fewer surviving views than this is fatal.
    pub min_views: usize,
    pub init: InitOptions,
    /// Flags of the two single-camera refinements.
    pub intrinsics: IntrinsicsFlags,
    pub stereo: StereoFlags,
    pub lm: LmOptions,
    /// `None` skips rectification.
    pub rectify: Option<RectifyOptions>,
}

impl Default for StereoCalibConfig {
    fn default() -> Self {
        Self {
            pattern: PatternSpec::default(),
            image_size: ImageSize::new(640, 480),
            min_views: 2,
            init: InitOptions::default(),
            intrinsics: IntrinsicsFlags::default(),
            stereo: StereoFlags::default(),
            lm: LmOptions::default(),
            rectify: Some(RectifyOptions::default()),
        }
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::new(field, format!("must be finite and positive, got {value}")))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::new(field, format!("must be finite and non-negative, got {value}")))
    }
}

impl StereoCalibConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, IoError> {
        read_json(path)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), IoError> {
        write_json(self, path)
    }

    /// Views needed before the pipeline gives up: `min_views`, raised to what
    /// the free intrinsics need to be observable from planar views.
    pub fn required_views(&self) -> usize {
        let flags = &self.intrinsics;
        let observable = if flags.fix_principal_point { 1 } else { 2 };
        self.min_views.max(observable)
    }

    /// Reject values and flag combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pattern
            .validate()
            .map_err(|e| ConfigError::new("pattern", e.to_string()))?;
        if self.image_size.is_empty() {
            return Err(ConfigError::new("image_size", "width and height must be non-zero"));
        }
        if self.min_views == 0 {
            return Err(ConfigError::new("min_views", "must be at least 1"));
        }

        if let Some(ratio) = self.init.aspect_ratio {
            positive("init.aspect_ratio", ratio)?;
        }
        positive("init.max_homography_rms_px", self.init.max_homography_rms_px)?;
        positive("init.max_column_skew", self.init.max_column_skew)?;
        if let IntrinsicsInit::Guess { intrinsics } = &self.init.intrinsics {
            intrinsics
                .validate()
                .map_err(|e| ConfigError::new("init.intrinsics", e.to_string()))?;
        }

        if self.lm.max_iterations == 0 {
            return Err(ConfigError::new("lm.max_iterations", "must be at least 1"));
        }
        non_negative("lm.cost_tolerance", self.lm.cost_tolerance)?;
        non_negative("lm.gradient_tolerance", self.lm.gradient_tolerance)?;
        non_negative("lm.step_tolerance", self.lm.step_tolerance)?;
        positive("lm.initial_lambda", self.lm.initial_lambda)?;
        if self.lm.max_lambda.is_nan() || self.lm.max_lambda <= self.lm.initial_lambda {
            return Err(ConfigError::new("lm.max_lambda", "must exceed lm.initial_lambda"));
        }

        if self.stereo.fix_intrinsics && self.stereo.same_focal_length {
            return Err(ConfigError::new(
                "stereo.same_focal_length",
                "cannot tie focal lengths while stereo.fix_intrinsics is set",
            ));
        }

        if let Some(rectify) = &self.rectify {
            if let Some(alpha) = rectify.alpha {
                if !(0.0..=1.0).contains(&alpha) {
                    return Err(ConfigError::new(
                        "rectify.alpha",
                        format!("must lie in [0, 1], got {alpha}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StereoCalibConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.required_views(), 2);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: StereoCalibConfig = serde_json::from_str(
            r#"{ "pattern": { "rows": 7, "cols": 10, "square_size": 25.0 },
                 "lm": { "max_iterations": 20 },
                 "rectify": null }"#,
        )
        .expect("parse");
        assert_eq!(config.pattern.point_count(), 70);
        assert_eq!(config.lm.max_iterations, 20);
        assert_eq!(config.lm.cost_tolerance, LmOptions::default().cost_tolerance);
        assert_eq!(config.min_views, 2);
        assert!(config.rectify.is_none());
    }

    #[test]
    fn contradictory_flags_are_rejected() {
        let mut config = StereoCalibConfig::default();
        config.stereo.fix_intrinsics = true;
        config.stereo.same_focal_length = true;
        assert_eq!(config.validate().map_err(|e| e.field), Err("stereo.same_focal_length"));

    }

    #[test]
    fn shared_fixed_focal_is_accepted() {
        let mut config = StereoCalibConfig::default();
        config.stereo.same_focal_length = true;
        assert_eq!(config.validate(), Ok(()));
        config.stereo.intrinsics.fix_focal_length = true;
        config.stereo.intrinsics.fix_aspect_ratio = true;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let cases: Vec<(StereoCalibConfig, &str)> = vec![
            (
                StereoCalibConfig {
                    min_views: 0,
                    ..Default::default()
                },
                "min_views",
            ),
            (
                StereoCalibConfig {
                    pattern: PatternSpec::new(1, 9, 30.0),
                    ..Default::default()
                },
                "pattern",
            ),
            (
                StereoCalibConfig {
                    image_size: ImageSize::new(0, 480),
                    ..Default::default()
                },
                "image_size",
            ),
            (
                StereoCalibConfig {
                    rectify: Some(RectifyOptions {
                        alpha: Some(-0.1),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                "rectify.alpha",
            ),
            (
                StereoCalibConfig {
                    lm: LmOptions {
                        max_iterations: 0,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                "lm.max_iterations",
            ),
        ];
        for (config, field) in cases {
            assert_eq!(config.validate().map_err(|e| e.field), Err(field));
        }
    }

    #[test]
    fn fixed_principal_point_relaxes_view_count() {
        let mut config = StereoCalibConfig {
            min_views: 1,
            ..Default::default()
        };
        assert_eq!(config.required_views(), 2);
        config.intrinsics.fix_principal_point = true;
        assert_eq!(config.required_views(), 1);
    }
}
