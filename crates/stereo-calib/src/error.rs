use serde::{Deserialize, Serialize};
use stereo_calib_core::CoreError;
use stereo_calib_rectify::RectifyError;
use stereo_calib_solver::SolverError;

/// Failure reading or writing one of the JSON documents.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A configuration value the pipeline cannot run with.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("invalid config `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Pipeline step that produced a [`CalibrationFailure`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStage {
    Preflight,
    CollectViews,
    InitLeft,
    InitRight,
    RefineLeft,
    RefineRight,
    InitStereo,
    RefineStereo,
    Epipolar,
    Rectify,
}

impl std::fmt::Display for CalibrationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CalibrationStage::Preflight => "preflight",
            CalibrationStage::CollectViews => "collect_views",
            CalibrationStage::InitLeft => "init_left",
            CalibrationStage::InitRight => "init_right",
            CalibrationStage::RefineLeft => "refine_left",
            CalibrationStage::RefineRight => "refine_right",
            CalibrationStage::InitStereo => "init_stereo",
            CalibrationStage::RefineStereo => "refine_stereo",
            CalibrationStage::Epipolar => "epipolar",
            CalibrationStage::Rectify => "rectify",
        };
        f.write_str(name)
    }
}

/// Underlying error of a failed stage.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error(transparent)]
    Rectify(#[from] RectifyError),
}

/// Error returned by [`crate::calibrate_stereo`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("calibration failed during {stage}: {source}")]
pub struct CalibrationFailure {
    pub stage: CalibrationStage,
    #[source]
    pub source: StageError,
}

pub(crate) trait AtStage<T> {
    fn at(self, stage: CalibrationStage) -> Result<T, CalibrationFailure>;
}

impl<T, E: Into<StageError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: CalibrationStage) -> Result<T, CalibrationFailure> {
        self.map_err(|e| CalibrationFailure {
            stage,
            source: e.into(),
        })
    }
}
