use stereo_calib_core::{CoreError, Side};

/// Errors returned by the initializers and refiners.
///
/// Non-convergence is not an error: it is reported through
/// [`crate::Termination::MaxIterations`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("not enough usable views (need {needed}, got {got})")]
    InsufficientViews { needed: usize, got: usize },
    #[error("degenerate homography set: {reason}")]
    DegenerateHomographies { reason: &'static str },
    #[error("invalid intrinsics: focal lengths must be finite and positive (fx={fx}, fy={fy})")]
    InvalidIntrinsics { fx: f64, fy: f64 },
    #[error("parameter {parameter} is not observable (zero Jacobian column)")]
    UnobservableParameter { parameter: String },
    #[error("residuals cannot be evaluated at the current estimate")]
    ResidualEvaluation,
    #[error("normal equations are not positive definite even at maximal damping")]
    SingularNormalEquations,
    #[error("initial estimate places view {view} point {point} behind the {side} camera")]
    NotProjectable { side: Side, view: usize, point: usize },
    #[error(transparent)]
    Core(CoreError),
}

impl From<CoreError> for SolverError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidIntrinsics { fx, fy } => SolverError::InvalidIntrinsics { fx, fy },
            other => SolverError::Core(other),
        }
    }
}
