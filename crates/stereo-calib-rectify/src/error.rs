use stereo_calib_core::CoreError;

/// Errors of the rectification solver and the map builder.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RectifyError {
    #[error("stereo baseline has zero length")]
    ZeroBaseline,
    #[error("stereo baseline is parallel to the optical axis")]
    BaselineAlongOpticalAxis,
    #[error("alpha must lie in [0, 1], got {0}")]
    InvalidAlpha(f64),
    #[error("image size is empty")]
    EmptyImage,
    #[error("image border maps behind the rectified camera")]
    DegenerateRectification,
    #[error("rectified projection matrix is singular")]
    SingularProjection,
    #[error("remap table of {width}x{height} needs {expected} entries per map, got {got}")]
    RemapTableSize {
        width: usize,
        height: usize,
        expected: usize,
        got: usize,
    },
    #[error(transparent)]
    Core(#[from] CoreError),
}
