/// Errors produced by the core geometry types.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("invalid intrinsics: focal lengths must be finite and positive (fx={fx}, fy={fy})")]
    InvalidIntrinsics { fx: f64, fy: f64 },
    #[error("invalid pattern: {rows}x{cols} corners with square size {square_size}")]
    InvalidPattern {
        rows: usize,
        cols: usize,
        square_size: f64,
    },
    #[error("view has {got} points, pattern has {expected}")]
    PointCountMismatch { expected: usize, got: usize },
    #[error("rotation is not orthonormal (deviation {deviation:.3e})")]
    NonOrthonormalRotation { deviation: f64 },
}
