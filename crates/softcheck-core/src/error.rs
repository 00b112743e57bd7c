use crate::shape::Shape;

/// All errors that can occur within softcheck.
///
/// Tensor-level failures (shape, dtype, rank) sit next to the failures of
/// the conformance tooling: a gradient that never reached an input, or a
/// numerical comparison outside tolerance. Every failure is local to the
/// call that produced it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g. seeding backward with a
    /// gradient of the wrong shape).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// DType mismatch between tensors in a binary operation.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Tried to read a scalar from a non-scalar tensor.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// The backend has no implementation for the requested kernel.
    #[error("backend {backend} does not implement {op}")]
    Unsupported {
        backend: &'static str,
        op: &'static str,
    },

    /// Backward finished without producing a gradient for an input.
    #[error("no gradient reached input {index}")]
    MissingGradient { index: usize },

    /// Two values differ by more than `atol + rtol * |expected|`.
    #[error(
        "{what}: mismatch at index {index}: expected {expected}, got {got} \
         (|diff| = {diff}, atol = {atol}, rtol = {rtol})"
    )]
    Mismatch {
        what: String,
        index: usize,
        expected: f64,
        got: f64,
        diff: f64,
        atol: f64,
        rtol: f64,
    },

    /// Invalid configuration value (environment variable or parsed option).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Prefix the error with some context, keeping mismatch details readable.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        Error::Msg(format!("{ctx}: {self}"))
    }
}

/// Convenience Result type used throughout softcheck.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("axis {} out of range", axis)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
