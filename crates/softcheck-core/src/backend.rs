use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend — Abstraction over compute devices
//
// Each backend provides its own storage type and the handful of primitive
// kernels softmax is built from. On top of the primitives a backend may ship
// fused softmax kernels (the "accelerated" path). Whether a call actually
// takes the fused path is decided per call by `config::should_use_accel`,
// never by the backend itself.
//
// The split mirrors the two ways the operator can be computed:
//
//   unfused: max → sub → exp → sum → div         (primitives below)
//   fused:   softmax_forward / softmax_backward  (one launch each)

/// Identifies a compute device.
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device (e.g., "cpu").
    fn name(&self) -> String;
}

/// A storage buffer that holds tensor data on a specific device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements that fit in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Exp,
}

/// Reduction operations along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// The main Backend trait.
///
/// All operations take storage + layout and return new contiguous storage.
/// Nothing is mutated in place.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// Short name used in logs and `Error::Unsupported`.
    const NAME: &'static str;

    type Device: BackendDevice;
    type Storage: BackendStorage;

    //  Creation

    /// Allocate storage filled with a constant value.
    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        Self::full(shape, 0.0, dtype, device)
    }

    fn ones(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        Self::full(shape, 1.0, dtype, device)
    }

    /// Create storage from a flat f64 slice, rounding to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    //  Element-wise

    /// Apply a binary op element-wise. Both layouts describe the same logical
    /// shape; broadcasting has already been expressed through zero strides.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    //  Reductions

    /// Reduce along `dim`, returning contiguous storage of the keep-dim shape.
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dim: usize,
    ) -> Result<Self::Storage>;

    //  Data movement

    /// Copy the elements in logical order into fresh row-major storage.
    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Copy the elements in logical order to the host as f64.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    /// Cast storage to another dtype. The default goes through the host.
    fn cast(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let data = Self::to_f64_vec(input, layout)?;
        Self::from_f64_slice(&data, dtype, device)
    }

    //  Fused softmax

    /// Whether this backend ships fused softmax kernels.
    fn has_fused_softmax() -> bool {
        false
    }

    /// y = exp(x - max(x)) / sum(exp(x - max(x))) along `dim`, in one launch.
    fn softmax_forward(
        _input: &Self::Storage,
        _layout: &Layout,
        _dim: usize,
    ) -> Result<Self::Storage> {
        Err(Error::Unsupported {
            backend: Self::NAME,
            op: "softmax_forward",
        })
    }

    /// gx = y * (gy - sum(gy * y)) along `dim`, in one launch.
    fn softmax_backward(
        _y: &Self::Storage,
        _y_layout: &Layout,
        _gy: &Self::Storage,
        _gy_layout: &Layout,
        _dim: usize,
    ) -> Result<Self::Storage> {
        Err(Error::Unsupported {
            backend: Self::NAME,
            op: "softmax_backward",
        })
    }
}
