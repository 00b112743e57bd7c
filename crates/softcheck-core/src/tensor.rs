use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;

// Tensor — The fundamental data structure
//
// An n-dimensional array on a backend, carrying the op that produced it so
// backward() can walk the graph.
//
// MEMORY MODEL:
//
//   Tensor is a handle around Arc<TensorInner>, so cloning is O(1). Storage
//   sits behind Arc<RwLock<_>> so views (transpose, broadcast, reshape of a
//   contiguous tensor) share the buffer and only differ in Layout.
//
// Every op here returns fresh contiguous storage except the views. Column-
// major copies (`as_fortran`) exist so the softmax kernels can be fed the
// same logical values in a different storage order.

struct TensorInner<B: Backend> {
    id: TensorId,
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
    /// None for leaf tensors.
    op: Op<B>,
    /// Set by set_variable(). Informational: every tensor reached by
    /// backward() receives a gradient either way.
    is_variable: bool,
}

/// An n-dimensional array of numbers on a specific backend.
///
/// # Example
/// ```ignore
/// use softcheck_core::{DType, Tensor};
/// use softcheck_cpu::{CpuBackend, CpuDevice};
///
/// let x = Tensor::<CpuBackend>::from_f64_slice(&[-1000.0, 1.0], (1, 2), DType::F32, &CpuDevice)?;
/// let y = x.softmax(1)?;
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
                is_variable: false,
            }),
        }
    }

    /// A new tensor sharing this tensor's storage under a different layout.
    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
                is_variable: false,
            }),
        }
    }

    /// Same storage, layout and dtype as `self`, produced by `op`.
    pub(crate) fn rewrap(&self, op: Op<B>) -> Self {
        self.view_with_layout(self.inner.layout.clone(), op)
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    /// Read lock on the storage, with lock poisoning surfaced as an error.
    pub(crate) fn read_storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // Creation methods

    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 0.0, dtype, device)
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 1.0, dtype, device)
    }

    /// Create a tensor from row-major f64 data, rounding to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::ones(other.shape().clone(), other.dtype(), other.device())
    }

    /// Mark this tensor as a variable. Keeps id, storage and op.
    pub fn set_variable(self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: self.inner.op.clone(),
                is_variable: true,
            }),
        }
    }

    /// Same data, no history: Op::None and a fresh TensorId.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone(), Op::None)
    }

    // Views and copies

    /// Swap two dimensions (no data copy).
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let new_layout = self.inner.layout.transpose(dim0, dim1)?;
        let op = Op::Transpose {
            input: self.clone(),
            dim0,
            dim1,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Reshape to a shape with the same element count. Non-contiguous
    /// tensors are copied first.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        let current_count = self.elem_count();
        let new_count = new_shape.elem_count();
        if current_count != new_count {
            return Err(Error::ReshapeElementMismatch {
                src: current_count,
                dst: new_count,
                dst_shape: new_shape,
            });
        }
        if new_shape == *self.shape() {
            return Ok(self.clone());
        }
        let tensor = self.contiguous()?;
        let op = Op::Reshape {
            input: tensor.clone(),
            src_shape: tensor.shape().clone(),
        };
        Ok(tensor.view_with_layout(Layout::contiguous(new_shape), op))
    }

    /// Row-major copy of this tensor, or a cheap clone if already row-major.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = self.read_storage()?;
        let new_storage = B::to_contiguous(&storage, &self.inner.layout)?;
        Ok(Self::from_storage(
            new_storage,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Copy {
                input: self.clone(),
            },
        ))
    }

    /// Column-major copy: same logical values, storage laid out with the
    /// first dimension moving fastest. For rank >= 2 with more than one row
    /// the result is not contiguous.
    pub fn as_fortran(&self) -> Result<Self> {
        let values = self.to_f64_vec()?;
        let layout = Layout::fortran(self.shape().clone());
        let mut buf = vec![0f64; values.len()];
        for (v, slot) in values.iter().zip(layout.strided_indices()) {
            buf[slot] = *v;
        }
        // Values already carry this dtype, so the round trip through f64 is exact.
        let storage = B::from_f64_slice(&buf, self.dtype(), self.device())?;
        Ok(Self::from_storage(
            storage,
            layout,
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Copy {
                input: self.clone(),
            },
        ))
    }

    /// Zero-stride view of this tensor as the larger shape `target`.
    pub fn broadcast_as(&self, target: impl Into<Shape>) -> Result<Self> {
        let target = target.into();
        if target == *self.shape() {
            return Ok(self.clone());
        }
        let layout = self.inner.layout.broadcast_to(&target)?;
        let op = Op::Broadcast {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(layout, op))
    }

    // Element-wise binary operations (with broadcasting)

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    /// Broadcast both sides to a common shape, then dispatch to the backend.
    /// The broadcast itself is recorded on the graph so backward can reduce
    /// the gradient back to each operand's shape.
    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let lhs = self.broadcast_as(shape.clone())?;
        let rhs = rhs.broadcast_as(shape.clone())?;
        let result = {
            let storage_lhs = lhs.read_storage()?;
            let storage_rhs = rhs.read_storage()?;
            B::binary_op(
                op,
                &storage_lhs,
                lhs.layout(),
                &storage_rhs,
                rhs.layout(),
            )?
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(shape),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Binary { lhs, rhs, op },
        ))
    }

    // Unary operations

    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let result = {
            let storage = self.read_storage()?;
            B::unary_op(op, &storage, &self.inner.layout)?
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Unary {
                input: self.clone(),
                op,
            },
        ))
    }

    // Reductions

    /// Sum along `dim`.
    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, dim, keep_dim)
    }

    /// Max along `dim`.
    pub fn max(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Max, dim, keep_dim)
    }

    /// Sum of all elements as a scalar (shape []).
    pub fn sum_all(&self) -> Result<Self> {
        self.reshape(self.elem_count())?.sum(0, false)
    }

    fn reduce_op(&self, op: ReduceOp, dim: usize, keep_dim: bool) -> Result<Self> {
        let result_shape = if keep_dim {
            self.shape().reduced(dim)?
        } else {
            self.shape().squeezed(dim)?
        };
        let result = {
            let storage = self.read_storage()?;
            B::reduce_op(op, &storage, &self.inner.layout, dim)?
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(result_shape),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Reduce {
                input: self.clone(),
                op,
                dim,
                keep_dim,
            },
        ))
    }

    // Dtype conversion

    /// Convert to another dtype. Records Op::ToDtype so gradients are cast
    /// back on the way down.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let storage = {
            let guard = self.read_storage()?;
            B::cast(&guard, &self.inner.layout, dtype, self.device())?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            dtype,
            self.device().clone(),
            Op::ToDtype {
                input: self.clone(),
                src_dtype: self.dtype(),
            },
        ))
    }

    // Data extraction

    /// All elements in logical (row-major) order as f64.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        let vec = self.to_f64_vec()?;
        Ok(vec[0])
    }

    // Autograd

    /// Back-propagate from this scalar tensor, seeding with 1.
    pub fn backward(&self) -> Result<crate::backprop::GradStore<B>> {
        crate::backprop::backward(self)
    }

    /// Back-propagate from this tensor seeded with `grad` (same shape and dtype).
    pub fn backward_with_grad(&self, grad: &Self) -> Result<crate::backprop::GradStore<B>> {
        crate::backprop::backward_with_grad(self, grad)
    }
}
