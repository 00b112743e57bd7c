// Op — Computational graph node for automatic differentiation
//
// Every tensor produced by a computation records how it was made. backward()
// walks this DAG in reverse topological order applying the chain rule.
//
// Gradients are built from the same differentiable ops, so the gradient of a
// softmax is itself a graph node (SoftmaxBackward) and can be differentiated
// once more:
//
//   y   = softmax(x)             Op::Softmax { input: x }
//   gx  = softmax_grad(y, gy)    Op::SoftmaxBackward { output: y, grad_output: gy }
//   ggy = d<gx, ggx>/d(x, gy)    walks SoftmaxBackward, then Softmax
//
// Each variant stores Arc-backed Tensor<B> handles to its inputs, so the graph
// keeps exactly the values backward() needs alive.

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::shape::Shape;

/// Unique identifier for a tensor. Used as keys in GradStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor ID from a global atomic counter.
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Records the operation that produced a tensor.
pub enum Op<B: Backend> {
    /// Leaf tensor (input data or a variable under test).
    None,

    /// Element-wise binary on two same-shaped operands. Broadcasting is
    /// recorded separately as `Broadcast` on the smaller side.
    Binary {
        lhs: crate::Tensor<B>,
        rhs: crate::Tensor<B>,
        op: BinaryOp,
    },

    Unary {
        input: crate::Tensor<B>,
        op: UnaryOp,
    },

    /// Reduction along one dimension.
    Reduce {
        input: crate::Tensor<B>,
        op: ReduceOp,
        dim: usize,
        keep_dim: bool,
    },

    /// Zero-stride expansion of `input` (whose shape was `src_shape`).
    Broadcast {
        input: crate::Tensor<B>,
        src_shape: Shape,
    },

    Reshape {
        input: crate::Tensor<B>,
        src_shape: Shape,
    },

    Transpose {
        input: crate::Tensor<B>,
        dim0: usize,
        dim1: usize,
    },

    /// Same logical values in a different storage order (contiguous or
    /// column-major copy).
    Copy { input: crate::Tensor<B> },

    ToDtype {
        input: crate::Tensor<B>,
        src_dtype: DType,
    },

    /// y = softmax(input) along `dim`, fused or unfused.
    Softmax { input: crate::Tensor<B>, dim: usize },

    /// gx = output * (grad_output - sum(grad_output * output)) along `dim`.
    SoftmaxBackward {
        output: crate::Tensor<B>,
        grad_output: crate::Tensor<B>,
        dim: usize,
    },
}

impl<B: Backend> Clone for Op<B> {
    fn clone(&self) -> Self {
        match self {
            Op::None => Op::None,
            Op::Binary { lhs, rhs, op } => Op::Binary {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                op: *op,
            },
            Op::Unary { input, op } => Op::Unary {
                input: input.clone(),
                op: *op,
            },
            Op::Reduce {
                input,
                op,
                dim,
                keep_dim,
            } => Op::Reduce {
                input: input.clone(),
                op: *op,
                dim: *dim,
                keep_dim: *keep_dim,
            },
            Op::Broadcast { input, src_shape } => Op::Broadcast {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Reshape { input, src_shape } => Op::Reshape {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Transpose { input, dim0, dim1 } => Op::Transpose {
                input: input.clone(),
                dim0: *dim0,
                dim1: *dim1,
            },
            Op::Copy { input } => Op::Copy {
                input: input.clone(),
            },
            Op::ToDtype { input, src_dtype } => Op::ToDtype {
                input: input.clone(),
                src_dtype: *src_dtype,
            },
            Op::Softmax { input, dim } => Op::Softmax {
                input: input.clone(),
                dim: *dim,
            },
            Op::SoftmaxBackward {
                output,
                grad_output,
                dim,
            } => Op::SoftmaxBackward {
                output: output.clone(),
                grad_output: grad_output.clone(),
                dim: *dim,
            },
        }
    }
}

// Concise Debug: op type and tensor IDs only.
impl<B: Backend> std::fmt::Debug for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::None => write!(f, "None"),
            Op::Binary { lhs, rhs, op } => {
                write!(f, "Binary({:?}, id={:?}, id={:?})", op, lhs.id(), rhs.id())
            }
            Op::Unary { input, op } => write!(f, "Unary({:?}, id={:?})", op, input.id()),
            Op::Reduce {
                input,
                op,
                dim,
                keep_dim,
            } => write!(
                f,
                "Reduce({:?}, dim={}, keep_dim={}, id={:?})",
                op,
                dim,
                keep_dim,
                input.id()
            ),
            Op::Broadcast { input, src_shape } => {
                write!(f, "Broadcast({} → ?, id={:?})", src_shape, input.id())
            }
            Op::Reshape { input, src_shape } => {
                write!(f, "Reshape({} → ?, id={:?})", src_shape, input.id())
            }
            Op::Transpose { input, dim0, dim1 } => {
                write!(f, "Transpose({}, {}, id={:?})", dim0, dim1, input.id())
            }
            Op::Copy { input } => write!(f, "Copy(id={:?})", input.id()),
            Op::ToDtype { input, src_dtype } => {
                write!(f, "ToDtype({} → ?, id={:?})", src_dtype, input.id())
            }
            Op::Softmax { input, dim } => write!(f, "Softmax(dim={}, id={:?})", dim, input.id()),
            Op::SoftmaxBackward {
                output,
                grad_output,
                dim,
            } => write!(
                f,
                "SoftmaxBackward(dim={}, y={:?}, gy={:?})",
                dim,
                output.id(),
                grad_output.id()
            ),
        }
    }
}

impl<B: Backend> Op<B> {
    /// Input tensors of this operation, for the topological sort.
    pub fn inputs(&self) -> Vec<&crate::Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Op::SoftmaxBackward {
                output,
                grad_output,
                ..
            } => vec![output, grad_output],
            Op::Unary { input, .. }
            | Op::Reduce { input, .. }
            | Op::Broadcast { input, .. }
            | Op::Reshape { input, .. }
            | Op::Transpose { input, .. }
            | Op::Copy { input }
            | Op::ToDtype { input, .. }
            | Op::Softmax { input, .. } => vec![input],
        }
    }
}
