// CPU Backend — host-memory compute backend
//
// ARCHITECTURE:
// - CpuDevice is a unit marker; there is only one host.
// - CpuStorage is an enum over Vec<T> for each supported dtype.
// - Primitive ops gather their operands in logical order first (a plain copy
//   when the layout is already contiguous), then work on flat slices.
// - Element values are promoted to f64, computed, and rounded back to the
//   storage type, so F16 and F32 results are the correctly rounded versions
//   of the f64 result.
// - The fused softmax kernels (see `kernels`) are what the dispatch config
//   selects when the fused path is allowed.
//
// USAGE:
//   let x = CpuTensor::from_f64_slice(&[-1000.0, 1.0], (1, 2), DType::F32, &CpuDevice)?;
//   let y = x.softmax(1)?;

mod kernels;

pub use kernels::SoftmaxGeometry;

use half::f16;
use std::fmt;

use softcheck_core::backend::{
    Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp,
};
use softcheck_core::dtype::{DType, WithDType};
use softcheck_core::error::{Error, Result};
use softcheck_core::layout::Layout;
use softcheck_core::shape::Shape;

// CpuDevice

/// The host device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

// CpuStorage — host memory for each supported dtype

#[derive(Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl fmt::Debug for CpuStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuStorage::F16(v) => write!(f, "CpuStorage::F16(len={})", v.len()),
            CpuStorage::F32(v) => write!(f, "CpuStorage::F32(len={})", v.len()),
            CpuStorage::F64(v) => write!(f, "CpuStorage::F64(len={})", v.len()),
        }
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
        }
    }
}

// Helpers

/// The elements of `data` under `layout`, in logical order.
pub(crate) fn gather<T: Copy>(data: &[T], layout: &Layout) -> Vec<T> {
    if layout.is_contiguous() {
        return data[..layout.elem_count()].to_vec();
    }
    layout.strided_indices().map(|i| data[i]).collect()
}

fn fill<T: WithDType>(n: usize, val: f64) -> Vec<T> {
    vec![T::from_f64(val); n]
}

fn convert<T: WithDType>(data: &[f64]) -> Vec<T> {
    data.iter().map(|&v| T::from_f64(v)).collect()
}

fn map_unary<T: WithDType>(data: &[T], layout: &Layout, f: fn(f64) -> f64) -> Vec<T> {
    gather(data, layout)
        .into_iter()
        .map(|x| T::from_f64(f(x.to_f64())))
        .collect()
}

fn map_binary<T: WithDType>(
    lhs: &[T],
    lhs_layout: &Layout,
    rhs: &[T],
    rhs_layout: &Layout,
    f: fn(f64, f64) -> f64,
) -> Vec<T> {
    gather(lhs, lhs_layout)
        .into_iter()
        .zip(gather(rhs, rhs_layout))
        .map(|(a, b)| T::from_f64(f(a.to_f64(), b.to_f64())))
        .collect()
}

/// Reduce along `dim` into keep-dim row-major order.
fn reduce<T: WithDType>(data: &[T], layout: &Layout, op: ReduceOp, dim: usize) -> Result<Vec<T>> {
    let (outer, n, inner) = layout.shape().split_at_dim(dim)?;
    let x = gather(data, layout);
    let mut out = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let lane = (0..n).map(|k| x[(o * n + k) * inner + i]);
            let v = match op {
                ReduceOp::Sum => T::from_f64(lane.map(|v| v.to_f64()).sum()),
                ReduceOp::Max => lane
                    .reduce(|a, b| if b.to_f64() > a.to_f64() { b } else { a })
                    .ok_or_else(|| Error::msg(format!("max over empty dim {dim}")))?,
            };
            out.push(v);
        }
    }
    Ok(out)
}

fn binary_fn(op: BinaryOp) -> fn(f64, f64) -> f64 {
    match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::Div => |a, b| a / b,
    }
}

fn unary_fn(op: UnaryOp) -> fn(f64) -> f64 {
    match op {
        UnaryOp::Neg => |x| -x,
        UnaryOp::Exp => f64::exp,
    }
}

// CpuBackend — The Backend trait implementation

/// The CPU backend. A zero-sized marker type.
#[derive(Clone, Debug)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    const NAME: &'static str = "cpu";

    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(match dtype {
            DType::F16 => CpuStorage::F16(fill(n, val)),
            DType::F32 => CpuStorage::F32(fill(n, val)),
            DType::F64 => CpuStorage::F64(fill(n, val)),
        })
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(match dtype {
            DType::F16 => CpuStorage::F16(convert(data)),
            DType::F32 => CpuStorage::F32(convert(data)),
            DType::F64 => CpuStorage::F64(data.to_vec()),
        })
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        if lhs_layout.shape() != rhs_layout.shape() {
            return Err(Error::ShapeMismatch {
                expected: lhs_layout.shape().clone(),
                got: rhs_layout.shape().clone(),
            });
        }
        let f = binary_fn(op);
        match (lhs, rhs) {
            (CpuStorage::F16(a), CpuStorage::F16(b)) => {
                Ok(CpuStorage::F16(map_binary(a, lhs_layout, b, rhs_layout, f)))
            }
            (CpuStorage::F32(a), CpuStorage::F32(b)) => {
                Ok(CpuStorage::F32(map_binary(a, lhs_layout, b, rhs_layout, f)))
            }
            (CpuStorage::F64(a), CpuStorage::F64(b)) => {
                Ok(CpuStorage::F64(map_binary(a, lhs_layout, b, rhs_layout, f)))
            }
            _ => Err(Error::DTypeMismatch {
                expected: lhs.dtype(),
                got: rhs.dtype(),
            }),
        }
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let f = unary_fn(op);
        Ok(match input {
            CpuStorage::F16(v) => CpuStorage::F16(map_unary(v, layout, f)),
            CpuStorage::F32(v) => CpuStorage::F32(map_unary(v, layout, f)),
            CpuStorage::F64(v) => CpuStorage::F64(map_unary(v, layout, f)),
        })
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dim: usize,
    ) -> Result<CpuStorage> {
        Ok(match input {
            CpuStorage::F16(v) => CpuStorage::F16(reduce(v, layout, op, dim)?),
            CpuStorage::F32(v) => CpuStorage::F32(reduce(v, layout, op, dim)?),
            CpuStorage::F64(v) => CpuStorage::F64(reduce(v, layout, op, dim)?),
        })
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(match input {
            CpuStorage::F16(v) => CpuStorage::F16(gather(v, layout)),
            CpuStorage::F32(v) => CpuStorage::F32(gather(v, layout)),
            CpuStorage::F64(v) => CpuStorage::F64(gather(v, layout)),
        })
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(match input {
            CpuStorage::F16(v) => gather(v, layout).into_iter().map(|x| x.to_f64()).collect(),
            CpuStorage::F32(v) => gather(v, layout).into_iter().map(|x| x as f64).collect(),
            CpuStorage::F64(v) => gather(v, layout),
        })
    }

    fn has_fused_softmax() -> bool {
        true
    }

    fn softmax_forward(input: &CpuStorage, layout: &Layout, dim: usize) -> Result<CpuStorage> {
        kernels::softmax_forward(input, layout, dim)
    }

    fn softmax_backward(
        y: &CpuStorage,
        y_layout: &Layout,
        gy: &CpuStorage,
        gy_layout: &Layout,
        dim: usize,
    ) -> Result<CpuStorage> {
        kernels::softmax_backward(y, y_layout, gy, gy_layout, dim)
    }
}

/// Convenience type alias for CPU tensors.
pub type CpuTensor = softcheck_core::Tensor<CpuBackend>;
