//! Fused softmax kernels for the CPU backend.
//!
//! # Kernel strategy
//!
//! The tensor is viewed as `[outer, len, inner]` around the softmax axis.
//! Each `(o, i)` pair is one independent row of `len` elements spaced
//! `inner` apart. A block of `len * inner` consecutive elements holds all
//! rows for one `o`, so blocks are handed to rayon workers as disjoint
//! chunks.
//!
//! Forward, per row, in f64:
//!
//! 1. **Row max** `m = max(x)` so the exponent is never positive.
//! 2. **Shifted exp + sum** `e_k = exp(x_k - m)`, `s = sum(e)`.
//! 3. **Normalise** `y_k = e_k / s`, rounded once to the storage type.
//!
//! Backward, per row: `gx_k = y_k * (gy_k - sum(gy * y))`.
//!
//! Both entry points record themselves in the kernel trace before any work
//! is split across threads.

use rayon::prelude::*;

use softcheck_core::dtype::WithDType;
use softcheck_core::error::{Error, Result};
use softcheck_core::kernel_trace::{self, Kernel};
use softcheck_core::layout::Layout;
use softcheck_core::shape::Shape;
use softcheck_core::BackendStorage;

use crate::{gather, CpuStorage};

/// Row geometry of a softmax along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftmaxGeometry {
    pub outer: usize,
    pub len: usize,
    pub inner: usize,
}

impl SoftmaxGeometry {
    pub fn for_dim(shape: &Shape, dim: usize) -> Result<Self> {
        let (outer, len, inner) = shape.split_at_dim(dim)?;
        Ok(SoftmaxGeometry { outer, len, inner })
    }

    /// Number of independent rows.
    pub fn rows(&self) -> usize {
        self.outer * self.inner
    }

    fn block(&self) -> usize {
        self.len * self.inner
    }
}

pub(crate) fn softmax_forward(input: &CpuStorage, layout: &Layout, dim: usize) -> Result<CpuStorage> {
    kernel_trace::record(Kernel::SoftmaxForward);
    let geom = SoftmaxGeometry::for_dim(layout.shape(), dim)?;
    log::debug!(
        "softmax_forward: {} rows of {} ({}), contiguous={}",
        geom.rows(),
        geom.len,
        input.dtype(),
        layout.is_contiguous()
    );
    Ok(match input {
        CpuStorage::F16(v) => CpuStorage::F16(forward_rows(&gather(v, layout), geom)),
        CpuStorage::F32(v) => CpuStorage::F32(forward_rows(&gather(v, layout), geom)),
        CpuStorage::F64(v) => CpuStorage::F64(forward_rows(&gather(v, layout), geom)),
    })
}

pub(crate) fn softmax_backward(
    y: &CpuStorage,
    y_layout: &Layout,
    gy: &CpuStorage,
    gy_layout: &Layout,
    dim: usize,
) -> Result<CpuStorage> {
    kernel_trace::record(Kernel::SoftmaxBackward);
    if y_layout.shape() != gy_layout.shape() {
        return Err(Error::ShapeMismatch {
            expected: y_layout.shape().clone(),
            got: gy_layout.shape().clone(),
        });
    }
    let geom = SoftmaxGeometry::for_dim(y_layout.shape(), dim)?;
    log::debug!(
        "softmax_backward: {} rows of {} ({})",
        geom.rows(),
        geom.len,
        y.dtype()
    );
    match (y, gy) {
        (CpuStorage::F16(a), CpuStorage::F16(b)) => Ok(CpuStorage::F16(backward_rows(
            &gather(a, y_layout),
            &gather(b, gy_layout),
            geom,
        ))),
        (CpuStorage::F32(a), CpuStorage::F32(b)) => Ok(CpuStorage::F32(backward_rows(
            &gather(a, y_layout),
            &gather(b, gy_layout),
            geom,
        ))),
        (CpuStorage::F64(a), CpuStorage::F64(b)) => Ok(CpuStorage::F64(backward_rows(
            &gather(a, y_layout),
            &gather(b, gy_layout),
            geom,
        ))),
        _ => Err(Error::DTypeMismatch {
            expected: y.dtype(),
            got: gy.dtype(),
        }),
    }
}

fn forward_rows<T: WithDType>(x: &[T], geom: SoftmaxGeometry) -> Vec<T> {
    let mut out = vec![T::zero(); x.len()];
    if x.is_empty() {
        return out;
    }
    let SoftmaxGeometry { len, inner, .. } = geom;
    out.par_chunks_mut(geom.block())
        .zip(x.par_chunks(geom.block()))
        .for_each(|(out, x)| {
            let mut e = vec![0f64; len];
            for i in 0..inner {
                // Pass 1: row max
                let m = (0..len)
                    .map(|k| x[k * inner + i].to_f64())
                    .fold(f64::NEG_INFINITY, f64::max);
                // Pass 2: shifted exp + sum
                let mut sum = 0.0;
                for (k, ek) in e.iter_mut().enumerate() {
                    *ek = (x[k * inner + i].to_f64() - m).exp();
                    sum += *ek;
                }
                // Pass 3: normalise
                for (k, ek) in e.iter().enumerate() {
                    out[k * inner + i] = T::from_f64(ek / sum);
                }
            }
        });
    out
}

fn backward_rows<T: WithDType>(y: &[T], gy: &[T], geom: SoftmaxGeometry) -> Vec<T> {
    let mut out = vec![T::zero(); y.len()];
    if y.is_empty() {
        return out;
    }
    let SoftmaxGeometry { len, inner, .. } = geom;
    out.par_chunks_mut(geom.block())
        .zip(y.par_chunks(geom.block()).zip(gy.par_chunks(geom.block())))
        .for_each(|(out, (y, gy))| {
            for i in 0..inner {
                let dot: f64 = (0..len)
                    .map(|k| y[k * inner + i].to_f64() * gy[k * inner + i].to_f64())
                    .sum();
                for k in 0..len {
                    let idx = k * inner + i;
                    let yk = y[idx].to_f64();
                    out[idx] = T::from_f64(yk * (gy[idx].to_f64() - dot));
                }
            }
        });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom(outer: usize, len: usize, inner: usize) -> SoftmaxGeometry {
        SoftmaxGeometry { outer, len, inner }
    }

    #[test]
    fn test_geometry_for_dim() {
        let g = SoftmaxGeometry::for_dim(&Shape::from((2, 3, 4)), 1).unwrap();
        assert_eq!(g, geom(2, 3, 4));
        assert_eq!(g.rows(), 8);
        assert!(SoftmaxGeometry::for_dim(&Shape::from((2, 3)), 2).is_err());
    }

    #[test]
    fn test_forward_single_row() {
        let y = forward_rows(&[1.0f64, 2.0, 3.0], geom(1, 3, 1));
        let z: f64 = [1.0f64, 2.0, 3.0].iter().map(|v| v.exp()).sum();
        for (k, v) in y.iter().enumerate() {
            assert!((v - ((k + 1) as f64).exp() / z).abs() < 1e-12);
        }
    }

    #[test]
    fn test_forward_numerical_stability() {
        let y = forward_rows(&[-1000.0f32, 1.0], geom(1, 2, 1));
        assert!(y.iter().all(|v| v.is_finite()));
        assert_eq!(y[1], 1.0);
        assert!(y[0] < 1e-30);
    }

    #[test]
    fn test_forward_strided_rows() {
        // [2, 2] along dim 0: rows are columns
        let y = forward_rows(&[0.0f64, 5.0, 0.0, -5.0], geom(1, 2, 2));
        assert!((y[0] - 0.5).abs() < 1e-15 && (y[2] - 0.5).abs() < 1e-15);
        assert!((y[1] + y[3] - 1.0).abs() < 1e-15);
        assert!(y[1] > 0.99);
    }

    #[test]
    fn test_backward_orthogonal_to_ones() {
        // Every row of gx sums to zero because sum(y) == 1
        let y = forward_rows(&[0.3f64, -0.2, 0.9, 0.1, 0.4, -0.7], geom(2, 3, 1));
        let gx = backward_rows(&y, &[1.0, 2.0, 3.0, -1.0, 0.5, 0.0], geom(2, 3, 1));
        for row in gx.chunks(3) {
            assert!(row.iter().sum::<f64>().abs() < 1e-12);
        }
    }

    #[test]
    fn test_backward_constant_upstream_is_zero() {
        let y = forward_rows(&[0.3f64, -0.2, 0.9], geom(1, 3, 1));
        let gx = backward_rows(&y, &[2.0, 2.0, 2.0], geom(1, 3, 1));
        assert!(gx.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_entry_points_are_traced() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        let x = CpuStorage::F32(vec![0.0; 6]);
        let (y, calls) = kernel_trace::trace_kernel_calls(|| softmax_forward(&x, &layout, 0));
        let y = y.unwrap();
        assert_eq!(calls.softmax_forward, 1);
        assert_eq!(calls.softmax_backward, 0);
        let (_, calls) =
            kernel_trace::trace_kernel_calls(|| softmax_backward(&y, &layout, &x, &layout, 0));
        assert_eq!(calls.softmax_backward, 1);
    }
}
