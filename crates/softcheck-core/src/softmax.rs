// Softmax — the operator and its derivatives
//
//   y   = exp(x - max(x)) / sum(exp(x - max(x)))        along `dim`
//   gx  = y * (gy - sum(gy * y))
//   ggy = y * (ggx - sum(ggx * y))                        (= softmax_grad(y, ggx))
//   gy' = ggx * (gy - sum(gy * y)) - gy * sum(ggx * y)    (gradient reaching y)
//
// Each of the first two has a fused path (one backend kernel launch) and an
// unfused path composed from primitives. The path is picked per call by the
// dispatch predicate at level `>=auto`. Either way the result is wrapped in a
// single graph node (Softmax / SoftmaxBackward) so backward sees the same
// graph shape regardless of which path produced the values.
//
// Subtracting the row max keeps exp() in [0, 1], so a row like [-1000, 1]
// yields [0, 1] instead of 0/0.

use crate::backend::Backend;
use crate::config::{self, AccelLevel};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::Op;
use crate::tensor::Tensor;

/// Whether this call should go through the backend's fused kernels.
fn use_fused<B: Backend>() -> bool {
    B::has_fused_softmax() && config::should_use_accel(AccelLevel::AtLeastAuto)
}

fn check_dim<B: Backend>(t: &Tensor<B>, dim: usize) -> Result<()> {
    if dim >= t.rank() {
        return Err(Error::DimOutOfRange {
            dim,
            rank: t.rank(),
        });
    }
    Ok(())
}

impl<B: Backend> Tensor<B> {
    /// Numerically stable softmax along `dim`.
    ///
    /// The output has the shape and dtype of `self`; every slice along `dim`
    /// sums to 1.
    pub fn softmax(&self, dim: usize) -> Result<Self> {
        check_dim(self, dim)?;
        let op = Op::Softmax {
            input: self.clone(),
            dim,
        };
        if self.elem_count() == 0 {
            return Ok(self.detach().rewrap(op));
        }
        if use_fused::<B>() {
            log::debug!(
                "softmax: fused {} kernel, shape {} dim {} {}",
                B::NAME,
                self.shape(),
                dim,
                self.dtype()
            );
            let storage = {
                let guard = self.read_storage()?;
                B::softmax_forward(&guard, self.layout(), dim)?
            };
            return Ok(Self::from_storage(
                storage,
                Layout::contiguous(self.shape().clone()),
                self.dtype(),
                self.device().clone(),
                op,
            ));
        }
        log::debug!(
            "softmax: composite path, shape {} dim {} {}",
            self.shape(),
            dim,
            self.dtype()
        );
        let x = self.detach();
        let shifted = x.sub(&x.max(dim, true)?)?;
        let e = shifted.exp()?;
        let y = e.div(&e.sum(dim, true)?)?;
        Ok(y.rewrap(op))
    }
}

/// Gradient of softmax with respect to its input, given the output `y` and
/// the upstream gradient `gy`. The result is itself differentiable with
/// respect to both `y` and `gy`.
pub fn softmax_grad<B: Backend>(y: &Tensor<B>, gy: &Tensor<B>, dim: usize) -> Result<Tensor<B>> {
    check_dim(y, dim)?;
    if y.shape() != gy.shape() {
        return Err(Error::ShapeMismatch {
            expected: y.shape().clone(),
            got: gy.shape().clone(),
        });
    }
    if y.dtype() != gy.dtype() {
        return Err(Error::DTypeMismatch {
            expected: y.dtype(),
            got: gy.dtype(),
        });
    }
    let op = Op::SoftmaxBackward {
        output: y.clone(),
        grad_output: gy.clone(),
        dim,
    };
    if use_fused::<B>() {
        log::debug!("softmax_grad: fused {} kernel, dim {}", B::NAME, dim);
        let storage = {
            let y_guard = y.read_storage()?;
            let gy_guard = gy.read_storage()?;
            B::softmax_backward(&y_guard, y.layout(), &gy_guard, gy.layout(), dim)?
        };
        return Ok(Tensor::from_storage(
            storage,
            Layout::contiguous(y.shape().clone()),
            y.dtype(),
            y.device().clone(),
            op,
        ));
    }
    log::debug!("softmax_grad: composite path, dim {}", dim);
    let (y_c, gy_c) = (y.detach(), gy.detach());
    let gx = y_c.mul(&gy_c)?;
    let gx = gx.sub(&y_c.mul(&gx.sum(dim, true)?)?)?;
    Ok(gx.rewrap(op))
}

/// Back-propagate `ggx` through `gx = softmax_grad(y, gy)`.
///
/// Returns `(grad_y, grad_gy)`.
pub fn softmax_double_grad<B: Backend>(
    y: &Tensor<B>,
    gy: &Tensor<B>,
    ggx: &Tensor<B>,
    dim: usize,
) -> Result<(Tensor<B>, Tensor<B>)> {
    let grad_gy = softmax_grad(y, ggx, dim)?;
    let s_gy = gy.mul(y)?.sum(dim, true)?;
    let s_ggx = ggx.mul(y)?.sum(dim, true)?;
    let grad_y = ggx.mul(&gy.sub(&s_gy)?)?.sub(&gy.mul(&s_ggx)?)?;
    Ok((grad_y, grad_gy))
}
