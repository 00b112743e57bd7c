// Backpropagation — Reverse-mode automatic differentiation
//
//   1. Forward ops record their Op on each output tensor, forming a DAG.
//   2. backward() topologically sorts the DAG reachable from the roots.
//   3. Seeds are placed on the roots, then the graph is walked root-first and
//      each Op pushes gradients to its inputs via the chain rule.
//
// Every gradient rule below is written with differentiable Tensor ops, so the
// gradients themselves carry a graph. That is what makes double backward
// work: differentiate the gradient again by calling backward on it, seeded
// with the second-order upstream gradient.
//
// GRADIENT RULES:
//
//   Add:        ga += g,          gb += g
//   Sub:        ga += g,          gb += -g
//   Mul:        ga += g * b,      gb += g * a
//   Div:        ga += g / b,      gb += -g * a / b²
//   Neg:        gx += -g
//   Exp:        gx += g * exp(x)                 (exp(x) is the output itself)
//   Sum(d):     gx += broadcast(g)
//   Max(d):     gx += broadcast(g) * mask        (ties share the gradient)
//   Broadcast:  gx += sum of g over the expanded dims
//   Reshape:    gx += reshape(g, src_shape)
//   Transpose:  gx += transpose(g)
//   Copy:       gx += g
//   ToDtype:    gx += cast(g, src_dtype)
//   Softmax:    gx += softmax_grad(y, g)
//   SoftmaxBackward(y, gy):
//               gy' += softmax_grad(y, g)
//               y'  += g * (gy - sum(gy * y)) - gy * sum(g * y)
//
// ACCUMULATION: a tensor used by several ops receives the sum of all
// contributions.

use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::error::{Error, Result};
use crate::op::{Op, TensorId};
use crate::shape::Shape;
use crate::softmax::{softmax_double_grad, softmax_grad};
use crate::tensor::Tensor;

/// Stores gradients for the tensors of a computation graph.
///
/// Use `grads.get(&tensor)` to retrieve the gradient for any tensor reached
/// by backward().
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Clone for GradStore<B> {
    fn clone(&self) -> Self {
        GradStore {
            grads: self.grads.clone(),
        }
    }
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// Get the gradient of a tensor (if it exists).
    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    fn get_by_id(&self, id: &TensorId) -> Option<&Tensor<B>> {
        self.grads.get(id)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Add `grad` to the gradient stored for `id`.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        if let Some(existing) = self.grads.get(&id) {
            let new_grad = existing.add(&grad)?;
            self.grads.insert(id, new_grad);
        } else {
            self.grads.insert(id, grad);
        }
        Ok(())
    }
}

/// Topological order of everything reachable from `roots`, leaves first.
fn build_topo<B: Backend>(roots: &[&Tensor<B>]) -> Vec<Tensor<B>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();

    fn visit<B: Backend>(
        t: &Tensor<B>,
        visited: &mut HashSet<TensorId>,
        order: &mut Vec<Tensor<B>>,
    ) {
        if !visited.insert(t.id()) {
            return;
        }
        for input in t.op().inputs() {
            visit(input, visited, order);
        }
        order.push(t.clone());
    }

    for root in roots {
        visit(root, &mut visited, &mut order);
    }
    order
}

/// Back-propagate from a scalar `root`, seeding with 1.
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if root.elem_count() != 1 {
        return Err(Error::msg(format!(
            "backward() requires a scalar tensor, got shape {}; \
             use backward_with_grad to seed a non-scalar output",
            root.shape()
        )));
    }
    let seed = Tensor::<B>::ones_like(root)?;
    backward_multi(&[(root.clone(), seed)])
}

/// Back-propagate from `root` seeded with `seed`.
pub fn backward_with_grad<B: Backend>(root: &Tensor<B>, seed: &Tensor<B>) -> Result<GradStore<B>> {
    backward_multi(&[(root.clone(), seed.clone())])
}

/// Back-propagate from several roots at once, each with its own seed.
///
/// Seeds are used as given (not copied), so when a seed is itself a variable
/// the resulting gradients stay connected to it.
pub fn backward_multi<B: Backend>(roots: &[(Tensor<B>, Tensor<B>)]) -> Result<GradStore<B>> {
    let mut grads = GradStore::new();
    for (root, seed) in roots {
        if root.shape() != seed.shape() {
            return Err(Error::ShapeMismatch {
                expected: root.shape().clone(),
                got: seed.shape().clone(),
            });
        }
        if root.dtype() != seed.dtype() {
            return Err(Error::DTypeMismatch {
                expected: root.dtype(),
                got: seed.dtype(),
            });
        }
        grads.accumulate(root.id(), seed.clone())?;
    }

    let root_refs: Vec<&Tensor<B>> = roots.iter().map(|(r, _)| r).collect();
    let topo = build_topo(&root_refs);
    log::trace!("backward: {} roots, {} nodes", roots.len(), topo.len());

    for tensor in topo.iter().rev() {
        let grad_output = match grads.get_by_id(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue,
        };

        match tensor.op() {
            Op::None => {}

            Op::Binary { lhs, rhs, op } => {
                compute_binary_grad(*op, &grad_output, lhs, rhs, &mut grads)?;
            }

            Op::Unary { input, op } => {
                let grad_input = match op {
                    UnaryOp::Neg => grad_output.neg()?,
                    UnaryOp::Exp => grad_output.mul(tensor)?,
                };
                grads.accumulate(input.id(), grad_input)?;
            }

            Op::Reduce {
                input,
                op,
                dim,
                keep_dim,
            } => {
                compute_reduce_grad(
                    *op,
                    &grad_output,
                    tensor,
                    input,
                    *dim,
                    *keep_dim,
                    &mut grads,
                )?;
            }

            Op::Broadcast { input, src_shape } => {
                let grad = reduce_broadcast_grad(&grad_output, src_shape)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Reshape { input, src_shape } => {
                grads.accumulate(input.id(), grad_output.reshape(src_shape.clone())?)?;
            }

            Op::Transpose { input, dim0, dim1 } => {
                grads.accumulate(input.id(), grad_output.transpose(*dim0, *dim1)?)?;
            }

            Op::Copy { input } => {
                grads.accumulate(input.id(), grad_output)?;
            }

            Op::ToDtype { input, src_dtype } => {
                grads.accumulate(input.id(), grad_output.to_dtype(*src_dtype)?)?;
            }

            Op::Softmax { input, dim } => {
                grads.accumulate(input.id(), softmax_grad(tensor, &grad_output, *dim)?)?;
            }

            Op::SoftmaxBackward {
                output,
                grad_output: upstream,
                dim,
            } => {
                let (grad_y, grad_gy) = softmax_double_grad(output, upstream, &grad_output, *dim)?;
                grads.accumulate(output.id(), grad_y)?;
                grads.accumulate(upstream.id(), grad_gy)?;
            }
        }
    }

    Ok(grads)
}

/// Gradients of `outputs` (seeded with `grad_outputs`) with respect to
/// `inputs`. An input the backward pass never reached yields `None`.
pub fn grad<B: Backend>(
    outputs: &[Tensor<B>],
    inputs: &[Tensor<B>],
    grad_outputs: &[Tensor<B>],
) -> Result<Vec<Option<Tensor<B>>>> {
    if outputs.len() != grad_outputs.len() {
        return Err(Error::msg(format!(
            "grad: {} outputs but {} output gradients",
            outputs.len(),
            grad_outputs.len()
        )));
    }
    let roots: Vec<(Tensor<B>, Tensor<B>)> = outputs
        .iter()
        .cloned()
        .zip(grad_outputs.iter().cloned())
        .collect();
    let store = backward_multi(&roots)?;
    Ok(inputs.iter().map(|x| store.get(x).cloned()).collect())
}

// Gradient rules for binary operations
//
// Operands already have the output shape; broadcasting was recorded as a
// separate Broadcast node.

fn compute_binary_grad<B: Backend>(
    op: BinaryOp,
    grad_output: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    match op {
        BinaryOp::Add => {
            grads.accumulate(lhs.id(), grad_output.clone())?;
            grads.accumulate(rhs.id(), grad_output.clone())?;
        }
        BinaryOp::Sub => {
            grads.accumulate(lhs.id(), grad_output.clone())?;
            grads.accumulate(rhs.id(), grad_output.neg()?)?;
        }
        BinaryOp::Mul => {
            grads.accumulate(lhs.id(), grad_output.mul(rhs)?)?;
            grads.accumulate(rhs.id(), grad_output.mul(lhs)?)?;
        }
        BinaryOp::Div => {
            grads.accumulate(lhs.id(), grad_output.div(rhs)?)?;
            let b_sq = rhs.mul(rhs)?;
            let grad_rhs = grad_output.neg()?.mul(lhs)?.div(&b_sq)?;
            grads.accumulate(rhs.id(), grad_rhs)?;
        }
    }
    Ok(())
}

/// Sum `grad` over the dims a broadcast expanded, then reshape to `target`.
///
/// [2, 1] broadcast to [2, 3]: grad [2, 3] → sum(1, keep) → [2, 1]
/// [3]    broadcast to [2, 3]: grad [2, 3] → sum(0, keep) → [1, 3] → [3]
fn reduce_broadcast_grad<B: Backend>(grad: &Tensor<B>, target: &Shape) -> Result<Tensor<B>> {
    let grad_dims = grad.dims().to_vec();
    let target_dims = target.dims();
    if grad_dims == target_dims {
        return Ok(grad.clone());
    }

    let rank = grad_dims.len();
    let lead = rank - target_dims.len();
    let mut padded = vec![1usize; rank];
    padded[lead..].copy_from_slice(target_dims);

    let mut result = grad.clone();
    for d in (0..rank).rev() {
        if padded[d] == 1 && grad_dims[d] > 1 {
            result = result.sum(d, true)?;
        }
    }
    result.reshape(target.clone())
}

// Gradient rules for reductions

fn compute_reduce_grad<B: Backend>(
    op: ReduceOp,
    grad_output: &Tensor<B>,
    output: &Tensor<B>,
    input: &Tensor<B>,
    dim: usize,
    keep_dim: bool,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let reduced = input.shape().reduced(dim)?;
    let g = if keep_dim {
        grad_output.clone()
    } else {
        grad_output.reshape(reduced)?
    };
    let expanded = g.broadcast_as(input.shape().clone())?;
    let grad_input = match op {
        ReduceOp::Sum => expanded,
        ReduceOp::Max => expanded.mul(&max_mask(input, output, dim)?)?,
    };
    grads.accumulate(input.id(), grad_input)
}

/// 1/k where the input equals its row max (k = number of ties), else 0.
fn max_mask<B: Backend>(input: &Tensor<B>, output: &Tensor<B>, dim: usize) -> Result<Tensor<B>> {
    let (outer, n, inner) = input.shape().split_at_dim(dim)?;
    let x = input.to_f64_vec()?;
    let m = output.to_f64_vec()?;
    let mut mask = vec![0f64; x.len()];
    for o in 0..outer {
        for i in 0..inner {
            let best = m[o * inner + i];
            let hits: Vec<usize> = (0..n)
                .map(|k| (o * n + k) * inner + i)
                .filter(|&idx| x[idx] == best)
                .collect();
            let share = 1.0 / hits.len().max(1) as f64;
            for idx in hits {
                mask[idx] = share;
            }
        }
    }
    Tensor::from_f64_slice(&mask, input.shape().clone(), input.dtype(), input.device())
}
