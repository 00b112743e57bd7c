// Gradient checking — analytic autograd vs. central finite differences
//
// check_backward(f, xs, gys, opts) compares one directional derivative:
//
//   analytic  = Σ_i <gx_i, d_i>                 gx from the autograd engine
//   numerical = (L(x + eps·d) - L(x - eps·d)) / 2eps,   L(x) = Σ_o <f(x)_o, gy_o>
//
// where d is a random standard-normal direction over all inputs, scaled to
// unit L2 norm. The analytic side runs in the inputs' own dtype; the
// numerical side runs in `opts.dtype` (F64 in practice) so the finite
// difference itself is not the limiting error. Inputs stored column-major
// are re-created column-major at every probe point, so strided kernels are
// exercised on both sides.
//
// check_double_backward(f, xs, gys, ggxs, opts) is check_backward applied to
// the first-order gradient map (xs, gys) -> gxs, seeded with ggxs.

use rand::rngs::StdRng;
use rand::SeedableRng;

use softcheck_core::{grad, Backend, DType, Error, Result, Tensor};

use crate::testing::{self, assert_allclose, Tolerance};

/// Settings for `check_backward` / `check_double_backward`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckOptions {
    /// Finite-difference step.
    pub eps: f64,
    pub atol: f64,
    pub rtol: f64,
    /// Dtype the numerical side is evaluated in. `None` keeps each input's dtype.
    pub dtype: Option<DType>,
    /// Seed for the random direction.
    pub seed: u64,
}

impl Default for CheckOptions {
    fn default() -> Self {
        let tol = Tolerance::default();
        CheckOptions {
            eps: 1e-3,
            atol: tol.atol,
            rtol: tol.rtol,
            dtype: None,
            seed: testing::seed(),
        }
    }
}

impl CheckOptions {
    pub fn with_tolerance(mut self, tol: Tolerance) -> Self {
        self.atol = tol.atol;
        self.rtol = tol.rtol;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn tolerance(&self) -> Tolerance {
        Tolerance::new(self.atol, self.rtol)
    }
}

/// Verify the gradient of `f` at `xs` against a finite-difference estimate.
///
/// `gys` seeds the backward pass, one per output of `f`. Fails with
/// `Error::MissingGradient` if some input receives no gradient and with
/// `Error::Mismatch` if the two directional derivatives disagree.
pub fn check_backward<B, F>(
    f: F,
    xs: &[Tensor<B>],
    gys: &[Tensor<B>],
    opts: &CheckOptions,
) -> Result<()>
where
    B: Backend,
    F: Fn(&[Tensor<B>]) -> Result<Vec<Tensor<B>>>,
{
    let vars: Vec<Tensor<B>> = xs.iter().map(|x| x.detach().set_variable()).collect();
    let ys = f(&vars)?;
    if ys.len() != gys.len() {
        return Err(Error::msg(format!(
            "check_backward: function returned {} outputs but {} gradients were given",
            ys.len(),
            gys.len()
        )));
    }

    let gxs = grad(&ys, &vars, gys)?
        .into_iter()
        .enumerate()
        .map(|(index, g)| g.ok_or(Error::MissingGradient { index }))
        .collect::<Result<Vec<_>>>()?;

    let directions = random_directions(&vars, opts.seed);
    let mut analytic = 0.0;
    for (gx, d) in gxs.iter().zip(&directions) {
        analytic += dot(&gx.to_f64_vec()?, d);
    }

    let base = vars
        .iter()
        .map(|x| x.to_f64_vec())
        .collect::<Result<Vec<_>>>()?;
    let plus = probe(&vars, &base, &directions, opts.eps, opts.dtype)?;
    let minus = probe(&vars, &base, &directions, -opts.eps, opts.dtype)?;
    let numerical = (loss(&f(&plus)?, gys)? - loss(&f(&minus)?, gys)?) / (2.0 * opts.eps);

    log::debug!(
        "check_backward: {} inputs, analytic {analytic:.6e}, numerical {numerical:.6e}",
        vars.len()
    );
    assert_allclose(&[numerical], &[analytic], opts.tolerance(), "check_backward")
}

/// Verify second derivatives of `f`: the gradient map
/// `(xs, gys) -> d(Σ <f(xs), gys>)/dxs` is itself checked with
/// `check_backward`, seeded with `ggxs`.
pub fn check_double_backward<B, F>(
    f: F,
    xs: &[Tensor<B>],
    gys: &[Tensor<B>],
    ggxs: &[Tensor<B>],
    opts: &CheckOptions,
) -> Result<()>
where
    B: Backend,
    F: Fn(&[Tensor<B>]) -> Result<Vec<Tensor<B>>>,
{
    let n = xs.len();
    let first_order = |inputs: &[Tensor<B>]| -> Result<Vec<Tensor<B>>> {
        let (x, gy) = inputs.split_at(n);
        let ys = f(x)?;
        grad(&ys, x, gy)?
            .into_iter()
            .enumerate()
            .map(|(index, g)| g.ok_or(Error::MissingGradient { index }))
            .collect()
    };
    let inputs: Vec<Tensor<B>> = xs.iter().chain(gys).cloned().collect();
    check_backward(first_order, &inputs, ggxs, opts)
}

/// Element-wise central differences of `L(x) = Σ_o <f(x)_o, gy_o>` with
/// respect to every element of every input, evaluated in the inputs' dtype.
pub fn numerical_grad<B, F>(
    f: F,
    xs: &[Tensor<B>],
    gys: &[Tensor<B>],
    eps: f64,
) -> Result<Vec<Vec<f64>>>
where
    B: Backend,
    F: Fn(&[Tensor<B>]) -> Result<Vec<Tensor<B>>>,
{
    let base = xs
        .iter()
        .map(|x| x.to_f64_vec())
        .collect::<Result<Vec<_>>>()?;
    let mut grads = Vec::with_capacity(xs.len());
    for (i, x) in xs.iter().enumerate() {
        let mut g = Vec::with_capacity(x.elem_count());
        for j in 0..x.elem_count() {
            let mut unit: Vec<Vec<f64>> = base.iter().map(|b| vec![0.0; b.len()]).collect();
            unit[i][j] = 1.0;
            let hi = loss(&f(&probe(xs, &base, &unit, eps, None)?)?, gys)?;
            let lo = loss(&f(&probe(xs, &base, &unit, -eps, None)?)?, gys)?;
            g.push((hi - lo) / (2.0 * eps));
        }
        grads.push(g);
    }
    Ok(grads)
}

/// One standard-normal direction per input, jointly scaled to unit L2 norm.
fn random_directions<B: Backend>(xs: &[Tensor<B>], seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut dirs: Vec<Vec<f64>> = xs
        .iter()
        .map(|x| testing::normal(&mut rng, x.elem_count()))
        .collect();
    let norm = dirs.iter().flatten().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        dirs.iter_mut().flatten().for_each(|v| *v /= norm);
    }
    dirs
}

/// Inputs at `base + scale * dirs`, in `dtype` (or each input's own dtype)
/// and in each input's memory order.
fn probe<B: Backend>(
    xs: &[Tensor<B>],
    base: &[Vec<f64>],
    dirs: &[Vec<f64>],
    scale: f64,
    dtype: Option<DType>,
) -> Result<Vec<Tensor<B>>> {
    xs.iter()
        .zip(base.iter().zip(dirs))
        .map(|(x, (b, d))| {
            let values: Vec<f64> = b.iter().zip(d).map(|(v, dv)| v + scale * dv).collect();
            let t = Tensor::from_f64_slice(
                &values,
                x.shape().clone(),
                dtype.unwrap_or(x.dtype()),
                x.device(),
            )?;
            if x.is_contiguous() {
                Ok(t)
            } else {
                t.as_fortran()
            }
        })
        .collect()
}

/// `Σ_o <y_o, gy_o>` on the host in f64.
fn loss<B: Backend>(ys: &[Tensor<B>], gys: &[Tensor<B>]) -> Result<f64> {
    if ys.len() != gys.len() {
        return Err(Error::msg(format!(
            "{} outputs but {} output gradients",
            ys.len(),
            gys.len()
        )));
    }
    let mut total = 0.0;
    for (y, gy) in ys.iter().zip(gys) {
        if y.shape() != gy.shape() {
            return Err(Error::ShapeMismatch {
                expected: y.shape().clone(),
                got: gy.shape().clone(),
            });
        }
        total += dot(&y.to_f64_vec()?, &gy.to_f64_vec()?);
    }
    Ok(total)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
