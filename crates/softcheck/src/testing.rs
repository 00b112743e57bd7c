// Testing helpers — tolerances, seeded randomness, fixture tables
//
// Everything here works on host f64 values so the same helpers serve every
// dtype and backend:
//
//   Tolerance / assert_allclose   |actual - expected| <= atol + rtol * |expected|
//   fix_random                    StdRng seeded from SOFTCHECK_SEED (default 0)
//   uniform                       U[lo, hi) tensors rounded to the target dtype
//   product                       cartesian product of two fixture axes
//   reference_softmax             exp-then-normalise, straight from the definition

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use softcheck_core::{Backend, DType, Error, Result, Shape, Tensor};

/// Environment variable overriding the default test seed.
pub const SEED_ENV: &str = "SOFTCHECK_SEED";
pub const DEFAULT_SEED: u64 = 0;

/// Absolute and relative tolerance for `assert_allclose`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance {
            atol: 1e-5,
            rtol: 1e-4,
        }
    }
}

impl Tolerance {
    pub fn new(atol: f64, rtol: f64) -> Self {
        Tolerance { atol, rtol }
    }

    /// Half precision gets `atol = 1e-3, rtol = 1e-2`, everything else the
    /// defaults.
    pub fn for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::F16 => Tolerance::new(1e-3, 1e-2),
            DType::F32 | DType::F64 => Tolerance::default(),
        }
    }

    /// Whether `actual` is close enough to `expected`.
    pub fn admits(&self, actual: f64, expected: f64) -> bool {
        if actual == expected {
            return true;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

/// Check that two equally long sequences agree element-wise within `tol`.
///
/// NaN never matches anything. Returns `Error::Mismatch` naming the first
/// offending index.
pub fn assert_allclose(actual: &[f64], expected: &[f64], tol: Tolerance, what: &str) -> Result<()> {
    if actual.len() != expected.len() {
        return Err(Error::msg(format!(
            "{what}: length mismatch, expected {} values, got {}",
            expected.len(),
            actual.len()
        )));
    }
    for (index, (&got, &want)) in actual.iter().zip(expected).enumerate() {
        if !tol.admits(got, want) {
            return Err(Error::Mismatch {
                what: what.to_string(),
                index,
                expected: want,
                got,
                diff: (got - want).abs(),
                atol: tol.atol,
                rtol: tol.rtol,
            });
        }
    }
    Ok(())
}

/// The seed tests should use: `SOFTCHECK_SEED` if set and valid, else 0.
pub fn seed() -> u64 {
    match std::env::var(SEED_ENV) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("ignoring {SEED_ENV}='{raw}', using {DEFAULT_SEED}");
            DEFAULT_SEED
        }),
        Err(_) => DEFAULT_SEED,
    }
}

/// A deterministic RNG for one test case.
pub fn fix_random() -> StdRng {
    StdRng::seed_from_u64(seed())
}

/// A tensor of `shape` with values drawn from U[lo, hi), rounded to `dtype`.
pub fn uniform<B: Backend>(
    rng: &mut StdRng,
    shape: impl Into<Shape>,
    lo: f64,
    hi: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let shape = shape.into();
    let data: Vec<f64> = (0..shape.elem_count())
        .map(|_| rng.gen_range(lo..hi))
        .collect();
    Tensor::from_f64_slice(&data, shape, dtype, device)
}

/// `n` standard normal samples.
pub fn normal(rng: &mut StdRng, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.sample(StandardNormal)).collect()
}

/// Cartesian product of two fixture axes, first axis outermost.
pub fn product<A: Clone, B: Clone>(a: &[A], b: &[B]) -> Vec<(A, B)> {
    a.iter()
        .flat_map(|x| b.iter().map(move |y| (x.clone(), y.clone())))
        .collect()
}

/// softmax of row-major `values` along `axis`, computed as plain exp followed
/// by division by the axis sum. No max shift, so it is only a valid reference
/// where exp does not overflow.
pub fn reference_softmax(values: &[f64], shape: &Shape, axis: usize) -> Result<Vec<f64>> {
    let (outer, n, inner) = shape.split_at_dim(axis)?;
    let mut out: Vec<f64> = values.iter().map(|v| v.exp()).collect();
    for o in 0..outer {
        for i in 0..inner {
            let idx = |k: usize| (o * n + k) * inner + i;
            let sum: f64 = (0..n).map(|k| out[idx(k)]).sum();
            for k in 0..n {
                out[idx(k)] /= sum;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_formula() {
        let tol = Tolerance::new(1e-3, 1e-2);
        assert!(tol.admits(1.0105, 1.0));
        assert!(!tol.admits(1.012, 1.0));
        assert!(tol.admits(f64::INFINITY, f64::INFINITY));
        assert!(!tol.admits(f64::NAN, f64::NAN));
    }

    #[test]
    fn test_assert_allclose_reports_index() {
        let err = assert_allclose(&[0.0, 0.5], &[0.0, 0.4], Tolerance::default(), "forward")
            .unwrap_err();
        match err {
            Error::Mismatch { index, what, .. } => {
                assert_eq!(index, 1);
                assert_eq!(what, "forward");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(assert_allclose(&[0.0], &[0.0, 1.0], Tolerance::default(), "x").is_err());
    }

    #[test]
    fn test_for_dtype() {
        assert_eq!(Tolerance::for_dtype(DType::F16), Tolerance::new(1e-3, 1e-2));
        assert_eq!(Tolerance::for_dtype(DType::F64), Tolerance::default());
    }

    #[test]
    fn test_fix_random_is_deterministic() {
        let a: Vec<f64> = normal(&mut StdRng::seed_from_u64(7), 4);
        let b: Vec<f64> = normal(&mut StdRng::seed_from_u64(7), 4);
        assert_eq!(a, b);
    }

    #[test]
    fn test_product_order() {
        let p = product(&[1, 2], &['a', 'b']);
        assert_eq!(p, vec![(1, 'a'), (1, 'b'), (2, 'a'), (2, 'b')]);
    }

    #[test]
    fn test_reference_softmax_axis0() {
        let shape = Shape::from((2, 2));
        let y = reference_softmax(&[0.0, 1.0, 0.0, 1.0], &shape, 0).unwrap();
        assert!(y.iter().all(|v| (v - 0.5).abs() < 1e-15));
    }
}
