// Softmax conformance — forward values, first and second derivatives
//
// Every check runs over the fixture table crossed with {f16, f32, f64}:
//
//   probe [[v, 1]]   axis 1     v = -5 (f16) or -1000, a stability probe
//   [2, 3]           axis 0, 1
//   [2, 3, 4]        axis 0, 2
//   [2, 3, 2, 3]     axis 1, 3
//
// and under each dispatch mode (always, auto, never), plus a column-major
// input with the kernel on.

#[cfg(test)]
mod tests {
    use softcheck::gradient_check::{check_backward, check_double_backward, CheckOptions};
    use softcheck::testing::{
        assert_allclose, fix_random, product, reference_softmax, uniform, Tolerance,
    };
    use softcheck::{
        config::{with_use_accel, UseAccel},
        softmax, CpuBackend, CpuDevice, CpuTensor, DType, Error, Result,
    };

    type T = CpuTensor;

    const CASES: &[(Option<&[usize]>, isize)] = &[
        (None, 1),
        (Some(&[2, 3]), 0),
        (Some(&[2, 3]), 1),
        (Some(&[2, 3, 4]), 0),
        (Some(&[2, 3, 4]), 2),
        (Some(&[2, 3, 2, 3]), 1),
        (Some(&[2, 3, 2, 3]), 3),
    ];

    struct Fixture {
        x: T,
        gy: T,
        ggx: T,
        axis: isize,
        tol: Tolerance,
    }

    impl Fixture {
        fn new(shape: Option<&[usize]>, axis: isize, dtype: DType) -> Result<Self> {
            let mut rng = fix_random();
            let x = match shape {
                Some(dims) => uniform::<CpuBackend>(&mut rng, dims, -1.0, 1.0, dtype, &CpuDevice)?,
                None => {
                    let v = if dtype == DType::F16 { -5.0 } else { -1000.0 };
                    T::from_f64_slice(&[v, 1.0], (1, 2), dtype, &CpuDevice)?
                }
            };
            let dims = x.dims().to_vec();
            let gy = uniform::<CpuBackend>(&mut rng, dims.as_slice(), -1.0, 1.0, dtype, &CpuDevice)?;
            let ggx = uniform::<CpuBackend>(&mut rng, dims.as_slice(), -1.0, 1.0, dtype, &CpuDevice)?;
            Ok(Fixture {
                x,
                gy,
                ggx,
                axis,
                tol: Tolerance::for_dtype(dtype),
            })
        }

        fn options(&self) -> CheckOptions {
            CheckOptions::default()
                .with_tolerance(self.tol)
                .with_dtype(DType::F64)
        }
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Run `check` once per fixture, tagging failures with the case.
    fn for_each_case(check: impl Fn(&Fixture) -> Result<()>) {
        init_logging();
        for ((shape, axis), dtype) in product(CASES, &DType::ALL) {
            let case = format!("shape={shape:?} axis={axis} dtype={dtype}");
            let result = Fixture::new(shape, axis, dtype).and_then(|fx| check(&fx));
            if let Err(e) = result {
                panic!("{}", e.context(case));
            }
        }
    }

    fn check_forward(fx: &Fixture, x: &T, mode: UseAccel) -> Result<()> {
        let y = with_use_accel(mode, || softmax(x, fx.axis))?;
        assert_eq!(y.dtype(), x.dtype());
        assert_eq!(y.shape(), x.shape());
        let got = y.to_f64_vec()?;
        if got.iter().any(|v| !v.is_finite()) {
            return Err(Error::msg(format!("non-finite output {got:?}")));
        }
        let axis = softcheck::functions::normalize_axis(fx.axis, x.rank())?;
        let expected = reference_softmax(&x.to_f64_vec()?, x.shape(), axis)?;
        assert_allclose(&got, &expected, fx.tol, "forward")
    }

    fn softmax_fn(axis: isize) -> impl Fn(&[T]) -> Result<Vec<T>> {
        move |xs: &[T]| Ok(vec![softmax(&xs[0], axis)?])
    }

    fn check_grad(fx: &Fixture, x: &T, gy: &T, mode: UseAccel) -> Result<()> {
        with_use_accel(mode, || {
            check_backward(softmax_fn(fx.axis), &[x.clone()], &[gy.clone()], &fx.options())
        })
    }

    fn check_double_grad(fx: &Fixture, mode: UseAccel) -> Result<()> {
        with_use_accel(mode, || {
            check_double_backward(
                softmax_fn(fx.axis),
                &[fx.x.clone()],
                &[fx.gy.clone()],
                &[fx.ggx.clone()],
                &fx.options(),
            )
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Forward
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_forward_always() {
        for_each_case(|fx| check_forward(fx, &fx.x, UseAccel::Always));
    }

    #[test]
    fn test_forward_never() {
        for_each_case(|fx| check_forward(fx, &fx.x, UseAccel::Never));
    }

    #[test]
    fn test_forward_fortran() {
        for_each_case(|fx| check_forward(fx, &fx.x.as_fortran()?, UseAccel::Always));
    }

    #[test]
    fn test_forward_paths_agree() {
        for_each_case(|fx| {
            let fused = with_use_accel(UseAccel::Always, || softmax(&fx.x, fx.axis))?;
            let composite = with_use_accel(UseAccel::Never, || softmax(&fx.x, fx.axis))?;
            assert_allclose(
                &composite.to_f64_vec()?,
                &fused.to_f64_vec()?,
                fx.tol,
                "fused vs composite",
            )
        });
    }

    #[test]
    fn test_stability_probe_is_finite() {
        init_logging();
        for (dtype, mode) in product(&DType::ALL, &UseAccel::ALL) {
            let fx = Fixture::new(None, 1, dtype).unwrap();
            let y = with_use_accel(mode, || softmax(&fx.x, 1)).unwrap();
            let y = y.to_f64_vec().unwrap();
            assert!(y.iter().all(|v| v.is_finite()), "{dtype} {mode}: {y:?}");
            assert!((y[0] + y[1] - 1.0).abs() < 1e-3, "{dtype} {mode}: {y:?}");
            assert!(y[1] > 0.99, "{dtype} {mode}: {y:?}");
        }
    }

    #[test]
    fn test_fortran_input_is_strided() {
        let fx = Fixture::new(Some(&[2, 3]), 0, DType::F32).unwrap();
        let xf = fx.x.as_fortran().unwrap();
        assert!(!xf.is_contiguous());
        assert_eq!(xf.to_f64_vec().unwrap(), fx.x.to_f64_vec().unwrap());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Backward
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_backward_always() {
        for_each_case(|fx| check_grad(fx, &fx.x, &fx.gy, UseAccel::Always));
    }

    #[test]
    fn test_backward_never() {
        for_each_case(|fx| check_grad(fx, &fx.x, &fx.gy, UseAccel::Never));
    }

    #[test]
    fn test_backward_auto() {
        for_each_case(|fx| check_grad(fx, &fx.x, &fx.gy, UseAccel::Auto));
    }

    #[test]
    fn test_backward_fortran() {
        for_each_case(|fx| {
            check_grad(
                fx,
                &fx.x.as_fortran()?,
                &fx.gy.as_fortran()?,
                UseAccel::Always,
            )
        });
    }

    #[test]
    fn test_backward_rows_sum_to_zero() {
        for_each_case(|fx| {
            let x = fx.x.clone().set_variable();
            let y = with_use_accel(UseAccel::Always, || softmax(&x, fx.axis))?;
            let grads = y.backward_with_grad(&fx.gy)?;
            let gx = grads
                .get(&x)
                .ok_or(Error::MissingGradient { index: 0 })?;
            let axis = softcheck::functions::normalize_axis(fx.axis, x.rank())?;
            let sums = gx.to_dtype(DType::F64)?.sum(axis, false)?.to_f64_vec()?;
            let zeros = vec![0.0; sums.len()];
            // Rounded gx rows only cancel to within a few ulps
            let tol = Tolerance::new(fx.tol.atol * 5.0, 0.0);
            assert_allclose(&sums, &zeros, tol, "row sums of gx")
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Double backward
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_double_backward_always() {
        for_each_case(|fx| check_double_grad(fx, UseAccel::Always));
    }

    #[test]
    fn test_double_backward_never() {
        for_each_case(|fx| check_double_grad(fx, UseAccel::Never));
    }

    #[test]
    fn test_double_backward_auto() {
        for_each_case(|fx| check_double_grad(fx, UseAccel::Auto));
    }
}
