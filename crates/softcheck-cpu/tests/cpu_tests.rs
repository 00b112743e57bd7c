// CPU Backend Tests — tensor primitives and their gradients on the host
//
// Run with: `cargo test -p softcheck-cpu`

#[cfg(test)]
mod tests {
    use softcheck_core::backprop::grad;
    use softcheck_core::config::{with_use_accel, UseAccel};
    use softcheck_core::dtype::DType;
    use softcheck_core::Error;
    use softcheck_cpu::{CpuDevice, CpuTensor};

    type T = CpuTensor;

    fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    fn assert_approx_vec(actual: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(
            actual.len(),
            expected.len(),
            "length mismatch: {} vs {}",
            actual.len(),
            expected.len()
        );
        for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
            assert!(approx(*a, *e, tol), "index {i}: {a} != {e} (tol={tol})");
        }
    }

    fn var(data: &[f64], shape: &[usize]) -> T {
        T::from_f64_slice(data, shape, DType::F64, &CpuDevice)
            .unwrap()
            .set_variable()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tensor creation
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_full_and_zeros() {
        let t = T::full((3, 2), 42.0, DType::F32, &CpuDevice).unwrap();
        assert_eq!(t.shape().dims(), &[3, 2]);
        assert_eq!(t.to_f64_vec().unwrap(), vec![42.0; 6]);
        let z = T::zeros((2, 3), DType::F16, &CpuDevice).unwrap();
        assert_eq!(z.dtype(), DType::F16);
        assert_eq!(z.to_f64_vec().unwrap(), vec![0.0; 6]);
    }

    #[test]
    fn test_from_f64_slice_count_mismatch() {
        let err = T::from_f64_slice(&[1.0, 2.0, 3.0], (2, 2), DType::F32, &CpuDevice).unwrap_err();
        assert!(matches!(err, Error::ElementCountMismatch { expected: 4, got: 3, .. }));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Forward ops
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_broadcast_add() {
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F32, &CpuDevice)
            .unwrap();
        let b = T::from_f64_slice(&[10.0, 20.0, 30.0], 3, DType::F32, &CpuDevice).unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(
            c.to_f64_vec().unwrap(),
            vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
        );
    }

    #[test]
    fn test_dtype_mismatch() {
        let a = T::ones(2, DType::F32, &CpuDevice).unwrap();
        let b = T::ones(2, DType::F64, &CpuDevice).unwrap();
        assert!(matches!(a.add(&b), Err(Error::DTypeMismatch { .. })));
    }

    #[test]
    fn test_transpose_then_contiguous() {
        let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &CpuDevice)
            .unwrap();
        let at = a.transpose(0, 1).unwrap();
        assert!(!at.is_contiguous());
        assert_eq!(at.dims(), &[3, 2]);
        let c = at.contiguous().unwrap();
        assert!(c.is_contiguous());
        assert_eq!(c.to_f64_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_to_dtype_rounds() {
        let a = T::from_f64_slice(&[0.1], 1, DType::F64, &CpuDevice).unwrap();
        let h = a.to_dtype(DType::F16).unwrap();
        assert_eq!(h.dtype(), DType::F16);
        assert!(approx(h.to_scalar_f64().unwrap(), 0.1, 1e-4));
        assert_ne!(h.to_scalar_f64().unwrap(), 0.1);
    }

    #[test]
    fn test_softmax_dim_out_of_range() {
        let a = T::zeros((2, 3), DType::F32, &CpuDevice).unwrap();
        assert!(matches!(
            a.softmax(2),
            Err(Error::DimOutOfRange { dim: 2, rank: 2 })
        ));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Gradients
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_broadcast_add_backward() {
        let a = var(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = var(&[1.0, 1.0, 1.0], &[3]);
        let loss = a.add(&b).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert_approx_vec(&grads.get(&a).unwrap().to_f64_vec().unwrap(), &[1.0; 6], 1e-12);
        let gb = grads.get(&b).unwrap();
        assert_eq!(gb.dims(), &[3]);
        assert_approx_vec(&gb.to_f64_vec().unwrap(), &[2.0, 2.0, 2.0], 1e-12);
    }

    #[test]
    fn test_mul_div_backward() {
        let a = var(&[2.0, 3.0], &[2]);
        let b = var(&[4.0, 5.0], &[2]);
        let grads = a.mul(&b).unwrap().sum_all().unwrap().backward().unwrap();
        assert_approx_vec(&grads.get(&a).unwrap().to_f64_vec().unwrap(), &[4.0, 5.0], 1e-12);
        assert_approx_vec(&grads.get(&b).unwrap().to_f64_vec().unwrap(), &[2.0, 3.0], 1e-12);

        let grads = a.div(&b).unwrap().sum_all().unwrap().backward().unwrap();
        assert_approx_vec(&grads.get(&a).unwrap().to_f64_vec().unwrap(), &[0.25, 0.2], 1e-12);
        assert_approx_vec(
            &grads.get(&b).unwrap().to_f64_vec().unwrap(),
            &[-2.0 / 16.0, -3.0 / 25.0],
            1e-12,
        );
    }

    #[test]
    fn test_exp_backward() {
        let a = var(&[0.0, 1.0], &[2]);
        let grads = a.exp().unwrap().sum_all().unwrap().backward().unwrap();
        assert_approx_vec(
            &grads.get(&a).unwrap().to_f64_vec().unwrap(),
            &[1.0, 1f64.exp()],
            1e-12,
        );
    }

    #[test]
    fn test_max_backward_splits_ties() {
        let a = var(&[1.0, 3.0, 3.0], &[3]);
        let grads = a.max(0, false).unwrap().backward().unwrap();
        assert_approx_vec(
            &grads.get(&a).unwrap().to_f64_vec().unwrap(),
            &[0.0, 0.5, 0.5],
            1e-12,
        );
    }

    #[test]
    fn test_sum_keepdim_backward() {
        let a = var(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let s = a.sum(1, true).unwrap();
        assert_eq!(s.dims(), &[2, 1]);
        let seed = T::from_f64_slice(&[1.0, 2.0], (2, 1), DType::F64, &CpuDevice).unwrap();
        let grads = s.backward_with_grad(&seed).unwrap();
        assert_approx_vec(
            &grads.get(&a).unwrap().to_f64_vec().unwrap(),
            &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0],
            1e-12,
        );
    }

    #[test]
    fn test_to_dtype_backward_keeps_source_dtype() {
        let a = T::from_f64_slice(&[1.0, 2.0], 2, DType::F32, &CpuDevice)
            .unwrap()
            .set_variable();
        let loss = a.to_dtype(DType::F64).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let ga = grads.get(&a).unwrap();
        assert_eq!(ga.dtype(), DType::F32);
        assert_eq!(ga.to_f64_vec().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_backward_requires_scalar() {
        let a = var(&[1.0, 2.0], &[2]);
        assert!(a.exp().unwrap().backward().is_err());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Softmax gradients on both paths
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_softmax_backward_value() {
        // y = [0.5, 0.5], gx = y * (gy - <y, gy>) = [0.25, -0.25]
        for mode in UseAccel::ALL {
            let x = var(&[0.0, 0.0], &[1, 2]);
            let gy = T::from_f64_slice(&[1.0, 0.0], (1, 2), DType::F64, &CpuDevice).unwrap();
            let y = with_use_accel(mode, || x.softmax(1)).unwrap();
            let grads = with_use_accel(mode, || y.backward_with_grad(&gy)).unwrap();
            assert_approx_vec(
                &grads.get(&x).unwrap().to_f64_vec().unwrap(),
                &[0.25, -0.25],
                1e-12,
            );
        }
    }

    #[test]
    fn test_softmax_empty_axis() {
        for mode in [UseAccel::Always, UseAccel::Never] {
            let x = T::from_f64_slice(&[], (2, 0), DType::F32, &CpuDevice).unwrap();
            let y = with_use_accel(mode, || x.softmax(1)).unwrap();
            assert_eq!(y.dims(), &[2, 0], "{mode}");
            assert_eq!(y.dtype(), DType::F32);
            assert!(y.to_f64_vec().unwrap().is_empty());
        }
    }

    #[test]
    fn test_softmax_gradient_is_differentiable() {
        for mode in UseAccel::ALL {
            with_use_accel(mode, || {
                let x = var(&[0.3, -0.2, 0.9], &[3]);
                let gy = var(&[1.0, 0.5, -0.5], &[3]);
                let y = x.softmax(0).unwrap();
                let gx = grad(&[y], &[x.clone()], &[gy.clone()]).unwrap();
                let gx = gx[0].clone().unwrap();
                let ggx = T::ones(3, DType::F64, &CpuDevice).unwrap();
                let second = grad(&[gx], &[x.clone(), gy.clone()], &[ggx]).unwrap();
                assert!(second[0].is_some(), "no gradient reached x ({mode})");
                // sum(gx) is identically zero, so its gradient w.r.t. gy vanishes
                let ggy = second[1].as_ref().unwrap().to_f64_vec().unwrap();
                assert_approx_vec(&ggy, &[0.0; 3], 1e-12);
            });
        }
    }
}
