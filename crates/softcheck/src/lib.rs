//! # Softcheck
//!
//! A numerically stable softmax with a fused CPU kernel, a composite
//! fallback, reverse-mode autograd to second order, and the conformance
//! tooling that checks all of it.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use softcheck::prelude::*;
//!
//! # fn main() -> softcheck::Result<()> {
//! let x = CpuTensor::from_f64_slice(&[-1000.0, 1.0], (1, 2), DType::F32, &CpuDevice)?;
//! let y = with_use_accel(UseAccel::Never, || softmax(&x, -1))?;
//! assert_eq!(y.to_f64_vec()?, vec![0.0, 1.0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `softcheck-core` | Tensor, Shape, DType, Layout, Backend trait, Autograd, dispatch config, kernel trace |
//! | `softcheck-cpu` | CPU backend with rayon-parallel fused softmax kernels |
//!
//! ## Modules
//!
//! - [`functions`] — `softmax(x, axis)` with negative-axis support
//! - [`gradient_check`] — finite-difference checks of first and second derivatives
//! - [`testing`] — tolerances, `assert_allclose`, seeded RNG, fixture helpers

/// Re-export core types.
pub use softcheck_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp},
    backprop::{backward_multi, grad},
    op::{Op, TensorId},
    DType, Error, GradStore, Layout, Result, Shape, Tensor, WithDType,
};

/// Re-export CPU backend.
pub use softcheck_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Dispatch configuration — `use_accel` modes and scoped overrides.
pub mod config {
    pub use softcheck_core::config::*;
}

/// Per-thread record of fused kernel launches.
pub mod kernel_trace {
    pub use softcheck_core::kernel_trace::{trace_kernel_calls, Kernel, KernelCalls};
}

pub mod functions;
pub mod gradient_check;
pub mod testing;

pub use functions::softmax;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::config::{should_use_accel, using_config, with_use_accel, AccelLevel, Config, UseAccel};
    pub use crate::functions::softmax;
    pub use crate::gradient_check::{check_backward, check_double_backward, CheckOptions};
    pub use crate::kernel_trace::{trace_kernel_calls, KernelCalls};
    pub use crate::testing::{assert_allclose, fix_random, product, uniform, Tolerance};
    pub use crate::{CpuBackend, CpuDevice, CpuTensor, DType, GradStore, Result, Shape, Tensor};
}
