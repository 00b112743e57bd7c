//! # softcheck-core
//!
//! Core tensor primitives, autograd and dispatch configuration for softcheck.
//!
//! This crate provides:
//! - [`Tensor`] — n-dimensional array with reverse-mode differentiation
//!   (gradients are graph nodes, so they can be differentiated again)
//! - [`Shape`] / [`Layout`] — shape, strides, offset, row- and column-major views
//! - [`DType`] — the floating-point element types (F16, F32, F64)
//! - [`Backend`] trait — abstraction over compute backends and their fused kernels
//! - [`GradStore`] — gradient storage returned by `backward()`
//! - [`config`] — scoped `use_accel` dispatch configuration
//! - [`kernel_trace`] — per-thread record of fused kernel launches
//! - [`softmax`] — `Tensor::softmax` and its gradients, fused or composite per the dispatch config

pub mod backend;
pub mod backprop;
pub mod config;
pub mod dtype;
pub mod error;
pub mod kernel_trace;
pub mod layout;
pub mod op;
pub mod shape;
pub mod softmax;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage};
pub use backprop::{backward_multi, grad, GradStore};
pub use config::{should_use_accel, using_config, with_use_accel, AccelLevel, Config, UseAccel};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use kernel_trace::{trace_kernel_calls, Kernel, KernelCalls};
pub use layout::Layout;
pub use op::{Op, TensorId};
pub use shape::Shape;
pub use tensor::Tensor;
