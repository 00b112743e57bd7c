use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// DType — Floating-point element types
//
// Softmax and its derivatives are only meaningful on floating-point data, so
// the runtime carries exactly three precisions:
//
//   F16   16-bit IEEE half float (stored as half::f16, rounded after each op)
//   F32   32-bit float
//   F64   64-bit float, also the working precision of numerical gradients

/// Enum of all supported element data types.
///
/// Stored inside every tensor so operations can dispatch to the correct
/// typed implementation at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    F32,
    F64,
}

impl DType {
    /// Every dtype, in the order test tables enumerate them.
    pub const ALL: [DType; 3] = [DType::F16, DType::F32, DType::F64];

    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    /// Whether this is the half-precision type.
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16)
    }

    /// Machine epsilon of the type.
    pub fn epsilon(&self) -> f64 {
        match self {
            DType::F16 => half::f16::EPSILON.to_f64(),
            DType::F32 => f32::EPSILON as f64,
            DType::F64 => f64::EPSILON,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f16" | "float16" | "half" => Ok(DType::F16),
            "f32" | "float32" | "float" => Ok(DType::F32),
            "f64" | "float64" | "double" => Ok(DType::F64),
            other => Err(Error::Config(format!("unknown dtype '{other}'"))),
        }
    }
}

// WithDType — Bridge between Rust element types and the DType enum

/// Trait implemented by Rust types that can be stored in a tensor.
///
/// Provides the mapping between the concrete Rust type and the DType enum,
/// plus conversions to/from f64 for numeric operations.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64.
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64 (rounding to nearest).
    fn from_f64(v: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
    }

    #[test]
    fn test_dtype_is_half() {
        assert!(DType::F16.is_half());
        assert!(!DType::F32.is_half());
        assert!(!DType::F64.is_half());
    }

    #[test]
    fn test_f16_rounding() {
        // -1000 is exactly representable, 0.1 is not
        assert_eq!(half::f16::from_f64(-1000.0).to_f64(), -1000.0);
        let v = half::f16::from_f64(0.1).to_f64();
        assert!((v - 0.1).abs() < 1e-4 && v != 0.1);
    }

    #[test]
    fn test_parse() {
        assert_eq!("float16".parse::<DType>().unwrap(), DType::F16);
        assert_eq!(" F64 ".parse::<DType>().unwrap(), DType::F64);
        assert!("bf16".parse::<DType>().is_err());
    }
}
