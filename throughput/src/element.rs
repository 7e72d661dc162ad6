use std::fmt::Debug;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::buffers::HostBuffer;
use crate::DType;

/// Widened result of a reduction: f32 data accumulates in f64, i32 in i64.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Float(f64),
    Int(i64),
}

impl ScalarValue {
    pub fn combine(self, other: ScalarValue) -> ScalarValue {
        match (self, other) {
            (ScalarValue::Int(a), ScalarValue::Int(b)) => ScalarValue::Int(a.wrapping_add(b)),
            (a, b) => ScalarValue::Float(a.as_f64() + b.as_f64()),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            ScalarValue::Float(v) => v,
            ScalarValue::Int(v) => v as f64,
        }
    }
}

/// Numeric element a kernel can run over. Arithmetic follows device
/// semantics: integers wrap instead of panicking.
pub trait Element: Pod + Default + PartialEq + Send + Sync + Debug + 'static {
    const DTYPE: DType;

    fn one() -> Self;

    /// Map a sample in `[0, 1)` onto this type's fill range.
    fn from_unit(x: f64) -> Self;

    fn add(self, rhs: Self) -> Self;

    fn mul_add(acc: Self, a: Self, b: Self) -> Self;

    /// Sequential left-to-right sum in the widened accumulator.
    fn sum(values: &[Self]) -> ScalarValue;

    fn zero_sum() -> ScalarValue;

    fn matches(computed: Self, reference: Self, tolerance: f64) -> bool;

    fn slice(buf: &HostBuffer) -> Option<&[Self]>;

    fn into_buffer(values: Vec<Self>) -> HostBuffer;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn one() -> Self {
        1.0
    }

    fn from_unit(x: f64) -> Self {
        x as f32
    }

    fn add(self, rhs: Self) -> Self {
        self + rhs
    }

    fn mul_add(acc: Self, a: Self, b: Self) -> Self {
        acc + a * b
    }

    fn sum(values: &[Self]) -> ScalarValue {
        ScalarValue::Float(values.iter().map(|&x| x as f64).sum())
    }

    fn zero_sum() -> ScalarValue {
        ScalarValue::Float(0.0)
    }

    fn matches(computed: Self, reference: Self, tolerance: f64) -> bool {
        if computed.is_nan() || reference.is_nan() {
            return false;
        }
        ((computed as f64) - (reference as f64)).abs() < tolerance
    }

    fn slice(buf: &HostBuffer) -> Option<&[Self]> {
        match buf {
            HostBuffer::F32(v) => Some(v),
            _ => None,
        }
    }

    fn into_buffer(values: Vec<Self>) -> HostBuffer {
        HostBuffer::F32(values)
    }
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;

    fn one() -> Self {
        1
    }

    fn from_unit(x: f64) -> Self {
        (x * 100.0) as i32
    }

    fn add(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }

    fn mul_add(acc: Self, a: Self, b: Self) -> Self {
        acc.wrapping_add(a.wrapping_mul(b))
    }

    fn sum(values: &[Self]) -> ScalarValue {
        ScalarValue::Int(values.iter().fold(0i64, |acc, &x| acc.wrapping_add(x as i64)))
    }

    fn zero_sum() -> ScalarValue {
        ScalarValue::Int(0)
    }

    fn matches(computed: Self, reference: Self, _tolerance: f64) -> bool {
        computed == reference
    }

    fn slice(buf: &HostBuffer) -> Option<&[Self]> {
        match buf {
            HostBuffer::I32(v) => Some(v),
            _ => None,
        }
    }

    fn into_buffer(values: Vec<Self>) -> HostBuffer {
        HostBuffer::I32(values)
    }
}
