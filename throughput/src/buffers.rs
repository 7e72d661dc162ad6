use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::element::Element;
use crate::{DType, Error, ProblemDescriptor, Result};

/// Contiguous host array. Lives for one benchmark run.
#[derive(Clone, Debug, PartialEq)]
pub enum HostBuffer {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl HostBuffer {
    pub fn zeroed(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => HostBuffer::F32(vec![0.0; len]),
            DType::I32 => HostBuffer::I32(vec![0; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            HostBuffer::F32(_) => DType::F32,
            HostBuffer::I32(_) => DType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostBuffer::F32(v) => v.len(),
            HostBuffer::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            HostBuffer::F32(v) => bytemuck::cast_slice(v),
            HostBuffer::I32(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            HostBuffer::F32(v) => bytemuck::cast_slice_mut(v),
            HostBuffer::I32(v) => bytemuck::cast_slice_mut(v),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fill {
    /// Every element is one; sums equal the element count.
    Ones,
    /// `(i + input) % 100 / 100`, the pattern the GPU matmul bench used.
    Ramp,
    Random { seed: u64 },
}

impl Default for Fill {
    fn default() -> Self {
        Fill::Random { seed: 42 }
    }
}

fn fill_values<T: Element>(len: usize, fill: Fill, input: usize) -> Vec<T> {
    match fill {
        Fill::Ones => vec![T::one(); len],
        Fill::Ramp => (0..len)
            .map(|i| T::from_unit(((i + input) % 100) as f64 / 100.0))
            .collect(),
        Fill::Random { seed } => {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(input as u64));
            (0..len).map(|_| T::from_unit(rng.gen::<f64>())).collect()
        }
    }
}

/// Owns the input operands of one run. Backends only ever borrow it.
#[derive(Clone, Debug)]
pub struct HostBufferStore {
    dtype: DType,
    inputs: Vec<HostBuffer>,
}

impl HostBufferStore {
    pub fn populate(problem: &ProblemDescriptor, fill: Fill) -> Self {
        let inputs = problem
            .input_lens()
            .into_iter()
            .enumerate()
            .map(|(idx, len)| match problem.dtype() {
                DType::F32 => f32::into_buffer(fill_values::<f32>(len, fill, idx)),
                DType::I32 => i32::into_buffer(fill_values::<i32>(len, fill, idx)),
            })
            .collect();
        Self { dtype: problem.dtype(), inputs }
    }

    /// Wrap caller-provided operands, checking them against the problem.
    pub fn from_inputs(problem: &ProblemDescriptor, inputs: Vec<HostBuffer>) -> Result<Self> {
        let lens = problem.input_lens();
        if lens.len() != inputs.len() {
            return Err(Error::InvalidProblem(format!(
                "{} expects {} inputs, got {}",
                problem.label(),
                lens.len(),
                inputs.len()
            )));
        }
        for (idx, (buf, &len)) in inputs.iter().zip(lens.iter()).enumerate() {
            if buf.dtype() != problem.dtype() || buf.len() != len {
                return Err(Error::InvalidProblem(format!(
                    "input {} is {} x {}, expected {} x {}",
                    idx,
                    buf.dtype().name(),
                    buf.len(),
                    problem.dtype().name(),
                    len
                )));
            }
        }
        Ok(Self { dtype: problem.dtype(), inputs })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn inputs(&self) -> &[HostBuffer] {
        &self.inputs
    }

    pub fn typed_inputs<T: Element>(&self) -> Result<Vec<&[T]>> {
        self.inputs
            .iter()
            .map(|buf| {
                T::slice(buf).ok_or_else(|| {
                    Error::InvalidProblem(format!(
                        "input holds {} but kernel runs over {}",
                        buf.dtype().name(),
                        T::DTYPE.name()
                    ))
                })
            })
            .collect()
    }
}
