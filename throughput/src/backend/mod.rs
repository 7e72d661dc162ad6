mod kernels;
mod serial;
mod threads;

pub use serial::SerialBackend;
pub use threads::ThreadPoolBackend;

pub(crate) use kernels::{matmul_rows_into, vector_add_into};

use crate::buffers::{HostBuffer, HostBufferStore};
use crate::element::ScalarValue;
use crate::timer::Timer;
use crate::{ProblemDescriptor, Result, TimingSample};

#[derive(Clone, Debug, PartialEq)]
pub enum KernelOutput {
    Scalar(ScalarValue),
    Buffer(HostBuffer),
}

/// Result of one backend invocation. `elapsed` brackets dispatch to
/// completion only; `phases` splits it where the backend can.
#[derive(Clone, Debug)]
pub struct Execution {
    pub output: KernelOutput,
    pub elapsed: TimingSample,
    pub phases: Vec<TimingSample>,
}

/// A pluggable execution strategy for the three kernels.
pub trait Backend {
    fn label(&self) -> &str;

    fn execute(
        &mut self,
        problem: &ProblemDescriptor,
        inputs: &HostBufferStore,
        timer: &Timer,
    ) -> Result<Execution>;
}
