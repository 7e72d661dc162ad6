use tracing::debug;

use super::{matmul_rows_into, vector_add_into, Backend, Execution, KernelOutput};
use crate::buffers::HostBufferStore;
use crate::element::Element;
use crate::timer::Timer;
use crate::{DType, Operation, ProblemDescriptor, Result, Shape};

/// Single-threaded reference every other backend is verified against.
#[derive(Debug, Default)]
pub struct SerialBackend;

impl SerialBackend {
    fn run<T: Element>(
        &self,
        problem: &ProblemDescriptor,
        inputs: &HostBufferStore,
        timer: &Timer,
    ) -> Result<Execution> {
        let operands = inputs.typed_inputs::<T>()?;
        let watch = timer.start();
        let output = match (problem.operation(), problem.shape()) {
            (Operation::Sum, _) => KernelOutput::Scalar(T::sum(operands[0])),
            (Operation::VectorAdd, _) => {
                let mut out = vec![T::default(); problem.output_len()];
                vector_add_into(operands[0], operands[1], &mut out);
                KernelOutput::Buffer(T::into_buffer(out))
            }
            (Operation::MatMul, Shape::Matrix { n, k, .. }) => {
                let mut out = vec![T::default(); problem.output_len()];
                matmul_rows_into(operands[0], operands[1], &mut out, 0, n, k);
                KernelOutput::Buffer(T::into_buffer(out))
            }
            (Operation::MatMul, Shape::Elements { .. }) => {
                return Err(crate::Error::InvalidProblem(format!(
                    "{} needs matrix dimensions",
                    problem.label()
                )))
            }
        };
        let elapsed = watch.stop(self.label());
        debug!(problem = %problem.label(), elapsed_ms = elapsed.elapsed_ms, "serial_reference_complete");
        Ok(Execution { output, elapsed, phases: Vec::new() })
    }
}

impl Backend for SerialBackend {
    fn label(&self) -> &str {
        "serial"
    }

    fn execute(
        &mut self,
        problem: &ProblemDescriptor,
        inputs: &HostBufferStore,
        timer: &Timer,
    ) -> Result<Execution> {
        match problem.dtype() {
            DType::F32 => self.run::<f32>(problem, inputs, timer),
            DType::I32 => self.run::<i32>(problem, inputs, timer),
        }
    }
}
