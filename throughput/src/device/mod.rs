//! Kernel offload onto a compute device.
//!
//! A [`DeviceBackend`] owns no device state between runs. Each `execute`
//! discovers a platform, selects a device, builds the supplier's program,
//! uploads the operands, launches, reads back and tears everything down
//! again. Device handles are plain locals, so they are released in reverse
//! allocation order on every exit path, error or not.

mod api;
pub mod emulated;
pub mod wgpu_api;

pub use api::{dispatch_size, BufferAccess, ComputeApi, ComputeContext, DeviceInfo, KernelArg};
pub use emulated::{
    EmulatedApi, EmulatedDevice, EmulatedPlatform, Faults, LiveResources, Resource, ResourceLedger,
};
pub use wgpu_api::WgpuApi;

use tracing::{debug, info, info_span, warn};

use crate::backend::{Backend, Execution, KernelOutput};
use crate::buffers::{HostBuffer, HostBufferStore};
use crate::element::Element;
use crate::timer::Timer;
use crate::{
    DeviceClass, Error, KernelProgram, KernelSignature, Operation, ParamKind, ParamRole,
    ProblemDescriptor, Result, Shape,
};

/// States a device run passes through, in order. A failed run jumps from
/// wherever it stopped straight to `TornDown`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Uninitialized,
    PlatformDiscovered,
    DeviceSelected,
    ContextCreated,
    ProgramBuilt,
    BuffersAllocated,
    Executing,
    ResultsRead,
    TornDown,
}

/// Source of device programs. The harness treats the source text as opaque
/// and only relies on the declared signature.
pub trait KernelSupplier {
    fn program(&self, problem: &ProblemDescriptor) -> Result<KernelProgram>;
}

/// Parameter list every program for `problem` must declare, in binding order.
pub fn calling_convention(problem: &ProblemDescriptor) -> Vec<(ParamRole, ParamKind)> {
    let buf = ParamKind::Buffer(problem.dtype());
    match problem.operation() {
        Operation::Sum => vec![
            (ParamRole::Input, buf),
            (ParamRole::Output, buf),
            (ParamRole::Scalar, ParamKind::U32),
        ],
        Operation::VectorAdd => vec![
            (ParamRole::Input, buf),
            (ParamRole::Input, buf),
            (ParamRole::Output, buf),
            (ParamRole::Scalar, ParamKind::U32),
        ],
        Operation::MatMul => vec![
            (ParamRole::Scalar, ParamKind::U32),
            (ParamRole::Scalar, ParamKind::U32),
            (ParamRole::Scalar, ParamKind::U32),
            (ParamRole::Input, buf),
            (ParamRole::Input, buf),
            (ParamRole::Output, buf),
        ],
    }
}

fn check_signature(problem: &ProblemDescriptor, signature: &KernelSignature) -> Result<()> {
    let expected = calling_convention(problem);
    if signature.params.len() != expected.len() {
        return Err(Error::KernelArgMismatch(format!(
            "`{}` declares {} parameters, {} takes {}",
            signature.entry_point,
            signature.params.len(),
            problem.operation().entry_point(),
            expected.len()
        )));
    }
    for (idx, (param, (role, kind))) in signature.params.iter().zip(expected).enumerate() {
        if param.role != role || param.kind != kind {
            return Err(Error::KernelArgMismatch(format!(
                "parameter {} (`{}`) is {:?} {:?}, expected {:?} {:?}",
                idx, param.name, param.role, param.kind, role, kind
            )));
        }
    }
    Ok(())
}

fn scalar_args(problem: &ProblemDescriptor) -> Result<Vec<u32>> {
    let dims = match problem.shape() {
        Shape::Elements { count } => vec![count],
        Shape::Matrix { m, n, k } => vec![m, n, k],
    };
    dims.into_iter()
        .map(|d| {
            u32::try_from(d).map_err(|_| {
                Error::KernelArgMismatch(format!("dimension {} does not fit a u32 argument", d))
            })
        })
        .collect()
}

/// Number of elements the device writes into the output buffer. Reductions
/// produce one partial per work-group.
fn device_output_len(problem: &ProblemDescriptor, workgroup: [u32; 2]) -> usize {
    match problem.operation() {
        Operation::Sum => problem.work_units().div_ceil(workgroup[0].max(1) as usize),
        _ => problem.output_len(),
    }
}

fn combine_partials(partials: &HostBuffer) -> KernelOutput {
    match partials {
        HostBuffer::F32(v) => KernelOutput::Scalar(f32::sum(v)),
        HostBuffer::I32(v) => KernelOutput::Scalar(i32::sum(v)),
    }
}

pub struct DeviceBackend<A, K> {
    api: A,
    kernels: K,
    class: DeviceClass,
    label: String,
    trail: Vec<Lifecycle>,
}

impl<A: ComputeApi, K: KernelSupplier> DeviceBackend<A, K> {
    pub fn new(api: A, kernels: K, class: DeviceClass, label: &str) -> Self {
        Self {
            api,
            kernels,
            class,
            label: label.to_string(),
            trail: vec![Lifecycle::Uninitialized],
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// States visited by the most recent run.
    pub fn last_transitions(&self) -> &[Lifecycle] {
        &self.trail
    }

    fn advance(&mut self, next: Lifecycle) {
        debug!(from = ?self.trail.last(), to = ?next, "device_transition");
        self.trail.push(next);
    }

    fn select_device(&mut self) -> Result<A::Device> {
        let platforms = self.api.platforms()?;
        if platforms.is_empty() {
            return Err(Error::NoPlatformFound);
        }
        self.advance(Lifecycle::PlatformDiscovered);

        for platform in &platforms {
            match self.api.devices(platform, self.class) {
                Ok(devices) => {
                    if let Some(device) = devices.into_iter().next() {
                        let info = self.api.device_info(&device);
                        info!(
                            platform = %self.api.platform_name(platform),
                            device = %info.name,
                            class = ?info.class,
                            "device_selected"
                        );
                        self.advance(Lifecycle::DeviceSelected);
                        return Ok(device);
                    }
                }
                Err(err) => {
                    warn!(platform = %self.api.platform_name(platform), %err, "skipping platform");
                }
            }
        }
        Err(Error::NoMatchingDevice(self.class))
    }

    fn run(
        &mut self,
        problem: &ProblemDescriptor,
        inputs: &HostBufferStore,
        timer: &Timer,
    ) -> Result<Execution> {
        if inputs.dtype() != problem.dtype() {
            return Err(Error::InvalidProblem(format!(
                "inputs hold {} but {} runs over {}",
                inputs.dtype().name(),
                problem.label(),
                problem.dtype().name()
            )));
        }
        let program = self.kernels.program(problem)?;
        check_signature(problem, &program.signature)?;
        let scalars = scalar_args(problem)?;

        let device = self.select_device()?;
        let mut ctx = self.api.create_context(device)?;
        self.advance(Lifecycle::ContextCreated);

        let built = ctx.build_program(&program.source)?;
        let kernel = ctx.create_kernel(&built, &program.signature, program.workgroup)?;
        self.advance(Lifecycle::ProgramBuilt);

        let elem = problem.dtype().size_bytes();
        let mut input_bufs = Vec::with_capacity(inputs.inputs().len());
        for host in inputs.inputs() {
            input_bufs.push(ctx.create_buffer(host.len() * elem, BufferAccess::ReadOnly)?);
        }
        let mut result = HostBuffer::zeroed(problem.dtype(), device_output_len(problem, program.workgroup));
        let output_buf = ctx.create_buffer(result.len() * elem, BufferAccess::WriteOnly)?;
        self.advance(Lifecycle::BuffersAllocated);

        let mut ins = input_bufs.iter();
        let mut dims = scalars.iter();
        let args = program
            .signature
            .params
            .iter()
            .map(|param| {
                let arg = match param.role {
                    ParamRole::Input => ins.next().map(KernelArg::Buffer),
                    ParamRole::Output => Some(KernelArg::Buffer(&output_buf)),
                    ParamRole::Scalar => dims.next().map(|&d| KernelArg::U32(d)),
                };
                arg.ok_or_else(|| {
                    Error::KernelArgMismatch(format!("nothing to bind to parameter `{}`", param.name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.advance(Lifecycle::Executing);
        let mut watch = timer.start();
        for (buf, host) in input_bufs.iter().zip(inputs.inputs()) {
            if !host.is_empty() {
                ctx.write_buffer(buf, host.as_bytes())?;
            }
        }
        let upload = watch.lap("upload");
        ctx.enqueue_kernel(&kernel, &args, problem.index_space())?;
        ctx.finish()?;
        let launch = watch.lap("kernel");
        ctx.read_buffer(&output_buf, result.as_bytes_mut())?;
        let readback = watch.lap("readback");
        let elapsed = watch.stop(&self.label);
        self.advance(Lifecycle::ResultsRead);

        let output = match problem.operation() {
            Operation::Sum => combine_partials(&result),
            _ => KernelOutput::Buffer(result),
        };
        Ok(Execution { output, elapsed, phases: vec![upload, launch, readback] })
    }
}

impl<A: ComputeApi, K: KernelSupplier> Backend for DeviceBackend<A, K> {
    fn label(&self) -> &str {
        &self.label
    }

    fn execute(
        &mut self,
        problem: &ProblemDescriptor,
        inputs: &HostBufferStore,
        timer: &Timer,
    ) -> Result<Execution> {
        let span = info_span!("device_run", backend = %self.label, problem = %problem.label());
        let _guard = span.enter();
        self.trail.clear();
        self.trail.push(Lifecycle::Uninitialized);
        let result = self.run(problem, inputs, timer);
        self.advance(Lifecycle::TornDown);
        if let Err(err) = &result {
            debug!(kind = err.kind(), "device_run_failed");
        }
        result
    }
}
