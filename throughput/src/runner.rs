use tracing::{info, info_span, warn};

use crate::backend::{Backend, Execution, KernelOutput, SerialBackend, ThreadPoolBackend};
use crate::buffers::{HostBuffer, HostBufferStore};
use crate::config::{DeviceApiChoice, RunConfig};
use crate::device::{DeviceBackend, EmulatedApi, KernelSupplier, WgpuApi};
use crate::element::ScalarValue;
use crate::timer::Timer;
use crate::verify::{verify, verify_scalar};
use crate::{
    Error, ProblemDescriptor, RecordStatus, ReportRecord, Result, RunReport, Throughput,
    VerificationOutcome,
};

/// Drives problems through the serial reference and every configured
/// backend, one problem at a time.
pub struct Runner {
    config: RunConfig,
    timer: Timer,
    reference: SerialBackend,
    backends: Vec<Box<dyn Backend>>,
}

impl Runner {
    /// A runner with no backends besides the reference.
    pub fn new(config: RunConfig) -> Result<Self> {
        Self::with_timer(config, Timer::new()?)
    }

    pub fn with_timer(config: RunConfig, timer: Timer) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, timer, reference: SerialBackend, backends: Vec::new() })
    }

    /// The thread pool plus the device backend the config selects.
    pub fn from_config<K: KernelSupplier + 'static>(config: RunConfig, kernels: K) -> Result<Self> {
        let mut runner = Self::new(config)?;
        let cfg = &runner.config;
        let mut pool = ThreadPoolBackend::new(cfg.workers, cfg.max_workers)?;
        if let Some(bytes) = cfg.thread_stack_size {
            pool = pool.with_stack_size(bytes);
        }
        runner.backends.push(Box::new(pool));

        let class = cfg.device.class;
        match cfg.device.api {
            DeviceApiChoice::Wgpu => runner.backends.push(Box::new(DeviceBackend::new(
                WgpuApi::default(),
                kernels,
                class,
                "gpu (wgpu)",
            ))),
            DeviceApiChoice::Emulated => runner.backends.push(Box::new(DeviceBackend::new(
                EmulatedApi::single(class),
                kernels,
                class,
                "device (emulated)",
            ))),
            DeviceApiChoice::None => {}
        }
        Ok(runner)
    }

    pub fn with_backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn backend_labels(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.label()).collect()
    }

    /// Benchmark one problem. Backend errors become failed records; only
    /// fatal errors abort.
    pub fn run(&mut self, problem: &ProblemDescriptor) -> Result<RunReport> {
        if !problem.shape_fits() {
            return Err(Error::InvalidProblem(format!("{:?} does not fit its operation", problem)));
        }
        let _span = info_span!("run", problem = %problem.label()).entered();
        let rounds = self.config.rounds;
        let tolerance = self.config.tolerance;
        let inputs = HostBufferStore::populate(problem, self.config.fill);

        let sum_tolerance = reduction_bound(&inputs, tolerance);
        let reference = measure(&mut self.reference, problem, &inputs, &self.timer, rounds)?;
        info!(elapsed_ms = reference.elapsed.elapsed_ms, "reference_complete");

        let mut records = Vec::with_capacity(self.backends.len());
        for backend in self.backends.iter_mut() {
            let label = backend.label().to_string();
            let status = match measure(backend.as_mut(), problem, &inputs, &self.timer, rounds) {
                Ok(exec) => {
                    let verification =
                        check(&exec.output, &reference.output, tolerance, sum_tolerance);
                    if !verification.is_verified() {
                        warn!(
                            backend = %label,
                            matched = verification.matched,
                            compared = verification.compared,
                            "verification_mismatch"
                        );
                    }
                    RecordStatus::Completed {
                        elapsed_ms: exec.elapsed.elapsed_ms,
                        phases: exec.phases,
                        throughput: Throughput::measure(
                            problem,
                            exec.elapsed.elapsed_ms,
                            reference.elapsed.elapsed_ms,
                        ),
                        verification,
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(backend = %label, kind = err.kind(), %err, "backend_failed");
                    RecordStatus::Failed { error_kind: err.kind().to_string(), diagnostic: err.to_string() }
                }
            };
            records.push(ReportRecord { backend_label: label, status });
        }

        Ok(RunReport { problem: problem.clone(), reference: reference.elapsed, records })
    }

    /// Run problems in order, stopping at the first fatal error.
    pub fn sweep(&mut self, problems: &[ProblemDescriptor]) -> Result<Vec<RunReport>> {
        problems.iter().map(|p| self.run(p)).collect()
    }
}

/// Execute `rounds` times; report the last output with the median elapsed.
fn measure(
    backend: &mut dyn Backend,
    problem: &ProblemDescriptor,
    inputs: &HostBufferStore,
    timer: &Timer,
    rounds: usize,
) -> Result<Execution> {
    let mut samples = Vec::with_capacity(rounds);
    let mut last = None;
    for _ in 0..rounds.max(1) {
        let exec = backend.execute(problem, inputs, timer)?;
        samples.push(exec.elapsed.elapsed_ms);
        last = Some(exec);
    }
    let mut exec = last.ok_or_else(|| Error::Config("rounds must be at least 1".into()))?;
    exec.elapsed.elapsed_ms = median(&mut samples);
    Ok(exec)
}

fn median(samples: &mut [f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    samples[samples.len() / 2]
}

/// Rounding budget for a float reduction: one f32 epsilon of `sum |x|` per
/// level of a balanced summation tree, never below `tolerance`. Anything a
/// reordered sum cannot explain, such as a lost work-group, exceeds it.
fn reduction_bound(inputs: &HostBufferStore, tolerance: f64) -> f64 {
    match inputs.inputs().first() {
        Some(HostBuffer::F32(data)) if data.len() > 1 => {
            let magnitude: f64 = data.iter().map(|&x| (x as f64).abs()).sum();
            let depth = (data.len() as f64).log2().ceil();
            tolerance.max(f32::EPSILON as f64 * magnitude * depth)
        }
        _ => tolerance,
    }
}

/// Float scalars compare against `sum_tolerance`; buffers elementwise
/// against `tolerance`. Integers are exact either way.
fn check(
    output: &KernelOutput,
    reference: &KernelOutput,
    tolerance: f64,
    sum_tolerance: f64,
) -> VerificationOutcome {
    match (output, reference) {
        (KernelOutput::Scalar(c), KernelOutput::Scalar(r)) => {
            let bound = match r {
                ScalarValue::Float(_) => sum_tolerance,
                ScalarValue::Int(_) => tolerance,
            };
            verify_scalar(*c, *r, bound)
        }
        (KernelOutput::Buffer(c), KernelOutput::Buffer(r)) => verify(c, r, tolerance),
        (_, KernelOutput::Buffer(r)) => {
            VerificationOutcome { compared: r.len().max(1), matched: 0, tolerance }
        }
        (_, KernelOutput::Scalar(_)) => VerificationOutcome { compared: 1, matched: 0, tolerance },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&mut [5.0, 1.0, 3.0]), 3.0);
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), 3.0);
        assert_eq!(median(&mut []), 0.0);
    }

    #[test]
    fn test_float_sum_bound_follows_magnitude() {
        let problem = ProblemDescriptor::sum(1024, crate::DType::F32);
        let store = HostBufferStore::populate(&problem, crate::Fill::Ones);
        let bound = reduction_bound(&store, 1e-6);
        assert!((bound - f32::EPSILON as f64 * 1024.0 * 10.0).abs() < 1e-12);
        assert_eq!(reduction_bound(&store, 1.0), 1.0);

        let ints = HostBufferStore::populate(&ProblemDescriptor::sum(1024, crate::DType::I32), crate::Fill::Ones);
        assert_eq!(reduction_bound(&ints, 1e-3), 1e-3);
    }

    #[test]
    fn test_float_sum_records_bound() {
        let out = check(
            &KernelOutput::Scalar(ScalarValue::Float(1_000_000.5)),
            &KernelOutput::Scalar(ScalarValue::Float(1_000_000.0)),
            1e-3,
            2.0,
        );
        assert!(out.is_verified());
        assert_eq!(out.tolerance, 2.0);

        let out = check(
            &KernelOutput::Scalar(ScalarValue::Float(999_500.0)),
            &KernelOutput::Scalar(ScalarValue::Float(1_000_000.0)),
            1e-3,
            2.0,
        );
        assert!(!out.is_verified());
    }

    #[test]
    fn test_shape_disagreement_never_verifies() {
        let out = check(
            &KernelOutput::Scalar(ScalarValue::Int(4)),
            &KernelOutput::Buffer(HostBuffer::I32(vec![4, 4])),
            1e-3,
            1e-3,
        );
        assert_eq!((out.matched, out.compared), (0, 2));
    }

    #[test]
    fn test_rejects_misshapen_problem() {
        let mut runner = Runner::new(RunConfig::default()).unwrap();
        let bad = ProblemDescriptor::new(
            crate::Operation::MatMul,
            crate::Shape::Elements { count: 4 },
            crate::DType::F32,
        );
        let err = runner.run(&bad).unwrap_err();
        assert!(err.is_fatal());
    }
}
