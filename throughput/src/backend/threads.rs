use std::thread;

use tracing::{debug, info_span, warn};

use super::{matmul_rows_into, vector_add_into, Backend, Execution, KernelOutput};
use crate::buffers::HostBufferStore;
use crate::element::{Element, ScalarValue};
use crate::partition::partition;
use crate::timer::Timer;
use crate::{Chunk, DType, Error, Operation, ProblemDescriptor, Result, Shape};

const WORKER_PREFIX: &str = "bench-worker";

/// Fork/join over plain OS threads. Every run spawns one worker per chunk
/// and joins them all before returning; nothing outlives `execute`.
#[derive(Debug, Clone)]
pub struct ThreadPoolBackend {
    label: String,
    workers: usize,
    stack_size: Option<usize>,
}

impl ThreadPoolBackend {
    pub fn new(workers: usize, max_workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::InvalidPartition("worker count must be at least 1".into()));
        }
        if max_workers == 0 {
            return Err(Error::InvalidPartition("max_workers must be at least 1".into()));
        }
        let workers = if workers > max_workers {
            warn!(requested = workers, max_workers, "clamping worker count");
            max_workers
        } else {
            workers
        };
        Ok(Self {
            label: format!("threads x{}", workers),
            workers,
            stack_size: None,
        })
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Spawn one named thread per job inside a scope. If a spawn fails the
    /// scope still joins the workers already running before the error
    /// is returned.
    fn fork_join<'env, F>(&self, jobs: Vec<F>) -> Result<()>
    where
        F: FnOnce() + Send + 'env,
    {
        thread::scope(|scope| {
            for (worker_id, job) in jobs.into_iter().enumerate() {
                let mut builder =
                    thread::Builder::new().name(format!("{}-{}", WORKER_PREFIX, worker_id));
                if let Some(bytes) = self.stack_size {
                    builder = builder.stack_size(bytes);
                }
                builder
                    .spawn_scoped(scope, job)
                    .map_err(|source| Error::WorkerLaunchError { worker_id, source })?;
                debug!(worker_id, "worker_spawned");
            }
            Ok(())
        })
    }

    fn sum<T: Element>(&self, chunks: &[Chunk], data: &[T]) -> Result<ScalarValue> {
        let mut partials = vec![T::zero_sum(); chunks.len()];
        let jobs = chunks
            .iter()
            .zip(partials.iter_mut())
            .map(|(chunk, slot)| {
                let part = &data[chunk.start..chunk.end];
                move || *slot = T::sum(part)
            })
            .collect();
        self.fork_join(jobs)?;
        Ok(partials.into_iter().fold(T::zero_sum(), ScalarValue::combine))
    }

    fn vector_add<T: Element>(&self, chunks: &[Chunk], a: &[T], b: &[T], out: &mut [T]) -> Result<()> {
        let jobs = chunks
            .iter()
            .zip(split_disjoint(out, chunks, 1))
            .map(|(chunk, dst)| {
                let (a, b) = (&a[chunk.start..chunk.end], &b[chunk.start..chunk.end]);
                move || vector_add_into(a, b, dst)
            })
            .collect();
        self.fork_join(jobs)
    }

    fn matmul<T: Element>(
        &self,
        chunks: &[Chunk],
        a: &[T],
        b: &[T],
        out: &mut [T],
        n: usize,
        k: usize,
    ) -> Result<()> {
        let jobs = chunks
            .iter()
            .zip(split_disjoint(out, chunks, n))
            .map(|(chunk, rows)| {
                let row_start = chunk.start;
                move || matmul_rows_into(a, b, rows, row_start, n, k)
            })
            .collect();
        self.fork_join(jobs)
    }

    fn run<T: Element>(
        &self,
        problem: &ProblemDescriptor,
        inputs: &HostBufferStore,
        timer: &Timer,
    ) -> Result<Execution> {
        let operands = inputs.typed_inputs::<T>()?;
        let units = problem.work_units();
        let workers = self.workers.min(units);
        let _span = info_span!("thread_pool", workers, problem = %problem.label()).entered();

        let watch = timer.start();
        let output = match (problem.operation(), problem.shape()) {
            (Operation::Sum, _) if workers == 0 => KernelOutput::Scalar(T::zero_sum()),
            (Operation::Sum, _) => {
                let chunks = partition(units, workers)?;
                KernelOutput::Scalar(self.sum(&chunks, operands[0])?)
            }
            (Operation::VectorAdd, _) => {
                let mut out = vec![T::default(); problem.output_len()];
                if workers > 0 {
                    let chunks = partition(units, workers)?;
                    self.vector_add(&chunks, operands[0], operands[1], &mut out)?;
                }
                KernelOutput::Buffer(T::into_buffer(out))
            }
            (Operation::MatMul, Shape::Matrix { n, k, .. }) => {
                let mut out = vec![T::default(); problem.output_len()];
                if workers > 0 {
                    let chunks = partition(units, workers)?;
                    self.matmul(&chunks, operands[0], operands[1], &mut out, n, k)?;
                }
                KernelOutput::Buffer(T::into_buffer(out))
            }
            (Operation::MatMul, Shape::Elements { .. }) => {
                return Err(Error::InvalidProblem(format!(
                    "{} needs matrix dimensions",
                    problem.label()
                )))
            }
        };
        let elapsed = watch.stop(&self.label);
        Ok(Execution { output, elapsed, phases: Vec::new() })
    }
}

/// Carve `out` into one exclusive slice per chunk, `stride` elements per
/// work unit.
fn split_disjoint<'a, T>(mut out: &'a mut [T], chunks: &[Chunk], stride: usize) -> Vec<&'a mut [T]> {
    let mut parts = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let (head, tail) = std::mem::take(&mut out).split_at_mut(chunk.len() * stride);
        parts.push(head);
        out = tail;
    }
    parts
}

impl Backend for ThreadPoolBackend {
    fn label(&self) -> &str {
        &self.label
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::{Fill, HostBuffer};

    fn run(backend: &mut ThreadPoolBackend, p: &ProblemDescriptor, fill: Fill) -> Result<Execution> {
        let store = HostBufferStore::populate(p, fill);
        backend.execute(p, &store, &Timer::new().unwrap())
    }

    #[test]
    fn test_million_ones_on_eight_workers() {
        let mut pool = ThreadPoolBackend::new(8, 16).unwrap();
        let exec = run(&mut pool, &ProblemDescriptor::sum(1_000_000, DType::I32), Fill::Ones).unwrap();
        assert_eq!(exec.output, KernelOutput::Scalar(ScalarValue::Int(1_000_000)));
    }

    #[test]
    fn test_int_sum_matches_sequential() {
        let p = ProblemDescriptor::sum(10_007, DType::I32);
        let store = HostBufferStore::populate(&p, Fill::Random { seed: 3 });
        let expected = i32::sum(store.typed_inputs::<i32>().unwrap()[0]);
        for workers in [1, 2, 3, 7, 16] {
            let mut pool = ThreadPoolBackend::new(workers, 16).unwrap();
            let exec = pool.execute(&p, &store, &Timer::new().unwrap()).unwrap();
            assert_eq!(exec.output, KernelOutput::Scalar(expected), "workers={}", workers);
        }
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = ThreadPoolBackend::new(0, 16).unwrap_err();
        assert_eq!(err.kind(), "InvalidPartition");
    }

    #[test]
    fn test_clamps_to_max_workers() {
        let pool = ThreadPoolBackend::new(64, 4).unwrap();
        assert_eq!(pool.workers(), 4);
        assert_eq!(pool.label(), "threads x4");
    }

    #[test]
    fn test_more_workers_than_elements() {
        let mut pool = ThreadPoolBackend::new(8, 8).unwrap();
        let exec = run(&mut pool, &ProblemDescriptor::vector_add(3, DType::I32), Fill::Ones).unwrap();
        assert_eq!(exec.output, KernelOutput::Buffer(HostBuffer::I32(vec![2, 2, 2])));
    }

    #[test]
    fn test_empty_sum() {
        let mut pool = ThreadPoolBackend::new(4, 4).unwrap();
        let exec = run(&mut pool, &ProblemDescriptor::sum(0, DType::F32), Fill::Ones).unwrap();
        assert_eq!(exec.output, KernelOutput::Scalar(ScalarValue::Float(0.0)));
    }

    #[test]
    fn test_matmul_rows_split() {
        let p = ProblemDescriptor::matmul(5, 3, 4, DType::I32);
        let store = HostBufferStore::populate(&p, Fill::Random { seed: 11 });
        let reference = crate::SerialBackend.execute(&p, &store, &Timer::new().unwrap()).unwrap();
        let mut pool = ThreadPoolBackend::new(3, 8).unwrap();
        let exec = pool.execute(&p, &store, &Timer::new().unwrap()).unwrap();
        assert_eq!(exec.output, reference.output);
    }

    #[test]
    fn test_spawn_failure_reports_worker() {
        let mut pool = ThreadPoolBackend::new(2, 2).unwrap().with_stack_size(1 << 50);
        let err = run(&mut pool, &ProblemDescriptor::sum(100, DType::I32), Fill::Ones).unwrap_err();
        assert_eq!(err.kind(), "WorkerLaunchError");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_workers_are_named_by_id() {
        let pool = ThreadPoolBackend::new(3, 4).unwrap();
        let names = std::sync::Mutex::new(Vec::new());
        let jobs: Vec<_> = (0..3)
            .map(|_| {
                let names = &names;
                move || names.lock().unwrap().push(thread::current().name().map(str::to_string))
            })
            .collect();
        pool.fork_join(jobs).unwrap();
        let mut names = names.into_inner().unwrap();
        names.sort();
        assert_eq!(
            names,
            ["bench-worker-0", "bench-worker-1", "bench-worker-2"].map(|n| Some(n.to_string()))
        );
    }
}
