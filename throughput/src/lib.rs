pub use throughput_types::{
    Chunk, DType, DeviceClass, IndexSpace, KernelParam, KernelProgram, KernelSignature,
    Operation, ParamKind, ParamRole, ProblemDescriptor, RecordClass, RecordStatus, ReportRecord,
    RunReport, Shape, Throughput, TimingSample, VerificationOutcome,
};

pub mod backend;
pub mod buffers;
pub mod config;
pub mod device;
pub mod element;
pub mod partition;
pub mod runner;
pub mod timer;
pub mod verify;

pub use crate::backend::{Backend, Execution, KernelOutput, SerialBackend, ThreadPoolBackend};
pub use crate::buffers::{Fill, HostBuffer, HostBufferStore};
pub use crate::config::{DeviceApiChoice, DeviceConfig, Profile, RunConfig};
pub use crate::device::{DeviceBackend, KernelSupplier, Lifecycle};
pub use crate::element::{Element, ScalarValue};
pub use crate::partition::partition;
pub use crate::runner::Runner;
pub use crate::timer::{Stopwatch, Timer};
pub use crate::verify::{verify, verify_scalar};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid partition: {0}")]
    InvalidPartition(String),
    #[error("failed to launch worker {worker_id}: {source}")]
    WorkerLaunchError {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("no compute platform found")]
    NoPlatformFound,
    #[error("no {0:?} device found on any platform")]
    NoMatchingDevice(DeviceClass),
    #[error("program build failed:\n{0}")]
    BuildError(String),
    #[error("kernel argument mismatch: {0}")]
    KernelArgMismatch(String),
    #[error("transfer failed: {0}")]
    TransferError(String),
    #[error("kernel execution failed: {0}")]
    ExecutionError(String),
    #[error("monotonic clock unavailable: {0}")]
    ClockUnavailable(String),
    #[error("invalid problem: {0}")]
    InvalidProblem(String),
    #[error("device context creation failed: {0}")]
    ContextError(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Variant name, as written into failed report records.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidPartition(_) => "InvalidPartition",
            Error::WorkerLaunchError { .. } => "WorkerLaunchError",
            Error::NoPlatformFound => "NoPlatformFound",
            Error::NoMatchingDevice(_) => "NoMatchingDevice",
            Error::BuildError(_) => "BuildError",
            Error::KernelArgMismatch(_) => "KernelArgMismatch",
            Error::TransferError(_) => "TransferError",
            Error::ExecutionError(_) => "ExecutionError",
            Error::ClockUnavailable(_) => "ClockUnavailable",
            Error::InvalidProblem(_) => "InvalidProblem",
            Error::ContextError(_) => "ContextError",
            Error::Config(_) => "Config",
        }
    }

    /// Configuration-level errors abort the whole run. Everything else only
    /// fails the backend that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidPartition(_)
                | Error::ClockUnavailable(_)
                | Error::InvalidProblem(_)
                | Error::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
