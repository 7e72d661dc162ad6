use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Sum,
    VectorAdd,
    MatMul,
}

impl Operation {
    /// Entry point name every kernel supplier must export for this operation.
    pub fn entry_point(&self) -> &'static str {
        match self {
            Operation::Sum => "sum",
            Operation::VectorAdd => "vector_add",
            Operation::MatMul => "matmul",
        }
    }

    fn short_name(&self) -> &'static str {
        match self {
            Operation::Sum => "Sum",
            Operation::VectorAdd => "VecAdd",
            Operation::MatMul => "MatMul",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    I32,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        4
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shape {
    Elements { count: usize },
    /// C (m x n) = A (m x k) * B (k x n), row-major.
    Matrix { m: usize, n: usize, k: usize },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexSpace {
    D1(usize),
    D2(usize, usize),
}

impl IndexSpace {
    pub fn total(&self) -> usize {
        match *self {
            IndexSpace::D1(x) => x,
            IndexSpace::D2(x, y) => x * y,
        }
    }
}

/// One benchmark instance. Fields are private so a descriptor cannot change
/// once the runner holds it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProblemDescriptor {
    operation: Operation,
    shape: Shape,
    dtype: DType,
}

impl ProblemDescriptor {
    pub fn new(operation: Operation, shape: Shape, dtype: DType) -> Self {
        Self { operation, shape, dtype }
    }

    pub fn sum(count: usize, dtype: DType) -> Self {
        Self::new(Operation::Sum, Shape::Elements { count }, dtype)
    }

    pub fn vector_add(count: usize, dtype: DType) -> Self {
        Self::new(Operation::VectorAdd, Shape::Elements { count }, dtype)
    }

    pub fn matmul(m: usize, n: usize, k: usize, dtype: DType) -> Self {
        Self::new(Operation::MatMul, Shape::Matrix { m, n, k }, dtype)
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Reductions and element-wise kernels take a flat element count,
    /// matmul takes matrix dimensions.
    pub fn shape_fits(&self) -> bool {
        matches!(
            (self.operation, self.shape),
            (Operation::Sum, Shape::Elements { .. })
                | (Operation::VectorAdd, Shape::Elements { .. })
                | (Operation::MatMul, Shape::Matrix { .. })
        )
    }

    /// Number of elements the kernel produces or consumes per input.
    pub fn element_count(&self) -> usize {
        match self.shape {
            Shape::Elements { count } => count,
            Shape::Matrix { m, n, .. } => m * n,
        }
    }

    /// Lengths of the input operands, in argument order.
    pub fn input_lens(&self) -> Vec<usize> {
        match (self.operation, self.shape) {
            (Operation::Sum, Shape::Elements { count }) => vec![count],
            (Operation::VectorAdd, Shape::Elements { count }) => vec![count, count],
            (_, Shape::Matrix { m, n, k }) => vec![m * k, k * n],
            (_, Shape::Elements { count }) => vec![count],
        }
    }

    /// Length of the full output buffer. A reduction produces a scalar.
    pub fn output_len(&self) -> usize {
        match self.operation {
            Operation::Sum => 1,
            _ => self.element_count(),
        }
    }

    /// Independent units a host worker can own: elements, or rows of C.
    pub fn work_units(&self) -> usize {
        match self.shape {
            Shape::Elements { count } => count,
            Shape::Matrix { m, .. } => m,
        }
    }

    pub fn index_space(&self) -> IndexSpace {
        match self.shape {
            Shape::Elements { count } => IndexSpace::D1(count),
            Shape::Matrix { m, n, .. } => IndexSpace::D2(m, n),
        }
    }

    pub fn flops(&self) -> f64 {
        match self.shape {
            Shape::Elements { count } => count as f64,
            Shape::Matrix { m, n, k } => 2.0 * m as f64 * n as f64 * k as f64,
        }
    }

    pub fn label(&self) -> String {
        let dims = match self.shape {
            Shape::Elements { count } => format_count(count),
            Shape::Matrix { m, n, k } if m == n && n == k => format!("{}x{}", m, n),
            Shape::Matrix { m, n, k } => format!("{}x{}x{}", m, n, k),
        };
        match self.dtype {
            DType::F32 => format!("{} ({})", self.operation.short_name(), dims),
            other => format!("{} {} ({})", self.operation.short_name(), other.name(), dims),
        }
    }
}

pub fn format_count(n: usize) -> String {
    if n >= 1_000_000 && n % 1_000_000 == 0 {
        format!("{}M", n / 1_000_000)
    } else if n >= 1_000 && n % 1_000 == 0 {
        format!("{}K", n / 1_000)
    } else {
        format!("{}", n)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub start: usize,
    pub end: usize,
    pub worker_id: usize,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Gpu,
    /// A GPU or any other non-CPU accelerator.
    Accelerator,
    Cpu,
    Any,
}

impl DeviceClass {
    pub fn accepts(&self, device: DeviceClass) -> bool {
        match self {
            DeviceClass::Any => true,
            DeviceClass::Accelerator => {
                matches!(device, DeviceClass::Gpu | DeviceClass::Accelerator)
            }
            wanted => *wanted == device,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamRole {
    Input,
    Output,
    Scalar,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Buffer(DType),
    U32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelParam {
    pub name: String,
    pub role: ParamRole,
    pub kind: ParamKind,
}

impl KernelParam {
    pub fn input(name: &str, dtype: DType) -> Self {
        Self { name: name.into(), role: ParamRole::Input, kind: ParamKind::Buffer(dtype) }
    }

    pub fn output(name: &str, dtype: DType) -> Self {
        Self { name: name.into(), role: ParamRole::Output, kind: ParamKind::Buffer(dtype) }
    }

    pub fn scalar(name: &str) -> Self {
        Self { name: name.into(), role: ParamRole::Scalar, kind: ParamKind::U32 }
    }
}

/// Declared parameter list of a compiled entry point, in binding order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSignature {
    pub entry_point: String,
    pub params: Vec<KernelParam>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelProgram {
    pub source: String,
    pub signature: KernelSignature,
    /// Work-group size compiled into the program (x, y).
    pub workgroup: [u32; 2],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimingSample {
    pub label: String,
    pub elapsed_ms: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub compared: usize,
    pub matched: usize,
    pub tolerance: f64,
}

impl VerificationOutcome {
    /// Every compared element matched. Vacuously true for `0/0`.
    pub fn is_verified(&self) -> bool {
        self.matched == self.compared
    }

    pub fn ratio(&self) -> f64 {
        if self.compared == 0 {
            1.0
        } else {
            self.matched as f64 / self.compared as f64
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub gflops: f64,
    pub elements_per_sec: f64,
    /// Reference time divided by backend time.
    pub speedup: f64,
}

impl Throughput {
    pub fn measure(problem: &ProblemDescriptor, elapsed_ms: f64, reference_ms: f64) -> Self {
        let secs = elapsed_ms / 1000.0;
        if secs <= 0.0 {
            return Self { gflops: 0.0, elements_per_sec: 0.0, speedup: 0.0 };
        }
        Self {
            gflops: problem.flops() / secs / 1e9,
            elements_per_sec: problem.element_count() as f64 / secs,
            speedup: reference_ms / elapsed_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Completed {
        elapsed_ms: f64,
        phases: Vec<TimingSample>,
        throughput: Throughput,
        verification: VerificationOutcome,
    },
    Failed {
        error_kind: String,
        diagnostic: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordClass {
    Verified,
    /// Ran to completion but the result disagrees with the reference.
    Mismatch,
    /// Never produced a result.
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub backend_label: String,
    pub status: RecordStatus,
}

impl ReportRecord {
    pub fn class(&self) -> RecordClass {
        match &self.status {
            RecordStatus::Completed { verification, .. } if verification.is_verified() => {
                RecordClass::Verified
            }
            RecordStatus::Completed { .. } => RecordClass::Mismatch,
            RecordStatus::Failed { .. } => RecordClass::Failed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub problem: ProblemDescriptor,
    pub reference: TimingSample,
    pub records: Vec<ReportRecord>,
}

impl RunReport {
    pub fn record(&self, backend_label: &str) -> Option<&ReportRecord> {
        self.records.iter().find(|r| r.backend_label == backend_label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_derived_sizes() {
        let p = ProblemDescriptor::matmul(4, 3, 2, DType::F32);
        assert_eq!(p.input_lens(), vec![8, 6]);
        assert_eq!(p.output_len(), 12);
        assert_eq!(p.work_units(), 4);
        assert_eq!(p.index_space(), IndexSpace::D2(4, 3));
        assert_eq!(p.flops(), 48.0);
        assert_eq!(p.label(), "MatMul (4x3x2)");
    }

    #[test]
    fn test_shape_fits() {
        assert!(ProblemDescriptor::sum(10, DType::I32).shape_fits());
        let bad = ProblemDescriptor::new(
            Operation::MatMul,
            Shape::Elements { count: 16 },
            DType::F32,
        );
        assert!(!bad.shape_fits());
    }

    #[test]
    fn test_labels() {
        assert_eq!(ProblemDescriptor::sum(1_000_000, DType::F32).label(), "Sum (1M)");
        assert_eq!(ProblemDescriptor::sum(1_000_000, DType::I32).label(), "Sum i32 (1M)");
        assert_eq!(ProblemDescriptor::vector_add(1024, DType::F32).label(), "VecAdd (1024)");
        assert_eq!(ProblemDescriptor::matmul(256, 256, 256, DType::F32).label(), "MatMul (256x256)");
    }

    #[test]
    fn test_empty_verification_is_verified() {
        let v = VerificationOutcome { compared: 0, matched: 0, tolerance: 1e-3 };
        assert!(v.is_verified());
        assert_eq!(v.ratio(), 1.0);
    }

    #[test]
    fn test_device_class_accepts() {
        assert!(DeviceClass::Accelerator.accepts(DeviceClass::Gpu));
        assert!(!DeviceClass::Accelerator.accepts(DeviceClass::Cpu));
        assert!(DeviceClass::Any.accepts(DeviceClass::Cpu));
        assert!(!DeviceClass::Gpu.accepts(DeviceClass::Accelerator));
    }

    #[test]
    fn test_record_class() {
        let completed = |matched| ReportRecord {
            backend_label: "threads".into(),
            status: RecordStatus::Completed {
                elapsed_ms: 1.0,
                phases: vec![],
                throughput: Throughput { gflops: 0.0, elements_per_sec: 0.0, speedup: 1.0 },
                verification: VerificationOutcome { compared: 4, matched, tolerance: 0.0 },
            },
        };
        assert_eq!(completed(4).class(), RecordClass::Verified);
        assert_eq!(completed(3).class(), RecordClass::Mismatch);
        let failed = ReportRecord {
            backend_label: "gpu".into(),
            status: RecordStatus::Failed {
                error_kind: "NoPlatformFound".into(),
                diagnostic: "no compute platform".into(),
            },
        };
        assert_eq!(failed.class(), RecordClass::Failed);
    }

    #[test]
    fn test_problem_json_shape() {
        let json = r#"{"operation":"mat_mul","shape":{"kind":"matrix","m":2,"n":2,"k":2},"dtype":"f32"}"#;
        let p: ProblemDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(p, ProblemDescriptor::matmul(2, 2, 2, DType::F32));
    }
}
