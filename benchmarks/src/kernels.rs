use throughput::{
    KernelParam, KernelProgram, KernelSignature, KernelSupplier, Operation, ProblemDescriptor,
    Result,
};

// Each workgroup of 256 reduces its slice to one partial; the host folds the
// partials. Workgroups past the X limit fold into Y, so the linear group id
// uses num_workgroups.x.
const WGSL_SUM: &str = r#"
@group(0) @binding(0) var<storage, read>       data: array<ELEM>;
@group(0) @binding(1) var<storage, read_write> partials: array<ELEM>;
@group(0) @binding(2) var<uniform>             count: u32;

var<workgroup> scratch: array<ELEM, 256>;

@compute @workgroup_size(256)
fn sum(@builtin(local_invocation_id) lid: vec3<u32>,
       @builtin(workgroup_id)        wgid: vec3<u32>,
       @builtin(num_workgroups)      groups: vec3<u32>) {
    let group = wgid.x + wgid.y * groups.x;
    let i = group * 256u + lid.x;
    var v = ELEM(0);
    if i < count { v = data[i]; }
    scratch[lid.x] = v;
    workgroupBarrier();
    var s = 128u;
    while s > 0u {
        if lid.x < s { scratch[lid.x] += scratch[lid.x + s]; }
        workgroupBarrier();
        s >>= 1u;
    }
    if lid.x == 0u && group < (count + 255u) / 256u { partials[group] = scratch[0]; }
}
"#;

const WGSL_VECTOR_ADD: &str = r#"
@group(0) @binding(0) var<storage, read>       a: array<ELEM>;
@group(0) @binding(1) var<storage, read>       b: array<ELEM>;
@group(0) @binding(2) var<storage, read_write> c: array<ELEM>;
@group(0) @binding(3) var<uniform>             count: u32;

@compute @workgroup_size(256)
fn vector_add(@builtin(global_invocation_id) gid: vec3<u32>,
              @builtin(num_workgroups)       groups: vec3<u32>) {
    let i = gid.x + gid.y * groups.x * 256u;
    if i < count { c[i] = a[i] + b[i]; }
}
"#;

// Row-major C (m x n) = A (m x k) * B (k x n); x walks columns, y walks rows.
const WGSL_MATMUL: &str = r#"
@group(0) @binding(0) var<uniform>             m: u32;
@group(0) @binding(1) var<uniform>             n: u32;
@group(0) @binding(2) var<uniform>             k: u32;
@group(0) @binding(3) var<storage, read>       a: array<ELEM>;
@group(0) @binding(4) var<storage, read>       b: array<ELEM>;
@group(0) @binding(5) var<storage, read_write> c: array<ELEM>;

@compute @workgroup_size(8, 8)
fn matmul(@builtin(global_invocation_id) gid: vec3<u32>) {
    let row = gid.y;
    let col = gid.x;
    if row >= m || col >= n { return; }
    var acc = ELEM(0);
    for (var p = 0u; p < k; p++) {
        acc += a[row * k + p] * b[p * n + col];
    }
    c[row * n + col] = acc;
}
"#;

/// WGSL programs for every operation, instantiated per element type.
#[derive(Copy, Clone, Debug, Default)]
pub struct WgslKernels;

impl KernelSupplier for WgslKernels {
    fn program(&self, problem: &ProblemDescriptor) -> Result<KernelProgram> {
        let dtype = problem.dtype();
        let op = problem.operation();
        let (template, params, workgroup) = match op {
            Operation::Sum => (
                WGSL_SUM,
                vec![
                    KernelParam::input("data", dtype),
                    KernelParam::output("partials", dtype),
                    KernelParam::scalar("count"),
                ],
                [256, 1],
            ),
            Operation::VectorAdd => (
                WGSL_VECTOR_ADD,
                vec![
                    KernelParam::input("a", dtype),
                    KernelParam::input("b", dtype),
                    KernelParam::output("c", dtype),
                    KernelParam::scalar("count"),
                ],
                [256, 1],
            ),
            Operation::MatMul => (
                WGSL_MATMUL,
                vec![
                    KernelParam::scalar("m"),
                    KernelParam::scalar("n"),
                    KernelParam::scalar("k"),
                    KernelParam::input("a", dtype),
                    KernelParam::input("b", dtype),
                    KernelParam::output("c", dtype),
                ],
                [8, 8],
            ),
        };
        Ok(KernelProgram {
            source: template.replace("ELEM", dtype.name()),
            signature: KernelSignature { entry_point: op.entry_point().to_string(), params },
            workgroup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use throughput::device::{calling_convention, EmulatedApi, WgpuApi};
    use throughput::{
        verify, verify_scalar, Backend, DType, DeviceBackend, DeviceClass, Error, Execution, Fill,
        HostBufferStore, KernelOutput, ScalarValue, SerialBackend, Timer,
    };

    /// The shipped program with one textual substitution.
    struct Patched {
        from: &'static str,
        to: &'static str,
    }

    impl KernelSupplier for Patched {
        fn program(&self, problem: &ProblemDescriptor) -> Result<KernelProgram> {
            let mut program = WgslKernels.program(problem)?;
            assert!(program.source.contains(self.from), "{} not in program", self.from);
            program.source = program.source.replacen(self.from, self.to, 1);
            Ok(program)
        }
    }

    /// Runs on the first wgpu adapter of any class. `None` when the host
    /// exposes no adapter at all.
    fn run_wgpu<K: KernelSupplier>(
        kernels: K,
        problem: &ProblemDescriptor,
        store: &HostBufferStore,
    ) -> Option<Result<Execution>> {
        let mut device = DeviceBackend::new(WgpuApi::default(), kernels, DeviceClass::Any, "gpu (wgpu)");
        match device.execute(problem, store, &Timer::new().unwrap()) {
            Err(Error::NoPlatformFound) | Err(Error::NoMatchingDevice(_)) => None,
            other => Some(other),
        }
    }

    fn serial(problem: &ProblemDescriptor, store: &HostBufferStore) -> KernelOutput {
        SerialBackend.execute(problem, store, &Timer::new().unwrap()).unwrap().output
    }

    fn problems() -> Vec<ProblemDescriptor> {
        vec![
            ProblemDescriptor::sum(1000, DType::F32),
            ProblemDescriptor::sum(1000, DType::I32),
            ProblemDescriptor::vector_add(1000, DType::F32),
            ProblemDescriptor::matmul(8, 12, 5, DType::I32),
        ]
    }

    #[test]
    fn test_signatures_follow_calling_convention() {
        for problem in problems() {
            let program = WgslKernels.program(&problem).unwrap();
            let declared: Vec<_> =
                program.signature.params.iter().map(|p| (p.role, p.kind)).collect();
            assert_eq!(declared, calling_convention(&problem), "{}", problem.label());
            assert!(program.source.contains(&format!("fn {}(", problem.operation().entry_point())));
            assert!(!program.source.contains("ELEM"));
        }
    }

    #[test]
    fn test_kernels_run_on_emulated_device() {
        let timer = Timer::new().unwrap();
        for problem in problems() {
            let store = HostBufferStore::populate(&problem, Fill::Ones);
            let mut device =
                DeviceBackend::new(EmulatedApi::single(DeviceClass::Gpu), WgslKernels, DeviceClass::Gpu, "emu");
            let got = device.execute(&problem, &store, &timer).unwrap();
            let want = SerialBackend.execute(&problem, &store, &timer).unwrap();
            assert_eq!(got.output, want.output, "{}", problem.label());
            assert_eq!(got.phases.len(), 3);
        }
    }

    #[test]
    fn test_sum_of_ones_counts_elements() {
        let problem = ProblemDescriptor::sum(70_000, DType::I32);
        let store = HostBufferStore::populate(&problem, Fill::Ones);
        let mut device =
            DeviceBackend::new(EmulatedApi::single(DeviceClass::Gpu), WgslKernels, DeviceClass::Gpu, "emu");
        let exec = device.execute(&problem, &store, &Timer::new().unwrap()).unwrap();
        assert_eq!(exec.output, KernelOutput::Scalar(ScalarValue::Int(70_000)));
    }

    #[test]
    fn test_wgpu_sum_folds_groups_into_y() {
        // More work-groups of 256 than the default per-dimension limit of 65535.
        let n = 256 * 65_535 + 4096;
        let problem = ProblemDescriptor::sum(n, DType::I32);
        let store = HostBufferStore::populate(&problem, Fill::Ones);
        let Some(result) = run_wgpu(WgslKernels, &problem, &store) else { return };
        let exec = result.unwrap();
        assert_eq!(exec.output, KernelOutput::Scalar(ScalarValue::Int(n as i64)));
        let labels: Vec<_> = exec.phases.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, ["upload", "kernel", "readback"]);
    }

    #[test]
    fn test_wgpu_float_sum_within_rounding() {
        let problem = ProblemDescriptor::sum(100_003, DType::F32);
        let store = HostBufferStore::populate(&problem, Fill::Random { seed: 3 });
        let Some(result) = run_wgpu(WgslKernels, &problem, &store) else { return };
        let (KernelOutput::Scalar(got), KernelOutput::Scalar(want)) = (result.unwrap().output, serial(&problem, &store)) else {
            panic!("sum must produce a scalar");
        };
        let bound = f32::EPSILON as f64 * want.as_f64().abs() * 17.0;
        assert!(verify_scalar(got, want, bound).is_verified(), "{:?} vs {:?}", got, want);
    }

    #[test]
    fn test_wgpu_elementwise_kernels_match_serial() {
        let problems = [
            ProblemDescriptor::vector_add(100_000, DType::F32),
            ProblemDescriptor::vector_add(100_000, DType::I32),
            ProblemDescriptor::matmul(33, 17, 9, DType::F32),
            ProblemDescriptor::matmul(33, 17, 9, DType::I32),
        ];
        for problem in problems {
            let store = HostBufferStore::populate(&problem, Fill::Random { seed: 11 });
            let Some(result) = run_wgpu(WgslKernels, &problem, &store) else { return };
            let (KernelOutput::Buffer(got), KernelOutput::Buffer(want)) = (result.unwrap().output, serial(&problem, &store)) else {
                panic!("{} must produce a buffer", problem.label());
            };
            let outcome = verify(&got, &want, 1e-3);
            assert_eq!(outcome.compared, problem.output_len());
            assert!(outcome.is_verified(), "{}: {}/{}", problem.label(), outcome.matched, outcome.compared);
        }
    }

    #[test]
    fn test_wgpu_malformed_program_is_build_error() {
        let problem = ProblemDescriptor::vector_add(64, DType::F32);
        let store = HostBufferStore::populate(&problem, Fill::Ones);
        let broken = Patched { from: "if i < count", to: "if i < count {" };
        let Some(result) = run_wgpu(broken, &problem, &store) else { return };
        match result {
            Err(Error::BuildError(diagnostic)) => assert!(!diagnostic.is_empty()),
            other => panic!("expected BuildError, got {:?}", other.map(|e| e.output)),
        }
    }

    #[test]
    fn test_wgpu_binding_disagreement_is_arg_mismatch() {
        // The layout declares `count` as a uniform; the shader reads it from storage.
        let problem = ProblemDescriptor::vector_add(64, DType::F32);
        let store = HostBufferStore::populate(&problem, Fill::Ones);
        let patched = Patched {
            from: "var<uniform>             count",
            to: "var<storage, read>       count",
        };
        let Some(result) = run_wgpu(patched, &problem, &store) else { return };
        assert_eq!(result.err().map(|e| e.kind()), Some("KernelArgMismatch"));
    }
}
