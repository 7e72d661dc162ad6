//! In-process software device.
//!
//! Behaves like a command-queue runtime without needing one: platforms and
//! devices are configured up front, "compilation" checks delimiter balance,
//! entry points and binding counts, launches are queued and only run when
//! `finish` drains the queue. Every handle is tracked in a shared
//! [`ResourceLedger`] so tests can assert that a run released everything.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::api::{declares_entry, BufferAccess, ComputeApi, ComputeContext, DeviceInfo, KernelArg};
use crate::backend::{matmul_rows_into, vector_add_into};
use crate::element::Element;
use crate::{
    DType, DeviceClass, Error, IndexSpace, KernelSignature, ParamKind, ParamRole, Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmulatedDevice {
    pub name: String,
    pub class: DeviceClass,
}

impl EmulatedDevice {
    pub fn new(name: &str, class: DeviceClass) -> Self {
        Self { name: name.to_string(), class }
    }
}

#[derive(Clone, Debug)]
pub struct EmulatedPlatform {
    pub name: String,
    pub devices: Vec<EmulatedDevice>,
    /// Device queries on this platform return an error.
    pub query_fails: bool,
}

impl EmulatedPlatform {
    pub fn new(name: &str, devices: Vec<EmulatedDevice>) -> Self {
        Self { name: name.to_string(), devices, query_fails: false }
    }

    pub fn failing(mut self) -> Self {
        self.query_fails = true;
        self
    }
}

/// Injected failures, checked at the matching queue operation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Faults {
    pub context: bool,
    pub upload: bool,
    pub launch: bool,
    pub readback: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    Context,
    Program,
    Kernel,
    Buffer,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveResources {
    pub contexts: usize,
    pub programs: usize,
    pub kernels: usize,
    pub buffers: usize,
}

impl LiveResources {
    pub fn total(&self) -> usize {
        self.contexts + self.programs + self.kernels + self.buffers
    }
}

#[derive(Debug, Default)]
pub struct ResourceLedger {
    contexts: AtomicUsize,
    programs: AtomicUsize,
    kernels: AtomicUsize,
    buffers: AtomicUsize,
    released: Mutex<Vec<Resource>>,
}

impl ResourceLedger {
    pub fn live(&self) -> LiveResources {
        LiveResources {
            contexts: self.contexts.load(Ordering::Acquire),
            programs: self.programs.load(Ordering::Acquire),
            kernels: self.kernels.load(Ordering::Acquire),
            buffers: self.buffers.load(Ordering::Acquire),
        }
    }

    /// Every release so far, oldest first.
    pub fn release_order(&self) -> Vec<Resource> {
        match self.released.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn counter(&self, kind: Resource) -> &AtomicUsize {
        match kind {
            Resource::Context => &self.contexts,
            Resource::Program => &self.programs,
            Resource::Kernel => &self.kernels,
            Resource::Buffer => &self.buffers,
        }
    }

    fn acquire(self: &Arc<Self>, kind: Resource) -> LedgerToken {
        self.counter(kind).fetch_add(1, Ordering::AcqRel);
        LedgerToken { ledger: Arc::clone(self), kind }
    }
}

struct LedgerToken {
    ledger: Arc<ResourceLedger>,
    kind: Resource,
}

impl Drop for LedgerToken {
    fn drop(&mut self) {
        self.ledger.counter(self.kind).fetch_sub(1, Ordering::AcqRel);
        if let Ok(mut log) = self.ledger.released.lock() {
            log.push(self.kind);
        }
    }
}

pub struct EmulatedApi {
    platforms: Vec<EmulatedPlatform>,
    faults: Faults,
    ledger: Arc<ResourceLedger>,
}

impl EmulatedApi {
    pub fn new(platforms: Vec<EmulatedPlatform>) -> Self {
        Self { platforms, faults: Faults::default(), ledger: Arc::new(ResourceLedger::default()) }
    }

    /// One platform carrying one device of `class`.
    pub fn single(class: DeviceClass) -> Self {
        let name = match class {
            DeviceClass::Cpu => "Emulated CPU",
            DeviceClass::Accelerator => "Emulated Accelerator",
            DeviceClass::Gpu | DeviceClass::Any => "Emulated GPU",
        };
        let class = if class == DeviceClass::Any { DeviceClass::Gpu } else { class };
        Self::new(vec![EmulatedPlatform::new("Emulated Platform", vec![EmulatedDevice::new(name, class)])])
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn ledger(&self) -> Arc<ResourceLedger> {
        Arc::clone(&self.ledger)
    }
}

impl ComputeApi for EmulatedApi {
    type Platform = EmulatedPlatform;
    type Device = EmulatedDevice;
    type Context = EmulatedContext;

    fn platforms(&self) -> Result<Vec<EmulatedPlatform>> {
        Ok(self.platforms.clone())
    }

    fn platform_name(&self, platform: &EmulatedPlatform) -> String {
        platform.name.clone()
    }

    fn devices(&self, platform: &EmulatedPlatform, class: DeviceClass) -> Result<Vec<EmulatedDevice>> {
        if platform.query_fails {
            return Err(Error::ContextError(format!("device query failed on {}", platform.name)));
        }
        Ok(platform.devices.iter().filter(|d| class.accepts(d.class)).cloned().collect())
    }

    fn device_info(&self, device: &EmulatedDevice) -> DeviceInfo {
        DeviceInfo { name: device.name.clone(), class: device.class }
    }

    fn create_context(&self, device: EmulatedDevice) -> Result<EmulatedContext> {
        if self.faults.context {
            return Err(Error::ContextError(format!("{} refused a context", device.name)));
        }
        Ok(EmulatedContext {
            device,
            faults: self.faults,
            ledger: Arc::clone(&self.ledger),
            queue: Vec::new(),
            _token: self.ledger.acquire(Resource::Context),
        })
    }
}

type Storage = Rc<RefCell<Vec<u8>>>;

pub struct EmulatedBuffer {
    storage: Storage,
    access: BufferAccess,
    _token: LedgerToken,
}

pub struct EmulatedProgram {
    source: String,
    bindings: usize,
    _token: LedgerToken,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum HostKernel {
    Sum,
    VectorAdd,
    MatMul,
}

pub struct EmulatedKernel {
    host: HostKernel,
    dtype: DType,
    signature: KernelSignature,
    workgroup: [u32; 2],
    _token: LedgerToken,
}

enum LaunchArg {
    Buffer(Storage),
    U32(u32),
}

struct Launch {
    host: HostKernel,
    dtype: DType,
    workgroup: [u32; 2],
    args: Vec<LaunchArg>,
}

pub struct EmulatedContext {
    device: EmulatedDevice,
    faults: Faults,
    ledger: Arc<ResourceLedger>,
    queue: Vec<Launch>,
    _token: LedgerToken,
}

impl EmulatedContext {
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Check delimiter balance and count resource bindings. Errors are
/// diagnostics pointing at a source line.
fn compile(source: &str) -> std::result::Result<usize, String> {
    if source.trim().is_empty() {
        return Err("line 1: empty program".into());
    }
    let mut open: Vec<(char, usize)> = Vec::new();
    for (idx, line) in source.lines().enumerate() {
        let lineno = idx + 1;
        let code = line.split("//").next().unwrap_or_default();
        for ch in code.chars() {
            let opener = match ch {
                '(' | '{' | '[' => {
                    open.push((ch, lineno));
                    continue;
                }
                ')' => '(',
                '}' => '{',
                ']' => '[',
                _ => continue,
            };
            match open.pop() {
                Some((o, _)) if o == opener => {}
                Some((o, at)) => {
                    return Err(format!(
                        "line {}: `{}` does not close `{}` opened on line {}",
                        lineno, ch, o, at
                    ))
                }
                None => return Err(format!("line {}: unmatched `{}`", lineno, ch)),
            }
        }
    }
    if let Some((o, at)) = open.pop() {
        return Err(format!("line {}: `{}` is never closed", at, o));
    }
    Ok(source.matches("@binding(").count())
}

impl ComputeContext for EmulatedContext {
    type Buffer = EmulatedBuffer;
    type Program = EmulatedProgram;
    type Kernel = EmulatedKernel;

    fn build_program(&mut self, source: &str) -> Result<EmulatedProgram> {
        let bindings = compile(source).map_err(Error::BuildError)?;
        debug!(bindings, device = %self.device.name, "emulated_program_built");
        Ok(EmulatedProgram {
            source: source.to_string(),
            bindings,
            _token: self.ledger.acquire(Resource::Program),
        })
    }

    fn create_kernel(
        &mut self,
        program: &EmulatedProgram,
        signature: &KernelSignature,
        workgroup: [u32; 2],
    ) -> Result<EmulatedKernel> {
        let entry = signature.entry_point.as_str();
        if !declares_entry(&program.source, entry) {
            return Err(Error::BuildError(format!("entry point `{}` not found in program", entry)));
        }
        let host = match entry {
            "sum" => HostKernel::Sum,
            "vector_add" => HostKernel::VectorAdd,
            "matmul" => HostKernel::MatMul,
            other => {
                return Err(Error::BuildError(format!(
                    "entry point `{}` has no host implementation",
                    other
                )))
            }
        };
        if program.bindings != signature.params.len() {
            return Err(Error::KernelArgMismatch(format!(
                "program binds {} resources, `{}` declares {} parameters",
                program.bindings,
                entry,
                signature.params.len()
            )));
        }
        let dtype = signature
            .params
            .iter()
            .find_map(|p| match p.kind {
                ParamKind::Buffer(dtype) => Some(dtype),
                ParamKind::U32 => None,
            })
            .ok_or_else(|| Error::KernelArgMismatch(format!("`{}` binds no buffers", entry)))?;
        Ok(EmulatedKernel {
            host,
            dtype,
            signature: signature.clone(),
            workgroup,
            _token: self.ledger.acquire(Resource::Kernel),
        })
    }

    fn create_buffer(&mut self, len_bytes: usize, access: BufferAccess) -> Result<EmulatedBuffer> {
        Ok(EmulatedBuffer {
            storage: Rc::new(RefCell::new(vec![0u8; len_bytes])),
            access,
            _token: self.ledger.acquire(Resource::Buffer),
        })
    }

    fn write_buffer(&mut self, buffer: &EmulatedBuffer, data: &[u8]) -> Result<()> {
        if self.faults.upload {
            return Err(Error::TransferError("injected upload fault".into()));
        }
        let mut storage = buffer.storage.borrow_mut();
        if data.len() > storage.len() {
            return Err(Error::TransferError(format!(
                "write of {} bytes into a {} byte buffer",
                data.len(),
                storage.len()
            )));
        }
        storage[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn enqueue_kernel(
        &mut self,
        kernel: &EmulatedKernel,
        args: &[KernelArg<'_, EmulatedBuffer>],
        space: IndexSpace,
    ) -> Result<()> {
        if self.faults.launch {
            return Err(Error::ExecutionError("injected launch fault".into()));
        }
        let params = &kernel.signature.params;
        if args.len() != params.len() {
            return Err(Error::KernelArgMismatch(format!(
                "`{}` takes {} arguments, got {}",
                kernel.signature.entry_point,
                params.len(),
                args.len()
            )));
        }
        let mut bound = Vec::with_capacity(args.len());
        for (idx, (param, arg)) in params.iter().zip(args).enumerate() {
            let value = match (param.role, arg) {
                (ParamRole::Scalar, KernelArg::U32(v)) => LaunchArg::U32(*v),
                (ParamRole::Input, KernelArg::Buffer(buf)) if buf.access == BufferAccess::ReadOnly => {
                    LaunchArg::Buffer(Rc::clone(&buf.storage))
                }
                (ParamRole::Output, KernelArg::Buffer(buf)) if buf.access == BufferAccess::WriteOnly => {
                    LaunchArg::Buffer(Rc::clone(&buf.storage))
                }
                _ => {
                    return Err(Error::KernelArgMismatch(format!(
                        "argument {} does not fit parameter `{}` ({:?})",
                        idx, param.name, param.role
                    )))
                }
            };
            bound.push(value);
        }
        debug!(entry = %kernel.signature.entry_point, work_items = space.total(), "emulated_enqueue");
        self.queue.push(Launch {
            host: kernel.host,
            dtype: kernel.dtype,
            workgroup: kernel.workgroup,
            args: bound,
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for launch in std::mem::take(&mut self.queue) {
            match launch.dtype {
                DType::F32 => run_launch::<f32>(&launch)?,
                DType::I32 => run_launch::<i32>(&launch)?,
            }
        }
        Ok(())
    }

    fn read_buffer(&mut self, buffer: &EmulatedBuffer, out: &mut [u8]) -> Result<()> {
        if !self.queue.is_empty() {
            return Err(Error::ExecutionError(format!(
                "read issued with {} commands still queued",
                self.queue.len()
            )));
        }
        if self.faults.readback {
            return Err(Error::TransferError("injected readback fault".into()));
        }
        let storage = buffer.storage.borrow();
        if out.len() > storage.len() {
            return Err(Error::TransferError(format!(
                "read of {} bytes from a {} byte buffer",
                out.len(),
                storage.len()
            )));
        }
        out.copy_from_slice(&storage[..out.len()]);
        Ok(())
    }
}

fn read_elems<T: Element>(storage: &Storage, len: usize) -> Result<Vec<T>> {
    let bytes = storage.borrow();
    let size = std::mem::size_of::<T>();
    if len * size > bytes.len() {
        return Err(Error::ExecutionError(format!(
            "kernel reads {} elements past a {} byte buffer",
            len,
            bytes.len()
        )));
    }
    Ok(bytes[..len * size].chunks_exact(size).map(bytemuck::pod_read_unaligned).collect())
}

fn write_elems<T: Element>(storage: &Storage, values: &[T]) -> Result<()> {
    let src: &[u8] = bytemuck::cast_slice(values);
    let mut bytes = storage.borrow_mut();
    if src.len() > bytes.len() {
        return Err(Error::ExecutionError(format!(
            "kernel writes {} elements past a {} byte buffer",
            values.len(),
            bytes.len()
        )));
    }
    bytes[..src.len()].copy_from_slice(src);
    Ok(())
}

fn run_launch<T: Element>(launch: &Launch) -> Result<()> {
    let mut buffers = Vec::new();
    let mut dims = Vec::new();
    for arg in &launch.args {
        match arg {
            LaunchArg::Buffer(storage) => buffers.push(storage),
            LaunchArg::U32(v) => dims.push(*v as usize),
        }
    }
    let buffer = |i: usize| {
        buffers
            .get(i)
            .copied()
            .ok_or_else(|| Error::ExecutionError(format!("missing buffer argument {}", i)))
    };
    let dim = |i: usize| {
        dims.get(i)
            .copied()
            .ok_or_else(|| Error::ExecutionError(format!("missing scalar argument {}", i)))
    };

    match launch.host {
        HostKernel::Sum => {
            let data = read_elems::<T>(buffer(0)?, dim(0)?)?;
            let group = launch.workgroup[0].max(1) as usize;
            let partials: Vec<T> = data
                .chunks(group)
                .map(|g| g.iter().fold(T::default(), |acc, &x| acc.add(x)))
                .collect();
            write_elems(buffer(1)?, &partials)
        }
        HostKernel::VectorAdd => {
            let n = dim(0)?;
            let a = read_elems::<T>(buffer(0)?, n)?;
            let b = read_elems::<T>(buffer(1)?, n)?;
            let mut c = vec![T::default(); n];
            vector_add_into(&a, &b, &mut c);
            write_elems(buffer(2)?, &c)
        }
        HostKernel::MatMul => {
            let (m, n, k) = (dim(0)?, dim(1)?, dim(2)?);
            let a = read_elems::<T>(buffer(0)?, m * k)?;
            let b = read_elems::<T>(buffer(1)?, k * n)?;
            let mut c = vec![T::default(); m * n];
            matmul_rows_into(&a, &b, &mut c, 0, n, k);
            write_elems(buffer(2)?, &c)
        }
    }
}
