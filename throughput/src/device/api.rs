use crate::{DeviceClass, IndexSpace, KernelSignature, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferAccess {
    ReadOnly,
    WriteOnly,
}

/// Positional kernel argument. Buffers are borrowed for the duration of the
/// enqueue call only.
pub enum KernelArg<'a, B> {
    Buffer(&'a B),
    U32(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub class: DeviceClass,
}

/// Entry point into a compute runtime: enumerate platforms, pick a device,
/// open a context with a single in-order queue on it.
pub trait ComputeApi {
    type Platform;
    type Device;
    type Context: ComputeContext;

    fn platforms(&self) -> Result<Vec<Self::Platform>>;

    fn platform_name(&self, platform: &Self::Platform) -> String;

    /// Devices on `platform` accepted by `class`, in enumeration order.
    fn devices(&self, platform: &Self::Platform, class: DeviceClass) -> Result<Vec<Self::Device>>;

    fn device_info(&self, device: &Self::Device) -> DeviceInfo;

    fn create_context(&self, device: Self::Device) -> Result<Self::Context>;
}

/// A context plus its command queue. Every handle it hands out releases its
/// device resource on drop.
pub trait ComputeContext {
    type Buffer;
    type Program;
    type Kernel;

    /// Compile `source`. Failures carry the compiler's diagnostic text.
    fn build_program(&mut self, source: &str) -> Result<Self::Program>;

    fn create_kernel(
        &mut self,
        program: &Self::Program,
        signature: &KernelSignature,
        workgroup: [u32; 2],
    ) -> Result<Self::Kernel>;

    fn create_buffer(&mut self, len_bytes: usize, access: BufferAccess) -> Result<Self::Buffer>;

    /// Blocking host-to-device copy; returns once the data is resident.
    fn write_buffer(&mut self, buffer: &Self::Buffer, data: &[u8]) -> Result<()>;

    fn enqueue_kernel(
        &mut self,
        kernel: &Self::Kernel,
        args: &[KernelArg<'_, Self::Buffer>],
        space: IndexSpace,
    ) -> Result<()>;

    /// Barrier: returns once every enqueued command has completed.
    fn finish(&mut self) -> Result<()>;

    /// Blocking device-to-host copy of the first `out.len()` bytes.
    fn read_buffer(&mut self, buffer: &Self::Buffer, out: &mut [u8]) -> Result<()>;
}

/// Work-groups needed to cover `space` with groups of `workgroup`, as an
/// (x, y, z) dispatch. One-dimensional launches wider than `max_dim` groups
/// fold the excess into y; kernels rebuild the linear id from
/// `num_workgroups`.
pub fn dispatch_size(space: IndexSpace, workgroup: [u32; 2], max_dim: u32) -> (u32, u32, u32) {
    match space {
        IndexSpace::D1(n) => {
            let groups = n.div_ceil(workgroup[0].max(1) as usize) as u32;
            if groups <= max_dim {
                (groups, 1, 1)
            } else {
                (max_dim, groups.div_ceil(max_dim), 1)
            }
        }
        IndexSpace::D2(rows, cols) => (
            cols.div_ceil(workgroup[0].max(1) as usize) as u32,
            rows.div_ceil(workgroup[1].max(1) as usize) as u32,
            1,
        ),
    }
}

/// Whether `source` defines a function named `entry`.
pub(crate) fn declares_entry(source: &str, entry: &str) -> bool {
    source.match_indices("fn ").any(|(at, _)| {
        source[at + 3..]
            .trim_start()
            .strip_prefix(entry)
            .is_some_and(|rest| rest.trim_start().starts_with('('))
    })
}
