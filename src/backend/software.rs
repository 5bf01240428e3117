//! Host-memory reference device
//!
//! [`SoftwareDevice`] implements [`ComputeDevice`] without a GPU. Memory
//! allocations are real host allocations, device addresses are fake but
//! stable, and submitted command sequences are executed when their fence is
//! waited on. The compute stage always runs the element-doubling program:
//! it reads the result and source addresses from the first two entries of
//! the buffer bound at binding 0, writes the specialization constant into
//! element 0 and `2 * src[i]` into every other element.
//!
//! Besides executing work it keeps books for tests:
//! - read-after-write hazards between the transfer and compute stages
//! - objects destroyed twice, or destroyed while still in use
//! - injected failures for any entry point (`with_failure`)
//! - simulated completion latency (`with_completion_delay`)

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};

use crate::backend::commands::{BufferBarrier, GpuOp};
use crate::backend::device::{
    AddressSource, BufferDesc, ComputeDevice, ComputeStageDesc, DeviceObject, MemoryDesc,
};
use crate::backend::error::{DeviceError, DeviceResult};
use crate::compute::memory_type::{MemoryHeapInfo, MemoryTable, MemoryTypeInfo};
use crate::compute::sequencer::LOCAL_WORKGROUP_SIZE;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Alignment of every allocation, bind offset and buffer size
const ALIGNMENT: u64 = 256;

/// First fake device address handed out
const ADDRESS_BASE: u64 = 0x0000_7f00_0000_0000;

/// Smallest `maxComputeWorkGroupCount[0]` Vulkan allows
const MIN_WORKGROUP_COUNT_X: u32 = 65_535;

/// Gap between consecutive allocations in the fake address space
const ADDRESS_GUARD: u64 = 64 * 1024;

const GIB: u64 = 1024 * 1024 * 1024;

/// A read-after-write or queue ownership problem seen while executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hazard {
    /// The compute stage read a buffer whose transfer write was never made visible to it
    ShaderReadAfterTransferWrite { buffer: vk::Buffer },
    /// A transfer read a buffer whose shader write was never made visible to it
    TransferReadAfterShaderWrite { buffer: vk::Buffer },
    /// A barrier moved a buffer between queue families
    OwnershipTransfer { buffer: vk::Buffer },
    /// The compute stage dereferenced an address that no bound buffer covers
    UnresolvedAddress { address: vk::DeviceAddress },
}

/// Counters kept by the software device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub objects_created: usize,
    pub objects_destroyed: usize,
    /// Destroy calls on objects that were already gone
    pub double_destroys: usize,
    /// Calls the Vulkan validation layers would reject
    pub usage_errors: usize,
    pub submissions: usize,
    pub dispatches: usize,
    /// Memory objects currently mapped
    pub mapped: usize,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    call: &'static str,
    nth: usize,
    result: vk::Result,
}

/// Zeroed host allocation standing in for one `VkDeviceMemory`
struct HostAllocation {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostAllocation {
    fn zeroed(size: u64) -> Option<Self> {
        let size = usize::try_from(size).ok()?.max(1);
        let layout = Layout::from_size_align(size, ALIGNMENT as usize).ok()?;
        // SAFETY: layout has a non-zero size
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    /// Pointer `offset` bytes into the allocation; callers bounds-check first
    fn at(&self, offset: u64) -> *mut u8 {
        // SAFETY: every caller checks offset against the allocation size
        unsafe { self.ptr.as_ptr().add(offset as usize) }
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

struct SwMemory {
    bytes: HostAllocation,
    size: u64,
    type_index: u32,
    device_address: bool,
    base_address: u64,
    mapped: bool,
}

struct SwBuffer {
    size: u64,
    usage: vk::BufferUsageFlags,
    binding: Option<(vk::DeviceMemory, u64)>,
}

struct SwDescriptorSet {
    pool: vk::DescriptorPool,
    storage: Option<vk::Buffer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdState {
    Initial,
    Recording,
    Executable,
    Pending,
    /// One-time-submit buffer after execution
    Invalid,
}

struct SwCommandBuffer {
    pool: vk::CommandPool,
    state: CmdState,
    ops: Vec<GpuOp>,
}

#[derive(Default)]
struct SwFence {
    signaled: bool,
    pending: Option<(vk::CommandBuffer, Instant)>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_address: u64,
    live: HashSet<DeviceObject>,
    buffers: HashMap<vk::Buffer, SwBuffer>,
    memories: HashMap<vk::DeviceMemory, SwMemory>,
    pipelines: HashMap<vk::Pipeline, u32>,
    descriptor_sets: HashMap<vk::DescriptorSet, SwDescriptorSet>,
    command_buffers: HashMap<vk::CommandBuffer, SwCommandBuffer>,
    fences: HashMap<vk::Fence, SwFence>,
    calls: HashMap<&'static str, usize>,
    hazards: Vec<Hazard>,
    destroyed: Vec<DeviceObject>,
    stats: SoftwareStats,
    /// Element overwritten after every dispatch
    result_fault: Option<(usize, u32)>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn adopt(&mut self, object: DeviceObject) {
        self.live.insert(object);
        self.stats.objects_created += 1;
    }

    fn usage_error(&mut self, what: &str) {
        tracing::warn!("SoftwareDevice: invalid usage: {}", what);
        self.stats.usage_errors += 1;
    }

    fn hazard(&mut self, hazard: Hazard) {
        tracing::warn!("SoftwareDevice: hazard {:?}", hazard);
        self.hazards.push(hazard);
    }

    /// Host pointer and length of a bound buffer
    fn buffer_bytes(&self, buffer: vk::Buffer) -> Option<(*mut u8, u64)> {
        let buf = self.buffers.get(&buffer)?;
        let (memory, offset) = buf.binding?;
        let mem = self.memories.get(&memory)?;
        Some((mem.bytes.at(offset), buf.size))
    }

    /// Buffer covering `address`, with the host pointer and the bytes left in it
    fn resolve_address(&self, address: u64) -> Option<(vk::Buffer, *mut u8, u64)> {
        self.buffers.iter().find_map(|(&handle, buf)| {
            let (memory, offset) = buf.binding?;
            let mem = self.memories.get(&memory)?;
            let start = mem.base_address + offset;
            if address >= start && address < start + buf.size {
                let delta = address - start;
                Some((handle, mem.bytes.at(offset + delta), buf.size - delta))
            } else {
                None
            }
        })
    }
}

/// Write-visibility tracking for one executed command sequence
#[derive(Default)]
struct Execution {
    transfer_writes: HashSet<vk::Buffer>,
    shader_writes: HashSet<vk::Buffer>,
    pipeline: Option<vk::Pipeline>,
    set: Option<vk::DescriptorSet>,
}

/// Host-memory [`ComputeDevice`] for tests and dry runs
pub struct SoftwareDevice {
    table: MemoryTable,
    address_source: Option<AddressSource>,
    max_workgroup_count_x: u32,
    completion_delay: Duration,
    failures: Vec<Failure>,
    state: RefCell<State>,
}

impl SoftwareDevice {
    /// Device with a discrete-GPU memory layout and core address queries
    pub fn new() -> Self {
        Self {
            table: Self::default_memory_table(),
            address_source: Some(AddressSource::Core),
            max_workgroup_count_x: MIN_WORKGROUP_COUNT_X,
            completion_delay: Duration::ZERO,
            failures: Vec::new(),
            state: RefCell::new(State::default()),
        }
    }

    /// Device-local type 0 on an 8 GiB heap, host-visible coherent types 1
    /// and 2 (2 also cached) on a 16 GiB heap
    pub fn default_memory_table() -> MemoryTable {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        MemoryTable::new(
            vec![
                MemoryTypeInfo {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryTypeInfo {
                    property_flags: host,
                    heap_index: 1,
                },
                MemoryTypeInfo {
                    property_flags: host | vk::MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
            ],
            vec![
                MemoryHeapInfo {
                    size: 8 * GIB,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeapInfo {
                    size: 16 * GIB,
                    flags: vk::MemoryHeapFlags::empty(),
                },
            ],
        )
    }

    pub fn with_memory_table(mut self, table: MemoryTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_address_source(mut self, source: Option<AddressSource>) -> Self {
        self.address_source = source;
        self
    }

    pub fn with_max_workgroup_count(mut self, groups_x: u32) -> Self {
        self.max_workgroup_count_x = groups_x;
        self
    }

    /// Submitted work completes `delay` after `vkQueueSubmit`
    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }

    /// Make the `nth` call (1-based) of entry point `call` fail with `result`
    pub fn with_failure(mut self, call: &'static str, nth: usize, result: vk::Result) -> Self {
        self.failures.push(Failure { call, nth, result });
        self
    }

    /// Make every dispatch leave `value` in result element `index`
    pub fn with_result_fault(mut self, index: usize, value: u32) -> Self {
        self.state.get_mut().result_fault = Some((index, value));
        self
    }

    pub fn stats(&self) -> SoftwareStats {
        self.state.borrow().stats.clone()
    }

    /// Objects created and not yet destroyed
    pub fn live_objects(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub fn hazards(&self) -> Vec<Hazard> {
        self.state.borrow().hazards.clone()
    }

    /// Every successful destroy, in call order
    pub fn destroy_log(&self) -> Vec<DeviceObject> {
        self.state.borrow().destroyed.clone()
    }

    /// How many times entry point `call` was invoked
    pub fn call_count(&self, call: &str) -> usize {
        self.state.borrow().calls.get(call).copied().unwrap_or(0)
    }

    /// Operations recorded into `cmd`
    pub fn recorded_ops(&self, cmd: vk::CommandBuffer) -> Vec<GpuOp> {
        self.state
            .borrow()
            .command_buffers
            .get(&cmd)
            .map(|c| c.ops.clone())
            .unwrap_or_default()
    }

    /// Current contents of a bound buffer, host-visible or not
    pub fn read_buffer(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let (ptr, len) = state.buffer_bytes(buffer)?;
        // SAFETY: `buffer_bytes` only returns ranges inside a live allocation
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len as usize) };
        Some(bytes.to_vec())
    }

    /// Count the call and apply any injected failure
    fn enter(&self, state: &mut State, call: &'static str) -> DeviceResult<()> {
        let count = state.calls.entry(call).or_insert(0);
        *count += 1;
        let nth = *count;
        match self.failures.iter().find(|f| f.call == call && f.nth == nth) {
            Some(failure) => {
                tracing::debug!(
                    "SoftwareDevice: injecting {:?} into {}",
                    failure.result,
                    call
                );
                Err(DeviceError::new(call, failure.result))
            }
            None => Ok(()),
        }
    }

    fn invalid(state: &mut State, call: &'static str, what: &str) -> DeviceError {
        state.usage_error(what);
        DeviceError::new(call, vk::Result::ERROR_VALIDATION_FAILED_EXT)
    }

    /// Run the work behind `fence` and signal it
    fn complete(state: &mut State, fence: vk::Fence) {
        let Some((cmd, _)) = state.fences.get_mut(&fence).and_then(|f| f.pending.take()) else {
            return;
        };
        let ops = match state.command_buffers.get_mut(&cmd) {
            Some(c) => {
                c.state = CmdState::Invalid;
                c.ops.clone()
            }
            None => Vec::new(),
        };
        Self::execute(state, &ops);
        if let Some(f) = state.fences.get_mut(&fence) {
            f.signaled = true;
        }
    }

    fn execute(state: &mut State, ops: &[GpuOp]) {
        let mut exec = Execution::default();
        for op in ops {
            match op {
                GpuOp::CopyBuffer { src, dst, region } => {
                    if exec.shader_writes.contains(src) {
                        state.hazard(Hazard::TransferReadAfterShaderWrite { buffer: *src });
                    }
                    Self::copy(
                        state,
                        *src,
                        *dst,
                        region.src_offset,
                        region.dst_offset,
                        region.size,
                    );
                    exec.transfer_writes.insert(*dst);
                }
                GpuOp::Barrier {
                    src_stage,
                    dst_stage,
                    buffers,
                } => {
                    for barrier in buffers {
                        Self::apply_barrier(state, &mut exec, *src_stage, *dst_stage, barrier);
                    }
                }
                GpuOp::BindComputePipeline { pipeline } => exec.pipeline = Some(*pipeline),
                GpuOp::BindDescriptorSet { set, .. } => exec.set = Some(*set),
                GpuOp::Dispatch {
                    groups_x,
                    groups_y,
                    groups_z,
                } => {
                    let invocations = u64::from(*groups_x)
                        * u64::from(*groups_y)
                        * u64::from(*groups_z)
                        * u64::from(LOCAL_WORKGROUP_SIZE);
                    Self::dispatch(state, &mut exec, invocations);
                }
            }
        }
    }

    fn copy(
        state: &mut State,
        src: vk::Buffer,
        dst: vk::Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) {
        let (Some((src_ptr, src_len)), Some((dst_ptr, dst_len))) =
            (state.buffer_bytes(src), state.buffer_bytes(dst))
        else {
            state.usage_error("copy between unbound buffers");
            return;
        };
        if src_offset + size > src_len || dst_offset + size > dst_len {
            state.usage_error("copy region outside buffer");
            return;
        }
        // SAFETY: both ranges were checked against their buffers, which lie
        // inside live allocations
        unsafe {
            std::ptr::copy(
                src_ptr.add(src_offset as usize),
                dst_ptr.add(dst_offset as usize),
                size as usize,
            );
        }
    }

    fn apply_barrier(
        state: &mut State,
        exec: &mut Execution,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &BufferBarrier,
    ) {
        if barrier.is_ownership_transfer() {
            state.hazard(Hazard::OwnershipTransfer {
                buffer: barrier.buffer,
            });
            return;
        }
        let covers = state
            .buffers
            .get(&barrier.buffer)
            .is_some_and(|b| barrier.offset == 0 && barrier.size >= b.size);
        if !covers {
            return;
        }

        let upload_visible = src_stage.contains(vk::PipelineStageFlags::TRANSFER)
            && barrier.src_access.contains(vk::AccessFlags::TRANSFER_WRITE)
            && dst_stage.contains(vk::PipelineStageFlags::COMPUTE_SHADER)
            && barrier.dst_access.contains(vk::AccessFlags::SHADER_READ);
        if upload_visible {
            exec.transfer_writes.remove(&barrier.buffer);
        }

        let result_visible = src_stage.contains(vk::PipelineStageFlags::COMPUTE_SHADER)
            && barrier.src_access.contains(vk::AccessFlags::SHADER_WRITE)
            && dst_stage.contains(vk::PipelineStageFlags::TRANSFER)
            && barrier.dst_access.contains(vk::AccessFlags::TRANSFER_READ);
        if result_visible {
            exec.shader_writes.remove(&barrier.buffer);
        }
    }

    fn dispatch(state: &mut State, exec: &mut Execution, invocations: u64) {
        state.stats.dispatches += 1;

        let Some(count) = exec.pipeline.and_then(|p| state.pipelines.get(&p).copied()) else {
            state.usage_error("dispatch without a compute pipeline");
            return;
        };
        let Some(table) = exec
            .set
            .and_then(|s| state.descriptor_sets.get(&s))
            .and_then(|s| s.storage)
        else {
            state.usage_error("dispatch without a storage descriptor");
            return;
        };
        if exec.transfer_writes.contains(&table) {
            state.hazard(Hazard::ShaderReadAfterTransferWrite { buffer: table });
        }

        let Some((table_ptr, table_len)) = state.buffer_bytes(table) else {
            state.usage_error("descriptor references an unbound buffer");
            return;
        };
        if table_len < 16 {
            state.usage_error("address table too small");
            return;
        }
        // SAFETY: `buffer_bytes` only returns ranges inside a live allocation
        let table_bytes = unsafe { std::slice::from_raw_parts(table_ptr, 16) };
        let result_addr: u64 = bytemuck::pod_read_unaligned(&table_bytes[..8]);
        let source_addr: u64 = bytemuck::pod_read_unaligned(&table_bytes[8..]);

        let Some((result, dst, dst_len)) = state.resolve_address(result_addr) else {
            state.hazard(Hazard::UnresolvedAddress {
                address: result_addr,
            });
            return;
        };
        let Some((source, src, src_len)) = state.resolve_address(source_addr) else {
            state.hazard(Hazard::UnresolvedAddress {
                address: source_addr,
            });
            return;
        };
        if exec.transfer_writes.contains(&source) {
            state.hazard(Hazard::ShaderReadAfterTransferWrite { buffer: source });
        }

        let n = invocations
            .min(u64::from(count))
            .min(dst_len / 4)
            .min(src_len / 4) as usize;
        // SAFETY: n words fit in what is left of the source buffer
        let src_bytes = unsafe { std::slice::from_raw_parts(src, n * 4) };
        let mut values: Vec<u32> = src_bytes
            .chunks_exact(4)
            .map(|word| bytemuck::pod_read_unaligned::<u32>(word).wrapping_mul(2))
            .collect();
        if let Some(first) = values.first_mut() {
            *first = count;
        }
        if let Some((index, value)) = state.result_fault {
            if let Some(slot) = values.get_mut(index) {
                *slot = value;
            }
        }
        // SAFETY: n words fit in what is left of the result buffer, and the
        // source words were copied out above
        let dst_bytes = unsafe { std::slice::from_raw_parts_mut(dst, n * 4) };
        dst_bytes.copy_from_slice(bytemuck::cast_slice(&values));
        exec.shader_writes.insert(result);
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeDevice for SoftwareDevice {
    fn memory_table(&self) -> &MemoryTable {
        &self.table
    }

    fn queue_family_index(&self) -> u32 {
        0
    }

    fn max_workgroup_count_x(&self) -> u32 {
        self.max_workgroup_count_x
    }

    fn address_source(&self) -> Option<AddressSource> {
        self.address_source
    }

    fn create_buffer(&self, desc: &BufferDesc) -> DeviceResult<vk::Buffer> {
        const CALL: &str = "vkCreateBuffer";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        if desc.size == 0 {
            return Err(Self::invalid(&mut state, CALL, "zero-sized buffer"));
        }
        let buffer = vk::Buffer::from_raw(state.handle());
        state.buffers.insert(
            buffer,
            SwBuffer {
                size: desc.size,
                usage: desc.usage,
                binding: None,
            },
        );
        state.adopt(DeviceObject::Buffer(buffer));
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let mut state = self.state.borrow_mut();
        let Some(size) = state.buffers.get(&buffer).map(|b| b.size) else {
            state.usage_error("requirements of an unknown buffer");
            return vk::MemoryRequirements::default();
        };
        let type_count = self.table.types.len().min(32) as u32;
        vk::MemoryRequirements {
            size: size.div_ceil(ALIGNMENT) * ALIGNMENT,
            alignment: ALIGNMENT,
            memory_type_bits: if type_count == 32 {
                u32::MAX
            } else {
                (1u32 << type_count) - 1
            },
        }
    }

    fn allocate_memory(&self, desc: &MemoryDesc) -> DeviceResult<vk::DeviceMemory> {
        const CALL: &str = "vkAllocateMemory";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        let fits = self
            .table
            .heap_of(desc.memory_type_index)
            .is_some_and(|heap| heap.size >= desc.size);
        if !fits {
            return Err(DeviceError::new(CALL, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let bytes = HostAllocation::zeroed(desc.size)
            .ok_or_else(|| DeviceError::new(CALL, vk::Result::ERROR_OUT_OF_HOST_MEMORY))?;

        let base_address = ADDRESS_BASE + state.next_address;
        state.next_address += desc.size.div_ceil(ADDRESS_GUARD) * ADDRESS_GUARD + ADDRESS_GUARD;

        let memory = vk::DeviceMemory::from_raw(state.handle());
        state.memories.insert(
            memory,
            SwMemory {
                bytes,
                size: desc.size,
                type_index: desc.memory_type_index,
                device_address: desc.device_address,
                base_address,
                mapped: false,
            },
        );
        state.adopt(DeviceObject::Memory(memory));
        Ok(memory)
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> DeviceResult<()> {
        const CALL: &str = "vkBindBufferMemory";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        let Some(mem_size) = state.memories.get(&memory).map(|m| m.size) else {
            return Err(Self::invalid(&mut state, CALL, "bind to unknown memory"));
        };
        let Some(buf) = state.buffers.get(&buffer) else {
            return Err(Self::invalid(&mut state, CALL, "bind of unknown buffer"));
        };
        if buf.binding.is_some() {
            return Err(Self::invalid(&mut state, CALL, "buffer bound twice"));
        }
        if offset % ALIGNMENT != 0 || offset + buf.size > mem_size {
            return Err(Self::invalid(&mut state, CALL, "bind range outside memory"));
        }
        if let Some(buf) = state.buffers.get_mut(&buffer) {
            buf.binding = Some((memory, offset));
        }
        Ok(())
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> DeviceResult<NonNull<u8>> {
        const CALL: &str = "vkMapMemory";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        let host_visible = |type_index: u32| {
            self.table
                .types
                .get(type_index as usize)
                .is_some_and(|t| t.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE))
        };
        let Some(mem) = state.memories.get_mut(&memory) else {
            return Err(Self::invalid(&mut state, CALL, "map of unknown memory"));
        };
        if !host_visible(mem.type_index) || mem.mapped {
            return Err(DeviceError::new(CALL, vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let size = if size == vk::WHOLE_SIZE {
            mem.size.saturating_sub(offset)
        } else {
            size
        };
        if offset + size > mem.size {
            return Err(DeviceError::new(CALL, vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        mem.mapped = true;
        let ptr = NonNull::new(mem.bytes.at(offset))
            .ok_or_else(|| DeviceError::new(CALL, vk::Result::ERROR_MEMORY_MAP_FAILED));
        state.stats.mapped += 1;
        ptr
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.borrow_mut();
        match state.memories.get_mut(&memory) {
            Some(mem) if mem.mapped => {
                mem.mapped = false;
                state.stats.mapped -= 1;
            }
            _ => state.usage_error("unmap of memory that is not mapped"),
        }
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> DeviceResult<vk::DeviceAddress> {
        let Some(source) = self.address_source else {
            return Err(DeviceError::new(
                AddressSource::Core.entry_point(),
                vk::Result::ERROR_EXTENSION_NOT_PRESENT,
            ));
        };
        let call = source.entry_point();
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, call)?;

        let Some(buf) = state.buffers.get(&buffer) else {
            return Err(Self::invalid(&mut state, call, "address of unknown buffer"));
        };
        let usage_ok = buf.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let Some((memory, offset)) = buf.binding else {
            return Err(Self::invalid(&mut state, call, "address of unbound buffer"));
        };
        let Some((base, flagged)) = state
            .memories
            .get(&memory)
            .map(|m| (m.base_address, m.device_address))
        else {
            return Err(Self::invalid(&mut state, call, "buffer bound to freed memory"));
        };
        if !usage_ok {
            state.usage_error("address of buffer without SHADER_DEVICE_ADDRESS usage");
        }
        if !flagged {
            state.usage_error("address of buffer in memory allocated without DEVICE_ADDRESS");
        }
        Ok(base + offset)
    }

    fn create_shader_module(&self, code: &[u32]) -> DeviceResult<vk::ShaderModule> {
        const CALL: &str = "vkCreateShaderModule";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(DeviceError::new(CALL, vk::Result::ERROR_INVALID_SHADER_NV));
        }
        let module = vk::ShaderModule::from_raw(state.handle());
        state.adopt(DeviceObject::ShaderModule(module));
        Ok(module)
    }

    fn create_storage_set_layout(&self) -> DeviceResult<vk::DescriptorSetLayout> {
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, "vkCreateDescriptorSetLayout")?;
        let layout = vk::DescriptorSetLayout::from_raw(state.handle());
        state.adopt(DeviceObject::DescriptorSetLayout(layout));
        Ok(layout)
    }

    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
    ) -> DeviceResult<vk::PipelineLayout> {
        const CALL: &str = "vkCreatePipelineLayout";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        if !state
            .live
            .contains(&DeviceObject::DescriptorSetLayout(set_layout))
        {
            return Err(Self::invalid(&mut state, CALL, "unknown descriptor set layout"));
        }
        let layout = vk::PipelineLayout::from_raw(state.handle());
        state.adopt(DeviceObject::PipelineLayout(layout));
        Ok(layout)
    }

    fn create_compute_pipeline(&self, stage: &ComputeStageDesc<'_>) -> DeviceResult<vk::Pipeline> {
        const CALL: &str = "vkCreateComputePipelines";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        let known = state.live.contains(&DeviceObject::ShaderModule(stage.module))
            && state.live.contains(&DeviceObject::PipelineLayout(stage.layout));
        if !known {
            return Err(Self::invalid(&mut state, CALL, "unknown module or layout"));
        }
        let pipeline = vk::Pipeline::from_raw(state.handle());
        state.pipelines.insert(pipeline, stage.element_count);
        state.adopt(DeviceObject::Pipeline(pipeline));
        Ok(pipeline)
    }

    fn create_descriptor_pool(&self) -> DeviceResult<vk::DescriptorPool> {
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, "vkCreateDescriptorPool")?;
        let pool = vk::DescriptorPool::from_raw(state.handle());
        state.adopt(DeviceObject::DescriptorPool(pool));
        Ok(pool)
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> DeviceResult<vk::DescriptorSet> {
        const CALL: &str = "vkAllocateDescriptorSets";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        let known = state.live.contains(&DeviceObject::DescriptorPool(pool))
            && state.live.contains(&DeviceObject::DescriptorSetLayout(layout));
        if !known {
            return Err(Self::invalid(&mut state, CALL, "unknown pool or layout"));
        }
        // Pools hold exactly one set
        if state.descriptor_sets.values().any(|s| s.pool == pool) {
            return Err(DeviceError::new(CALL, vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        let set = vk::DescriptorSet::from_raw(state.handle());
        state
            .descriptor_sets
            .insert(set, SwDescriptorSet { pool, storage: None });
        Ok(set)
    }

    fn write_storage_descriptor(
        &self,
        set: vk::DescriptorSet,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) {
        let mut state = self.state.borrow_mut();
        let storage_ok = state.buffers.get(&buffer).is_some_and(|b| {
            b.usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) && range <= b.size
        });
        if !storage_ok {
            state.usage_error("storage descriptor over an unsuitable buffer");
        }
        match state.descriptor_sets.get_mut(&set) {
            Some(s) => s.storage = Some(buffer),
            None => state.usage_error("write to unknown descriptor set"),
        }
    }

    fn create_command_pool(&self) -> DeviceResult<vk::CommandPool> {
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, "vkCreateCommandPool")?;
        let pool = vk::CommandPool::from_raw(state.handle());
        state.adopt(DeviceObject::CommandPool(pool));
        Ok(pool)
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> DeviceResult<vk::CommandBuffer> {
        const CALL: &str = "vkAllocateCommandBuffers";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        if !state.live.contains(&DeviceObject::CommandPool(pool)) {
            return Err(Self::invalid(&mut state, CALL, "unknown command pool"));
        }
        let cmd = vk::CommandBuffer::from_raw(state.handle());
        state.command_buffers.insert(
            cmd,
            SwCommandBuffer {
                pool,
                state: CmdState::Initial,
                ops: Vec::new(),
            },
        );
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> DeviceResult<()> {
        const CALL: &str = "vkBeginCommandBuffer";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        match state.command_buffers.get_mut(&cmd) {
            Some(c) if c.state != CmdState::Pending && c.state != CmdState::Recording => {
                c.state = CmdState::Recording;
                c.ops.clear();
                Ok(())
            }
            _ => Err(Self::invalid(&mut state, CALL, "begin on a busy command buffer")),
        }
    }

    fn record(&self, cmd: vk::CommandBuffer, op: &GpuOp) {
        let mut state = self.state.borrow_mut();
        match state.command_buffers.get_mut(&cmd) {
            Some(c) if c.state == CmdState::Recording => c.ops.push(op.clone()),
            _ => state.usage_error("record outside a recording"),
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> DeviceResult<()> {
        const CALL: &str = "vkEndCommandBuffer";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        match state.command_buffers.get_mut(&cmd) {
            Some(c) if c.state == CmdState::Recording => {
                c.state = CmdState::Executable;
                Ok(())
            }
            _ => Err(Self::invalid(&mut state, CALL, "end without begin")),
        }
    }

    fn create_fence(&self) -> DeviceResult<vk::Fence> {
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, "vkCreateFence")?;
        let fence = vk::Fence::from_raw(state.handle());
        state.fences.insert(fence, SwFence::default());
        state.adopt(DeviceObject::Fence(fence));
        Ok(fence)
    }

    fn queue_submit(&self, cmd: vk::CommandBuffer, fence: vk::Fence) -> DeviceResult<()> {
        const CALL: &str = "vkQueueSubmit";
        let mut state = self.state.borrow_mut();
        self.enter(&mut state, CALL)?;
        let fence_ready = state
            .fences
            .get(&fence)
            .is_some_and(|f| !f.signaled && f.pending.is_none());
        let cmd_ready = state
            .command_buffers
            .get(&cmd)
            .is_some_and(|c| c.state == CmdState::Executable);
        if !fence_ready || !cmd_ready {
            return Err(Self::invalid(&mut state, CALL, "submit of unready work"));
        }

        let ready_at = Instant::now() + self.completion_delay;
        if let Some(c) = state.command_buffers.get_mut(&cmd) {
            c.state = CmdState::Pending;
        }
        if let Some(f) = state.fences.get_mut(&fence) {
            f.pending = Some((cmd, ready_at));
        }
        state.stats.submissions += 1;
        Ok(())
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> DeviceResult<bool> {
        const CALL: &str = "vkWaitForFences";
        let wait = {
            let mut state = self.state.borrow_mut();
            self.enter(&mut state, CALL)?;
            let Some(f) = state.fences.get(&fence) else {
                return Err(Self::invalid(&mut state, CALL, "wait on unknown fence"));
            };
            if f.signaled {
                return Ok(true);
            }
            f.pending
                .map(|(_, ready_at)| ready_at.saturating_duration_since(Instant::now()))
        };

        match wait {
            Some(remaining) if remaining <= timeout => {
                std::thread::sleep(remaining);
                Self::complete(&mut self.state.borrow_mut(), fence);
                Ok(true)
            }
            _ => {
                std::thread::sleep(timeout);
                Ok(false)
            }
        }
    }

    fn wait_idle(&self) -> DeviceResult<()> {
        let (pending, latest) = {
            let mut state = self.state.borrow_mut();
            self.enter(&mut state, "vkDeviceWaitIdle")?;
            let pending: Vec<(vk::Fence, Instant)> = state
                .fences
                .iter()
                .filter_map(|(&fence, f)| f.pending.map(|(_, at)| (fence, at)))
                .collect();
            let latest = pending.iter().map(|(_, at)| *at).max();
            (pending, latest)
        };
        if let Some(latest) = latest {
            std::thread::sleep(latest.saturating_duration_since(Instant::now()));
        }
        let mut state = self.state.borrow_mut();
        for (fence, _) in pending {
            Self::complete(&mut state, fence);
        }
        Ok(())
    }

    fn destroy(&self, object: DeviceObject) {
        let mut state = self.state.borrow_mut();
        if !state.live.remove(&object) {
            tracing::warn!("SoftwareDevice: {} {:?} destroyed twice", object.kind(), object);
            state.stats.double_destroys += 1;
            return;
        }
        state.destroyed.push(object);
        state.stats.objects_destroyed += 1;

        match object {
            DeviceObject::Buffer(buffer) => {
                state.buffers.remove(&buffer);
            }
            DeviceObject::Memory(memory) => {
                if state
                    .buffers
                    .values()
                    .any(|b| b.binding.is_some_and(|(m, _)| m == memory))
                {
                    state.usage_error("memory freed while a buffer is still bound to it");
                }
                if state.memories.remove(&memory).is_some_and(|m| m.mapped) {
                    state.stats.mapped -= 1;
                }
            }
            DeviceObject::Pipeline(pipeline) => {
                state.pipelines.remove(&pipeline);
            }
            DeviceObject::DescriptorPool(pool) => {
                state.descriptor_sets.retain(|_, s| s.pool != pool);
            }
            DeviceObject::CommandPool(pool) => {
                if state
                    .command_buffers
                    .values()
                    .any(|c| c.pool == pool && c.state == CmdState::Pending)
                {
                    state.usage_error("command pool destroyed with work in flight");
                }
                state.command_buffers.retain(|_, c| c.pool != pool);
            }
            DeviceObject::Fence(fence) => {
                if state.fences.get(&fence).is_some_and(|f| f.pending.is_some()) {
                    state.usage_error("fence destroyed with work in flight");
                }
                state.fences.remove(&fence);
            }
            DeviceObject::ShaderModule(_)
            | DeviceObject::DescriptorSetLayout(_)
            | DeviceObject::PipelineLayout(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_buffer(device: &SoftwareDevice, size: u64) -> vk::Buffer {
        device
            .create_buffer(&BufferDesc {
                size,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            })
            .unwrap()
    }

    fn memory(device: &SoftwareDevice, size: u64, type_index: u32) -> vk::DeviceMemory {
        device
            .allocate_memory(&MemoryDesc {
                size,
                memory_type_index: type_index,
                device_address: true,
            })
            .unwrap()
    }

    #[test]
    fn test_requirements_are_aligned() {
        let device = SoftwareDevice::new();
        let buffer = storage_buffer(&device, 100);
        let req = device.buffer_memory_requirements(buffer);
        assert_eq!(req.size, 256);
        assert_eq!(req.alignment, 256);
        assert_eq!(req.memory_type_bits, 0b111);
    }

    #[test]
    fn test_addresses_follow_bind_offsets() {
        let device = SoftwareDevice::new();
        let a = storage_buffer(&device, 1024);
        let b = storage_buffer(&device, 1024);
        let mem = memory(&device, 2048, 0);
        device.bind_buffer_memory(a, mem, 0).unwrap();
        device.bind_buffer_memory(b, mem, 1024).unwrap();

        let addr_a = device.buffer_device_address(a).unwrap();
        let addr_b = device.buffer_device_address(b).unwrap();
        assert_eq!(addr_b - addr_a, 1024);
        assert_eq!(device.stats().usage_errors, 0);
    }

    #[test]
    fn test_rebinding_is_rejected() {
        let device = SoftwareDevice::new();
        let a = storage_buffer(&device, 256);
        let mem = memory(&device, 1024, 0);
        device.bind_buffer_memory(a, mem, 0).unwrap();
        let err = device.bind_buffer_memory(a, mem, 256).unwrap_err();
        assert_eq!(err.call, "vkBindBufferMemory");
    }

    #[test]
    fn test_device_local_memory_cannot_be_mapped() {
        let device = SoftwareDevice::new();
        let mem = memory(&device, 256, 0);
        let err = device.map_memory(mem, 0, 256).unwrap_err();
        assert_eq!(err.result(), vk::Result::ERROR_MEMORY_MAP_FAILED);
    }

    #[test]
    fn test_injected_failure_hits_nth_call() {
        let device = SoftwareDevice::new().with_failure(
            "vkCreateBuffer",
            2,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        );
        storage_buffer(&device, 64);
        let err = device
            .create_buffer(&BufferDesc {
                size: 64,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
            })
            .unwrap_err();
        assert_eq!(err.code, vk::Result::ERROR_OUT_OF_HOST_MEMORY.as_raw());
        assert_eq!(device.call_count("vkCreateBuffer"), 2);
        assert_eq!(device.live_objects(), 1);
    }

    #[test]
    fn test_missing_address_source_fails_query() {
        let device = SoftwareDevice::new().with_address_source(None);
        let a = storage_buffer(&device, 256);
        let err = device.buffer_device_address(a).unwrap_err();
        assert_eq!(err.result(), vk::Result::ERROR_EXTENSION_NOT_PRESENT);
    }

    #[test]
    fn test_transfer_round_trip_has_no_hazard() {
        let device = SoftwareDevice::new();
        let host = device
            .create_buffer(&BufferDesc {
                size: 256,
                usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            })
            .unwrap();
        let a = storage_buffer(&device, 256);
        let host_mem = memory(&device, 256, 1);
        let dev_mem = memory(&device, 256, 0);
        device.bind_buffer_memory(host, host_mem, 0).unwrap();
        device.bind_buffer_memory(a, dev_mem, 0).unwrap();

        let pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        device.begin_command_buffer(cmd).unwrap();
        device.record(cmd, &GpuOp::copy(host, 0, a, 0, 256));
        device.record(cmd, &GpuOp::copy(a, 0, host, 0, 256));
        device.end_command_buffer(cmd).unwrap();

        // Nothing recorded a shader write, so transfer-to-transfer is clean.
        let fence = device.create_fence().unwrap();
        device.queue_submit(cmd, fence).unwrap();
        assert!(device.wait_for_fence(fence, Duration::from_secs(1)).unwrap());
        assert!(device.hazards().is_empty());
    }

    #[test]
    fn test_delayed_completion_times_out_then_drains() {
        let device = SoftwareDevice::new().with_completion_delay(Duration::from_millis(50));
        let pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        device.begin_command_buffer(cmd).unwrap();
        device.end_command_buffer(cmd).unwrap();
        let fence = device.create_fence().unwrap();
        device.queue_submit(cmd, fence).unwrap();

        assert!(!device.wait_for_fence(fence, Duration::ZERO).unwrap());
        device.wait_idle().unwrap();
        assert!(device.wait_for_fence(fence, Duration::ZERO).unwrap());

        device.destroy(DeviceObject::Fence(fence));
        device.destroy(DeviceObject::CommandPool(pool));
        assert_eq!(device.stats().usage_errors, 0);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_double_destroy_is_counted() {
        let device = SoftwareDevice::new();
        let fence = device.create_fence().unwrap();
        device.destroy(DeviceObject::Fence(fence));
        device.destroy(DeviceObject::Fence(fence));
        assert_eq!(device.stats().double_destroys, 1);
        assert_eq!(device.destroy_log(), vec![DeviceObject::Fence(fence)]);
    }
}
