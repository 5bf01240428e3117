//! Command sequence of one run
//!
//! The recorded protocol is fixed:
//!
//! 1. copy staging -> source buffer (payload) and staging -> address table
//! 2. barrier transfer write -> shader read on both written buffers
//! 3. bind the compute pipeline and its descriptor set
//! 4. dispatch `ceil(elements / LOCAL_WORKGROUP_SIZE)` workgroups
//! 5. barrier shader write -> transfer read on the result buffer
//! 6. copy result buffer -> staging (payload)
//!
//! Both barriers stay on one queue family; leaving either out races the
//! transfer and compute stages.

use ash::vk;

use crate::backend::commands::{BufferBarrier, GpuOp};
use crate::backend::device::{ComputeDevice, DeviceObject};
use crate::compute::address::AddressTable;
use crate::compute::allocator::{RunBuffers, ADDRESS_TABLE_SIZE};
use crate::compute::program::ComputeProgram;
use crate::compute::scope::ResourceScope;
use crate::error::{ForgeError, ForgeResult};

/// `local_size_x` of the compute program
pub const LOCAL_WORKGROUP_SIZE: u32 = 1024;

/// Workgroups needed to cover `element_count` invocations
///
/// Rounds up; the program skips invocations past the element count.
pub fn workgroup_count(element_count: u32) -> u32 {
    element_count.div_ceil(LOCAL_WORKGROUP_SIZE)
}

/// Workgroups for `element_count`, or `CapabilityMissing` when a single
/// dispatch on this device cannot cover them
pub fn checked_workgroup_count(element_count: u32, max_groups_x: u32) -> ForgeResult<u32> {
    let groups = workgroup_count(element_count);
    if groups > max_groups_x {
        return Err(ForgeError::CapabilityMissing(format!(
            "dispatch of {} workgroups for {} elements (device allows {})",
            groups, element_count, max_groups_x
        )));
    }
    Ok(groups)
}

/// Ordered operations of one run, not yet recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSequence {
    ops: Vec<GpuOp>,
}

impl CommandSequence {
    pub fn build(
        buffers: &RunBuffers,
        program: &ComputeProgram,
        element_count: u32,
        queue_family: u32,
    ) -> Self {
        let payload = buffers.payload_size;
        let ops = vec![
            GpuOp::copy(
                buffers.staging.buffer,
                0,
                buffers.source.buffer,
                0,
                payload,
            ),
            GpuOp::copy(
                buffers.staging.buffer,
                buffers.table_region_offset(),
                buffers.address_table.buffer,
                0,
                ADDRESS_TABLE_SIZE,
            ),
            GpuOp::Barrier {
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                buffers: vec![
                    BufferBarrier::same_queue(
                        buffers.source.buffer,
                        buffers.source.size,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::SHADER_READ,
                        queue_family,
                    ),
                    BufferBarrier::same_queue(
                        buffers.address_table.buffer,
                        buffers.address_table.size,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::SHADER_READ,
                        queue_family,
                    ),
                ],
            },
            GpuOp::BindComputePipeline {
                pipeline: program.pipeline,
            },
            GpuOp::BindDescriptorSet {
                layout: program.pipeline_layout,
                set: program.descriptor_set,
            },
            GpuOp::Dispatch {
                groups_x: workgroup_count(element_count),
                groups_y: 1,
                groups_z: 1,
            },
            GpuOp::Barrier {
                src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
                buffers: vec![BufferBarrier::same_queue(
                    buffers.result.buffer,
                    buffers.result.size,
                    vk::AccessFlags::SHADER_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                    queue_family,
                )],
            },
            GpuOp::copy(
                buffers.result.buffer,
                0,
                buffers.staging.buffer,
                0,
                payload,
            ),
        ];
        Self { ops }
    }

    pub fn ops(&self) -> &[GpuOp] {
        &self.ops
    }

    pub fn barrier_count(&self) -> usize {
        self.ops.iter().filter(|op| op.is_barrier()).count()
    }

    pub fn dispatch_count(&self) -> usize {
        self.ops.iter().filter(|op| op.is_dispatch()).count()
    }
}

/// A command buffer holding a recorded [`CommandSequence`]
///
/// Recording has begun and every operation is in; ending the buffer is left
/// to the submission controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedSequence {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub op_count: usize,
}

/// Record `sequence` into a fresh command buffer
///
/// Takes the captured address table so nothing is recorded before the
/// addresses are in the staging buffer.
pub fn record_sequence<D: ComputeDevice + ?Sized>(
    scope: &mut ResourceScope<'_, D>,
    sequence: &CommandSequence,
    addresses: &AddressTable,
) -> ForgeResult<RecordedSequence> {
    if addresses.len() < 2 {
        return Err(ForgeError::InvalidConfiguration(format!(
            "address table has {} entries, the program reads 2",
            addresses.len()
        )));
    }
    let device = scope.device();

    let command_pool = device
        .create_command_pool()
        .map_err(ForgeError::allocation("command pool"))?;
    scope.adopt(DeviceObject::CommandPool(command_pool), "command pool");

    let command_buffer = device
        .allocate_command_buffer(command_pool)
        .map_err(ForgeError::allocation("command buffer"))?;

    device
        .begin_command_buffer(command_buffer)
        .map_err(ForgeError::RecordingFailed)?;
    for op in sequence.ops() {
        tracing::trace!("record_sequence: {}", op.name());
        device.record(command_buffer, op);
    }

    tracing::debug!("record_sequence: {} operations recorded", sequence.ops().len());
    Ok(RecordedSequence {
        command_pool,
        command_buffer,
        op_count: sequence.ops().len(),
    })
}
