//! Recorded GPU operations
//!
//! A [`GpuOp`] is the device-independent form of one `vkCmd*` call. The
//! sequencer builds an ordered list of them and each device encodes the list
//! into its command buffer, which keeps the recorded protocol inspectable.

use ash::vk;

/// Buffer-scoped memory dependency inside a pipeline barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl BufferBarrier {
    /// Barrier over `size` bytes at the start of `buffer`, without an
    /// ownership transfer
    pub fn same_queue(
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        queue_family: u32,
    ) -> Self {
        Self {
            buffer,
            offset: 0,
            size,
            src_access,
            dst_access,
            src_queue_family: queue_family,
            dst_queue_family: queue_family,
        }
    }

    pub fn is_ownership_transfer(&self) -> bool {
        self.src_queue_family != self.dst_queue_family
    }

    pub(crate) fn to_vk(&self) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
            .buffer(self.buffer)
            .offset(self.offset)
            .size(self.size)
    }
}

/// Byte range copied by a [`GpuOp::CopyBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: vk::DeviceSize,
    pub dst_offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl CopyRegion {
    pub(crate) fn to_vk(self) -> vk::BufferCopy {
        vk::BufferCopy {
            src_offset: self.src_offset,
            dst_offset: self.dst_offset,
            size: self.size,
        }
    }
}

/// One operation recorded into a primary command buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuOp {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: CopyRegion,
    },
    Barrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffers: Vec<BufferBarrier>,
    },
    BindComputePipeline {
        pipeline: vk::Pipeline,
    },
    BindDescriptorSet {
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    },
    Dispatch {
        groups_x: u32,
        groups_y: u32,
        groups_z: u32,
    },
}

impl GpuOp {
    pub fn copy(
        src: vk::Buffer,
        src_offset: vk::DeviceSize,
        dst: vk::Buffer,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Self {
        GpuOp::CopyBuffer {
            src,
            dst,
            region: CopyRegion {
                src_offset,
                dst_offset,
                size,
            },
        }
    }

    /// Short name used in trace output
    pub fn name(&self) -> &'static str {
        match self {
            GpuOp::CopyBuffer { .. } => "copy",
            GpuOp::Barrier { .. } => "barrier",
            GpuOp::BindComputePipeline { .. } => "bind-pipeline",
            GpuOp::BindDescriptorSet { .. } => "bind-descriptor-set",
            GpuOp::Dispatch { .. } => "dispatch",
        }
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self, GpuOp::Barrier { .. })
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(self, GpuOp::Dispatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_same_queue_barrier_has_no_ownership_transfer() {
        let barrier = BufferBarrier::same_queue(
            vk::Buffer::from_raw(7),
            256,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            2,
        );
        assert!(!barrier.is_ownership_transfer());

        let raw = barrier.to_vk();
        assert_eq!(raw.src_queue_family_index, 2);
        assert_eq!(raw.dst_queue_family_index, 2);
        assert_eq!(raw.size, 256);
        assert_eq!(raw.buffer, vk::Buffer::from_raw(7));
    }

    #[test]
    fn test_op_names() {
        let copy = GpuOp::copy(vk::Buffer::null(), 0, vk::Buffer::null(), 0, 4);
        assert_eq!(copy.name(), "copy");
        assert!(!copy.is_barrier());

        let dispatch = GpuOp::Dispatch {
            groups_x: 1,
            groups_y: 1,
            groups_z: 1,
        };
        assert!(dispatch.is_dispatch());
    }
}
