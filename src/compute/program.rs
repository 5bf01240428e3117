//! Compute program binding
//!
//! Loads the SPIR-V binary and builds everything the dispatch needs: shader
//! module, descriptor set layout with one storage buffer at binding 0,
//! pipeline layout, compute pipeline with the element count as
//! specialization constant 0, and a descriptor set pointing at the address
//! table buffer.

use std::ffi::CStr;
use std::fs::File;
use std::path::Path;

use ash::vk;

use crate::backend::device::{ComputeDevice, ComputeStageDesc, DeviceObject};
use crate::compute::allocator::BufferResource;
use crate::compute::scope::ResourceScope;
use crate::error::{ForgeError, ForgeResult};

pub const ENTRY_POINT: &CStr = c"main";

/// Read a SPIR-V binary as 32-bit words
pub fn load_spirv(path: &Path) -> ForgeResult<Vec<u32>> {
    let mut file = File::open(path)
        .map_err(|e| ForgeError::ShaderLoadFailed(format!("{}: {}", path.display(), e)))?;
    let code = ash::util::read_spv(&mut file)
        .map_err(|e| ForgeError::ShaderLoadFailed(format!("{}: {}", path.display(), e)))?;
    tracing::debug!("load_spirv: {} words from {}", code.len(), path.display());
    Ok(code)
}

/// Pipeline objects of the doubling program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeProgram {
    pub module: vk::ShaderModule,
    pub set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_set: vk::DescriptorSet,
}

impl ComputeProgram {
    /// Create the pipeline for `element_count` elements and bind `table`
    /// at binding 0
    pub fn build<D: ComputeDevice + ?Sized>(
        scope: &mut ResourceScope<'_, D>,
        code: &[u32],
        element_count: u32,
        table: &BufferResource,
    ) -> ForgeResult<Self> {
        let device = scope.device();

        let module = device
            .create_shader_module(code)
            .map_err(ForgeError::allocation("shader module"))?;
        scope.adopt(DeviceObject::ShaderModule(module), "shader module");

        let set_layout = device
            .create_storage_set_layout()
            .map_err(ForgeError::allocation("descriptor set layout"))?;
        scope.adopt(
            DeviceObject::DescriptorSetLayout(set_layout),
            "descriptor set layout",
        );

        let pipeline_layout = device
            .create_pipeline_layout(set_layout)
            .map_err(ForgeError::allocation("pipeline layout"))?;
        scope.adopt(DeviceObject::PipelineLayout(pipeline_layout), "pipeline layout");

        let pipeline = device
            .create_compute_pipeline(&ComputeStageDesc {
                module,
                layout: pipeline_layout,
                entry_point: ENTRY_POINT,
                element_count,
            })
            .map_err(ForgeError::allocation("compute pipeline"))?;
        scope.adopt(DeviceObject::Pipeline(pipeline), "compute pipeline");

        let descriptor_pool = device
            .create_descriptor_pool()
            .map_err(ForgeError::allocation("descriptor pool"))?;
        scope.adopt(DeviceObject::DescriptorPool(descriptor_pool), "descriptor pool");

        let descriptor_set = device
            .allocate_descriptor_set(descriptor_pool, set_layout)
            .map_err(ForgeError::allocation("descriptor set"))?;
        device.write_storage_descriptor(descriptor_set, table.buffer, table.size);

        tracing::debug!(
            "ComputeProgram::build: pipeline ready, specialization constant 0 = {}",
            element_count
        );

        Ok(Self {
            module,
            set_layout,
            pipeline_layout,
            pipeline,
            descriptor_pool,
            descriptor_set,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareDevice;
    use crate::compute::allocator::ResourceAllocator;
    use std::io::Write;

    const SPIRV_STUB: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];

    #[test]
    fn test_load_spirv_reads_words() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for word in SPIRV_STUB {
            file.write_all(&word.to_le_bytes()).unwrap();
        }
        file.flush().unwrap();

        let code = load_spirv(file.path()).unwrap();
        assert_eq!(code, SPIRV_STUB.to_vec());
    }

    #[test]
    fn test_load_spirv_rejects_truncated_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x03, 0x02, 0x23]).unwrap();
        file.flush().unwrap();

        let err = load_spirv(file.path()).unwrap_err();
        assert!(matches!(err, ForgeError::ShaderLoadFailed(_)));
    }

    #[test]
    fn test_load_spirv_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_spirv(&dir.path().join("absent.spv")).unwrap_err();
        assert!(matches!(err, ForgeError::ShaderLoadFailed(_)));
    }

    #[test]
    fn test_build_adopts_every_object() {
        let device = SoftwareDevice::new();
        let mut scope = ResourceScope::new(&device);
        let buffers = ResourceAllocator::new(&mut scope).allocate(4096).unwrap();
        let before = scope.live();

        ComputeProgram::build(&mut scope, &SPIRV_STUB, 1024, &buffers.address_table).unwrap();
        assert_eq!(scope.live() - before, 5);
        assert_eq!(device.stats().usage_errors, 0);
    }

    #[test]
    fn test_pipeline_failure_names_resource() {
        let device = SoftwareDevice::new().with_failure(
            "vkCreateComputePipelines",
            1,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        );
        let mut scope = ResourceScope::new(&device);
        let buffers = ResourceAllocator::new(&mut scope).allocate(4096).unwrap();

        let err = ComputeProgram::build(&mut scope, &SPIRV_STUB, 1024, &buffers.address_table)
            .unwrap_err();
        assert!(matches!(
            err,
            ForgeError::AllocationFailed {
                resource: "compute pipeline",
                ..
            }
        ));
    }
}
