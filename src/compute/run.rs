//! One compute run from allocation to verification
//!
//! [`ComputeRun`] carries the device and configuration through every stage
//! and owns the single [`ResourceScope`]. Any fatal error returns early and
//! the scope releases what was created, newest first.

use std::time::Instant;

use serde::Serialize;

use crate::backend::device::{AddressSource, ComputeDevice};
use crate::compute::address::{capture_addresses, AddressTable};
use crate::compute::allocator::{initialize_staging, ResourceAllocator, RunBuffers};
use crate::compute::program::{load_spirv, ComputeProgram};
use crate::compute::scope::ResourceScope;
use crate::compute::sequencer::{checked_workgroup_count, record_sequence, CommandSequence};
use crate::compute::submission::SubmissionController;
use crate::compute::verify::{verify_staging, VerificationReport};
use crate::config::RunConfig;
use crate::error::{ForgeError, ForgeResult};

/// Memory type chosen for each allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryTypeChoice {
    pub staging: u32,
    pub working: u32,
    pub address_table: u32,
}

/// Everything a completed run reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub element_count: u32,
    pub payload_bytes: u64,
    pub staging_bytes: u64,
    pub working_bytes: u64,
    pub workgroups: u32,
    pub memory_types: MemoryTypeChoice,
    pub address_source: Option<AddressSource>,
    pub addresses: AddressTable,
    pub wait_ms: f64,
    pub total_ms: f64,
    pub verification: VerificationReport,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verification.passed()
    }
}

/// A single run against one device
pub struct ComputeRun<'d, D: ComputeDevice + ?Sized> {
    device: &'d D,
    config: RunConfig,
}

impl<'d, D: ComputeDevice + ?Sized> ComputeRun<'d, D> {
    pub fn new(device: &'d D, config: RunConfig) -> Self {
        Self { device, config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Load the configured SPIR-V and execute
    pub fn run(&self) -> ForgeResult<RunReport> {
        let code = stage("load compute program", load_spirv(&self.config.shader_path))?;
        self.execute(&code)
    }

    /// Execute with an already loaded SPIR-V binary
    pub fn execute(&self, code: &[u32]) -> ForgeResult<RunReport> {
        let started = Instant::now();
        stage("validate configuration", self.config.validate())?;

        let element_count = self.config.element_count;
        let workgroups = stage(
            "check dispatch limits",
            checked_workgroup_count(element_count, self.device.max_workgroup_count_x()),
        )?;
        let mut scope = ResourceScope::new(self.device);

        let buffers = stage(
            "allocate buffers",
            ResourceAllocator::new(&mut scope).allocate(self.config.payload_size()),
        )?;

        let addresses = stage("capture addresses", self.capture(&buffers))?;

        let program = stage(
            "build compute program",
            ComputeProgram::build(&mut scope, code, element_count, &buffers.address_table),
        )?;

        let sequence = CommandSequence::build(
            &buffers,
            &program,
            element_count,
            self.device.queue_family_index(),
        );
        let recorded = stage(
            "record commands",
            record_sequence(&mut scope, &sequence, &addresses),
        )?;

        let mut controller = SubmissionController::new(recorded.command_buffer);
        stage(
            "submit and wait",
            controller.run(&mut scope, self.config.wait_timeout),
        )?;

        let verification = stage(
            "verify result",
            verify_staging(self.device, &buffers, element_count),
        )?;
        if let Some(err) = verification.to_error() {
            tracing::warn!("ComputeRun: {}", err);
        }

        let released = scope.release_all();
        tracing::debug!("ComputeRun: released {} objects", released);

        Ok(RunReport {
            element_count,
            payload_bytes: buffers.payload_size,
            staging_bytes: buffers.staging.size,
            working_bytes: buffers.working_memory.size,
            workgroups,
            memory_types: MemoryTypeChoice {
                staging: buffers.staging_memory.memory_type_index,
                working: buffers.working_memory.memory_type_index,
                address_table: buffers.table_memory.memory_type_index,
            },
            address_source: self.device.address_source(),
            addresses,
            wait_ms: controller
                .waited()
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or_default(),
            total_ms: started.elapsed().as_secs_f64() * 1000.0,
            verification,
        })
    }

    /// Fill staging, capture addresses, unmap
    fn capture(&self, buffers: &RunBuffers) -> ForgeResult<AddressTable> {
        let mut staging = initialize_staging(self.device, buffers)?;
        capture_addresses(self.device, buffers, &mut staging)
    }
}

/// Log the outcome of one pipeline stage
fn stage<T>(name: &str, result: ForgeResult<T>) -> ForgeResult<T> {
    match &result {
        Ok(_) => tracing::info!("{}: ok", name),
        Err(e) => match e.status_code() {
            Some(code) => tracing::error!("{}: failed with status {}: {}", name, code, e),
            None => tracing::error!("{}: failed: {}", name, e),
        },
    }
    result
}
