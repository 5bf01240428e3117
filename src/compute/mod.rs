//! Resource allocation, address capture and synchronization pipeline

pub mod address;
pub mod allocator;
pub mod memory_type;
pub mod program;
pub mod run;
pub mod scope;
pub mod sequencer;
pub mod submission;
pub mod verify;

pub use address::{capture_addresses, AddressTable};
pub use allocator::{
    initialize_staging, BufferResource, MemoryBlock, ResourceAllocator, RunBuffers,
    ADDRESS_TABLE_SIZE,
};
pub use memory_type::{select_memory_type, MemoryHeapInfo, MemoryTable, MemoryTypeInfo};
pub use program::{load_spirv, ComputeProgram};
pub use run::{ComputeRun, MemoryTypeChoice, RunReport};
pub use scope::{MappedMemory, ResourceScope, ScopeSlot};
pub use sequencer::{
    checked_workgroup_count, record_sequence, workgroup_count, CommandSequence, RecordedSequence,
    LOCAL_WORKGROUP_SIZE,
};
pub use submission::{SubmissionController, SubmissionState};
pub use verify::{verify_elements, verify_staging, Mismatch, VerificationReport};
