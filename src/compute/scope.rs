//! Scoped acquisition of device objects
//!
//! Every object a run creates is adopted by one [`ResourceScope`]. On any
//! exit path the scope destroys what it holds in reverse slot order. Each
//! slot is cleared once released, so releasing again is a no-op and slots
//! that never received an object are skipped.
//!
//! Memory that backs buffers reserves its slot before the buffers are
//! created, which puts it behind them in release order.

use std::ptr::NonNull;

use ash::vk;

use crate::backend::device::{ComputeDevice, DeviceObject};
use crate::error::{ForgeError, ForgeResult};

/// Handle to one slot of a [`ResourceScope`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeSlot(usize);

#[derive(Debug)]
struct Slot {
    label: &'static str,
    object: Option<DeviceObject>,
}

/// Ordered release list bound to one device
pub struct ResourceScope<'d, D: ComputeDevice + ?Sized> {
    device: &'d D,
    slots: Vec<Slot>,
}

impl<'d, D: ComputeDevice + ?Sized> ResourceScope<'d, D> {
    pub fn new(device: &'d D) -> Self {
        Self {
            device,
            slots: Vec::new(),
        }
    }

    pub fn device(&self) -> &'d D {
        self.device
    }

    /// Take ownership of a freshly created object
    pub fn adopt(&mut self, object: DeviceObject, label: &'static str) -> ScopeSlot {
        let slot = self.reserve(label);
        self.fill(slot, object);
        slot
    }

    /// Claim a release position for an object that is created later
    pub fn reserve(&mut self, label: &'static str) -> ScopeSlot {
        self.slots.push(Slot {
            label,
            object: None,
        });
        ScopeSlot(self.slots.len() - 1)
    }

    /// Place `object` into a reserved slot
    ///
    /// A slot that already holds an object keeps it and `object` is destroyed
    /// right away, so nothing leaks.
    pub fn fill(&mut self, slot: ScopeSlot, object: DeviceObject) {
        match self.slots.get_mut(slot.0) {
            Some(entry) if entry.object.is_none() => {
                tracing::trace!("ResourceScope::fill: {} ({})", entry.label, object.kind());
                entry.object = Some(object);
            }
            _ => {
                tracing::warn!("ResourceScope::fill: slot {:?} unavailable", slot);
                self.device.destroy(object);
            }
        }
    }

    /// Destroy the object in `slot` ahead of the rest of the scope
    ///
    /// Returns false if the slot was empty or already released.
    pub fn release(&mut self, slot: ScopeSlot) -> bool {
        let Some(entry) = self.slots.get_mut(slot.0) else {
            return false;
        };
        match entry.object.take() {
            Some(object) => {
                tracing::debug!("ResourceScope::release: destroying {}", entry.label);
                self.device.destroy(object);
                true
            }
            None => false,
        }
    }

    /// Destroy everything still held, newest slot first
    ///
    /// Returns how many objects were destroyed by this call.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for entry in self.slots.iter_mut().rev() {
            if let Some(object) = entry.object.take() {
                tracing::debug!("ResourceScope::release_all: destroying {}", entry.label);
                self.device.destroy(object);
                released += 1;
            }
        }
        released
    }

    /// Number of objects not yet released
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }

    /// Labels of held objects in slot order
    pub fn labels(&self) -> Vec<&'static str> {
        self.slots
            .iter()
            .filter(|s| s.object.is_some())
            .map(|s| s.label)
            .collect()
    }
}

impl<D: ComputeDevice + ?Sized> Drop for ResourceScope<'_, D> {
    fn drop(&mut self) {
        let released = self.release_all();
        if released > 0 {
            tracing::debug!("ResourceScope dropped, released {} objects", released);
        }
    }
}

/// Host mapping of device memory, unmapped on drop
pub struct MappedMemory<'d, D: ComputeDevice + ?Sized> {
    device: &'d D,
    memory: vk::DeviceMemory,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'d, D: ComputeDevice + ?Sized> MappedMemory<'d, D> {
    /// Map `len` bytes of `memory` starting at `offset`
    pub fn map(
        device: &'d D,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        resource: &'static str,
    ) -> ForgeResult<Self> {
        let len = usize::try_from(len)
            .map_err(|_| ForgeError::InvalidConfiguration(format!("mapping of {len} bytes")))?;
        let ptr = device
            .map_memory(memory, offset, len as vk::DeviceSize)
            .map_err(ForgeError::allocation(resource))?;
        Ok(Self {
            device,
            memory,
            ptr,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the device mapped `len` bytes at `ptr` and keeps them mapped
        // until this guard is dropped
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`; `&mut self` makes the view unique
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// The mapping viewed as 32-bit words; trailing bytes are excluded
    pub fn words(&self) -> ForgeResult<&[u32]> {
        let whole = self.len - self.len % 4;
        bytemuck::try_cast_slice(&self.bytes()[..whole]).map_err(word_view_error)
    }

    pub fn words_mut(&mut self) -> ForgeResult<&mut [u32]> {
        let whole = self.len - self.len % 4;
        bytemuck::try_cast_slice_mut(&mut self.bytes_mut()[..whole]).map_err(word_view_error)
    }
}

fn word_view_error(err: bytemuck::PodCastError) -> ForgeError {
    ForgeError::CapabilityMissing(format!("32-bit view of mapped memory: {:?}", err))
}

impl<D: ComputeDevice + ?Sized> Drop for MappedMemory<'_, D> {
    fn drop(&mut self) {
        self.device.unmap_memory(self.memory);
    }
}
