/*
Copyright 2026  The MHI Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Access traits for host/device shared state
//!
//! The ring code never touches memory or registers directly. Shared memory goes
//! through [`MemOps`], MMIO through [`RegisterIo`], and buffer mapping plus coherent
//! allocations through [`DmaOps`]. Backends decide what an address means: a real
//! IOMMU address, an offset into a mapped BAR, or an index into a simulated arena.

use bytemuck::Pod;
use thiserror::Error;

/// Backend-provided access to memory shared with the device.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Addresses passed to methods are valid for the duration of the call
/// - Memory ordering guarantees are upheld as documented
/// - Reads and writes don't cause undefined behavior (alignment, validity)
pub trait MemOps {
    type Error;

    /// Read bytes from device-visible memory.
    ///
    /// # Returns
    ///
    /// Number of bytes actually read (should equal `dst.len()` on success).
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write bytes to device-visible memory.
    ///
    /// # Returns
    ///
    /// Number of bytes actually written (should equal `src.len()` on success).
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Load a u64 with acquire semantics.
    ///
    /// Ring context pointers are the synchronization points between host and
    /// device: a side that observes a pointer through this load also observes
    /// every element written before the matching [`store_release`](Self::store_release).
    ///
    /// `addr` must be 8-byte aligned.
    fn load_acquire(&self, addr: u64) -> Result<u64, Self::Error>;

    /// Store a u64 with release semantics.
    ///
    /// `addr` must be 8-byte aligned.
    fn store_release(&self, addr: u64, val: u64) -> Result<(), Self::Error>;

    /// Read a Pod type at the given address.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod type at the given address.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }
}

/// 32-bit MMIO access to the device register space.
///
/// Addresses are absolute within the register space the backend maps, so a
/// doorbell at `chdb_base + 8 * chan` is passed through unchanged.
pub trait RegisterIo: Send + Sync {
    /// Read a register. A dead link typically reads back as all ones.
    fn read_u32(&self, addr: u64) -> u32;

    /// Write a register.
    fn write_u32(&self, addr: u64, val: u32);
}

/// Direction of a DMA transfer, from the host's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    /// Host to device (uplink).
    ToDevice,
    /// Device to host (downlink).
    FromDevice,
    /// Both directions, used by offload channels.
    Bidirectional,
}

impl DmaDirection {
    /// Whether the device writes into buffers of this direction.
    #[inline]
    pub fn device_writes(self) -> bool {
        matches!(self, DmaDirection::FromDevice | DmaDirection::Bidirectional)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    #[error("no device-visible memory available")]
    OutOfMemory,
    #[error("buffer could not be mapped for device access")]
    MapFailed,
}

/// The DMA mapping collaborator.
///
/// `map_single`/`unmap_single` give the device temporary access to a host buffer.
/// Backends without an IOMMU may bounce internally; in that case `unmap_single`
/// must copy device writes back into `buf` for [`DmaDirection::device_writes`]
/// directions.
pub trait DmaOps: Send + Sync {
    /// Allocate `len` bytes of memory coherent with the device, returning its
    /// device address. The memory is accessible through the controller's [`MemOps`].
    fn alloc_coherent(&self, len: usize) -> Result<u64, DmaError>;

    /// Release memory obtained from [`alloc_coherent`](Self::alloc_coherent).
    fn free_coherent(&self, addr: u64, len: usize);

    /// Map a host buffer for device access.
    fn map_single(&self, buf: &[u8], dir: DmaDirection) -> Result<u64, DmaError>;

    /// Tear down a mapping created by [`map_single`](Self::map_single).
    fn unmap_single(&self, addr: u64, buf: &mut [u8], dir: DmaDirection);
}
