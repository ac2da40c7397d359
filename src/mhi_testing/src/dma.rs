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

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mhi_common::{DmaDirection, DmaError, DmaOps, MemOps};

use crate::mem::DeviceMemory;

const MAP_ALIGN: usize = 16;

/// A DMA mapper without an IOMMU: every mapping is a copy into the arena.
///
/// Outstanding mappings and coherent allocations are tracked so tests can
/// check that teardown paths release everything they took.
#[derive(Debug)]
pub struct SimDma {
    mem: Arc<DeviceMemory>,
    mappings: Mutex<HashMap<u64, usize>>,
    coherent: Mutex<HashMap<u64, usize>>,
    fail_maps: AtomicBool,
}

impl SimDma {
    pub fn new(mem: Arc<DeviceMemory>) -> Self {
        Self {
            mem,
            mappings: Mutex::new(HashMap::new()),
            coherent: Mutex::new(HashMap::new()),
            fail_maps: AtomicBool::new(false),
        }
    }

    /// Make every following `map_single` fail until cleared.
    pub fn set_fail_maps(&self, fail: bool) {
        self.fail_maps.store(fail, Ordering::SeqCst);
    }

    pub fn mapped_count(&self) -> usize {
        self.mappings.lock().unwrap().len()
    }

    pub fn coherent_count(&self) -> usize {
        self.coherent.lock().unwrap().len()
    }
}

impl DmaOps for SimDma {
    fn alloc_coherent(&self, len: usize) -> Result<u64, DmaError> {
        let addr = self
            .mem
            .alloc(len, MAP_ALIGN)
            .ok_or(DmaError::OutOfMemory)?;
        self.coherent.lock().unwrap().insert(addr, len);
        Ok(addr)
    }

    fn free_coherent(&self, addr: u64, len: usize) {
        match self.coherent.lock().unwrap().remove(&addr) {
            Some(recorded) if recorded == len => self.mem.free(addr, len),
            Some(recorded) => {
                log::error!("coherent free of {addr:#x} with len {len}, allocated {recorded}");
                self.mem.free(addr, recorded);
            }
            None => log::error!("coherent free of unknown address {addr:#x}"),
        }
    }

    fn map_single(&self, buf: &[u8], dir: DmaDirection) -> Result<u64, DmaError> {
        if self.fail_maps.load(Ordering::SeqCst) {
            return Err(DmaError::MapFailed);
        }
        let addr = self
            .mem
            .alloc(buf.len(), MAP_ALIGN)
            .ok_or(DmaError::OutOfMemory)?;
        if dir != DmaDirection::FromDevice {
            self.mem.write(addr, buf).map_err(|_| DmaError::MapFailed)?;
        }
        self.mappings.lock().unwrap().insert(addr, buf.len());
        Ok(addr)
    }

    fn unmap_single(&self, addr: u64, buf: &mut [u8], dir: DmaDirection) {
        let Some(len) = self.mappings.lock().unwrap().remove(&addr) else {
            log::error!("unmap of unknown address {addr:#x}");
            return;
        };
        if dir.device_writes() {
            let n = len.min(buf.len());
            if let Err(e) = self.mem.read(addr, &mut buf[..n]) {
                log::error!("unmap copy back failed: {e}");
            }
        }
        self.mem.free(addr, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ARENA_BASE, ARENA_SIZE};

    #[test]
    fn test_map_copies_both_ways() {
        let mem = Arc::new(DeviceMemory::new(ARENA_BASE, ARENA_SIZE));
        let dma = SimDma::new(mem.clone());

        let addr = dma.map_single(b"hello", DmaDirection::ToDevice).unwrap();
        let mut seen = [0u8; 5];
        mem.read(addr, &mut seen).unwrap();
        assert_eq!(&seen, b"hello");
        dma.unmap_single(addr, &mut seen, DmaDirection::ToDevice);
        assert_eq!(dma.mapped_count(), 0);

        let mut rx = [0u8; 4];
        let addr = dma.map_single(&rx, DmaDirection::FromDevice).unwrap();
        mem.write(addr, b"abcd").unwrap();
        dma.unmap_single(addr, &mut rx, DmaDirection::FromDevice);
        assert_eq!(&rx, b"abcd");
        assert_eq!(mem.free_bytes(), ARENA_SIZE);
    }

    #[test]
    fn test_fail_maps() {
        let mem = Arc::new(DeviceMemory::new(ARENA_BASE, 0x100));
        let dma = SimDma::new(mem);
        dma.set_fail_maps(true);
        assert_eq!(
            dma.map_single(&[0; 8], DmaDirection::ToDevice),
            Err(DmaError::MapFailed)
        );
        dma.set_fail_maps(false);
        assert_eq!(
            dma.map_single(&[0; 0x200], DmaDirection::ToDevice),
            Err(DmaError::OutOfMemory)
        );
    }
}
