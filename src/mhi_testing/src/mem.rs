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

//! Device-visible memory arena.
//!
//! A single byte arena stands in for every piece of memory the host and the
//! device share: context arrays, rings, coherent buffers and DMA mappings. It is
//! addressed with device addresses starting at a nonzero base so a stray zero
//! pointer is caught as out of bounds.

use std::sync::Mutex;

use mhi_common::MemOps;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    #[error("access of {len} bytes at {addr:#x} is outside the arena")]
    OutOfBounds { addr: u64, len: usize },
    #[error("pointer access at {0:#x} is not 8-byte aligned")]
    Unaligned(u64),
}

/// First-fit free list over `[base, base + size)`, kept sorted and coalesced.
#[derive(Debug)]
struct FreeList {
    blocks: Vec<(u64, u64)>,
}

impl FreeList {
    fn new(base: u64, size: u64) -> Self {
        Self {
            blocks: vec![(base, size)],
        }
    }

    fn alloc(&mut self, len: u64, align: u64) -> Option<u64> {
        let align = align.max(1);
        let idx = self.blocks.iter().position(|&(start, size)| {
            let aligned = start.next_multiple_of(align);
            aligned + len <= start + size
        })?;

        let (start, size) = self.blocks.remove(idx);
        let aligned = start.next_multiple_of(align);
        let end = start + size;
        let mut insert_at = idx;
        if aligned > start {
            self.blocks.insert(insert_at, (start, aligned - start));
            insert_at += 1;
        }
        if aligned + len < end {
            self.blocks.insert(insert_at, (aligned + len, end - aligned - len));
        }
        Some(aligned)
    }

    fn free(&mut self, addr: u64, len: u64) {
        let idx = self.blocks.partition_point(|&(start, _)| start < addr);
        self.blocks.insert(idx, (addr, len));

        // merge with the following block, then with the preceding one
        if idx + 1 < self.blocks.len() {
            let (next_start, next_size) = self.blocks[idx + 1];
            if addr + len == next_start {
                self.blocks[idx].1 += next_size;
                self.blocks.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (prev_start, prev_size) = self.blocks[idx - 1];
            if prev_start + prev_size == addr {
                self.blocks[idx - 1].1 += self.blocks[idx].1;
                self.blocks.remove(idx);
            }
        }
    }

    fn free_bytes(&self) -> u64 {
        self.blocks.iter().map(|&(_, size)| size).sum()
    }
}

#[derive(Debug)]
pub struct DeviceMemory {
    base: u64,
    bytes: Mutex<Vec<u8>>,
    free: Mutex<FreeList>,
}

impl DeviceMemory {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            bytes: Mutex::new(vec![0; size]),
            free: Mutex::new(FreeList::new(base, size as u64)),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    /// Reserve `len` bytes aligned to `align`, zeroed.
    pub fn alloc(&self, len: usize, align: usize) -> Option<u64> {
        let len = len.max(1) as u64;
        let addr = self.free.lock().unwrap().alloc(len, align as u64)?;
        let off = (addr - self.base) as usize;
        self.bytes.lock().unwrap()[off..off + len as usize].fill(0);
        Some(addr)
    }

    pub fn free(&self, addr: u64, len: usize) {
        self.free.lock().unwrap().free(addr, len.max(1) as u64);
    }

    /// Bytes not handed out by [`alloc`](Self::alloc).
    pub fn free_bytes(&self) -> usize {
        self.free.lock().unwrap().free_bytes() as usize
    }

    fn range(&self, addr: u64, len: usize, arena_len: usize) -> Result<usize, MemError> {
        let oob = MemError::OutOfBounds { addr, len };
        let off = addr.checked_sub(self.base).ok_or(oob)? as usize;
        if off.checked_add(len).is_none_or(|end| end > arena_len) {
            return Err(oob);
        }
        Ok(off)
    }
}

impl MemOps for DeviceMemory {
    type Error = MemError;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let bytes = self.bytes.lock().unwrap();
        let off = self.range(addr, dst.len(), bytes.len())?;
        dst.copy_from_slice(&bytes[off..off + dst.len()]);
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        let mut bytes = self.bytes.lock().unwrap();
        let off = self.range(addr, src.len(), bytes.len())?;
        bytes[off..off + src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    // The arena lock orders every access, which is at least as strong as the
    // acquire/release pair the protocol asks for.
    fn load_acquire(&self, addr: u64) -> Result<u64, Self::Error> {
        if addr % 8 != 0 {
            return Err(MemError::Unaligned(addr));
        }
        self.read_val(addr)
    }

    fn store_release(&self, addr: u64, val: u64) -> Result<(), Self::Error> {
        if addr % 8 != 0 {
            return Err(MemError::Unaligned(addr));
        }
        self.write_val(addr, val)
    }
}
