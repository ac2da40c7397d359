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

//! Ring Cursors
//!
//! A [`Ring`] tracks the local write and read cursors of a fixed-size circular
//! array of elements. Cursors are byte offsets from the start of the ring, so the
//! same arithmetic serves rings in device-visible memory (transfer, command and
//! event rings, addressed through `iommu_base`) and host-only side rings.
//!
//! # Full vs. empty
//!
//! The ring keeps one slot unused so that `wp == rp` always means empty:
//!
//! ```text
//!   empty:  wp == rp
//!   full:   wp + el_size (wrapped) == rp
//!
//!   ┌────┬────┬────┬────┐
//!   │    │ A  │ B  │ C  │   capacity 4, 3 usable slots
//!   └────┴────┴────┴────┘
//!     wp   rp                full: next(wp) == rp
//! ```
//!
//! # Event ring recycling
//!
//! Event rings are written by the device and consumed by the host. The host
//! keeps them perpetually full from the device's point of view: every consumed
//! element advances `rp`, `wp` and the device-visible context write pointer
//! together ([`Ring::recycle_event_slot`]). Timesync and bandwidth rings only care
//! about the newest event and jump straight to it with [`Ring::fast_forward`].

use thiserror::Error;

use crate::context::RingContext;
use crate::tre::Tre;
use crate::MemOps;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring is full")]
    Full,
    #[error("device address {0:#x} is outside the ring or unaligned")]
    OutOfRange(u64),
}

#[derive(Debug, Clone)]
pub struct Ring {
    /// Device address of the first element. Zero for host-only rings.
    iommu_base: u64,
    /// Ring length in bytes.
    len: usize,
    el_size: usize,
    /// Local write cursor, byte offset.
    wp: usize,
    /// Local read cursor, byte offset.
    rp: usize,
    /// Device address of this ring's [`RingContext`], if it has one.
    ctxt: Option<u64>,
}

impl Ring {
    /// A ring of `elements` TREs at device address `iommu_base`, described to the
    /// device by the context at `ctxt`.
    pub fn new(iommu_base: u64, elements: usize, ctxt: u64) -> Self {
        Self {
            iommu_base,
            len: elements * Tre::SIZE,
            el_size: Tre::SIZE,
            wp: 0,
            rp: 0,
            ctxt: Some(ctxt),
        }
    }

    /// Cursor-only ring for host bookkeeping that mirrors a device ring.
    pub fn host_only(elements: usize, el_size: usize) -> Self {
        Self {
            iommu_base: 0,
            len: elements * el_size,
            el_size,
            wp: 0,
            rp: 0,
            ctxt: None,
        }
    }

    #[inline]
    pub fn iommu_base(&self) -> u64 {
        self.iommu_base
    }

    /// Length in bytes.
    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn el_size(&self) -> usize {
        self.el_size
    }

    /// Number of element slots, including the one kept free.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.len / self.el_size
    }

    #[inline]
    pub fn wp(&self) -> usize {
        self.wp
    }

    #[inline]
    pub fn rp(&self) -> usize {
        self.rp
    }

    #[inline]
    pub fn wp_index(&self) -> usize {
        self.wp / self.el_size
    }

    #[inline]
    pub fn rp_index(&self) -> usize {
        self.rp / self.el_size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.wp == self.rp
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.next(self.wp) == self.rp
    }

    /// Offset of the slot after `offset`, wrapping at the end of the ring.
    #[inline]
    pub fn next(&self, offset: usize) -> usize {
        let next = offset + self.el_size;
        if next >= self.len { 0 } else { next }
    }

    /// Offset of the slot before `offset`, wrapping at the start of the ring.
    #[inline]
    pub fn prev(&self, offset: usize) -> usize {
        if offset == 0 {
            self.len - self.el_size
        } else {
            offset - self.el_size
        }
    }

    /// Move the write cursor one element forward.
    #[inline]
    pub fn advance_write(&mut self) {
        self.wp = self.next(self.wp);
    }

    /// Move the read cursor one element forward.
    #[inline]
    pub fn advance_read(&mut self) {
        self.rp = self.next(self.rp);
    }

    /// Free elements walking forward from `wp` to `rp`, minus the slot that keeps
    /// full and empty apart. Never exceeds `capacity() - 1`.
    pub fn available_slots(&self) -> usize {
        if self.wp < self.rp {
            (self.rp - self.wp) / self.el_size - 1
        } else {
            self.rp / self.el_size + (self.len - self.wp) / self.el_size - 1
        }
    }

    /// Elements written but not yet read.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.capacity() - 1 - self.available_slots()
    }

    /// Forget every outstanding element and restart both cursors at the base.
    #[inline]
    pub fn reset_cursors(&mut self) {
        self.wp = 0;
        self.rp = 0;
    }

    /// Translate a local offset into a device address.
    #[inline]
    pub fn to_device_address(&self, offset: usize) -> u64 {
        self.iommu_base + offset as u64
    }

    /// Translate a device address back into a local offset. Addresses outside the
    /// ring or not on an element boundary are rejected.
    pub fn to_local_offset(&self, addr: u64) -> Result<usize, RingError> {
        if addr < self.iommu_base || addr >= self.iommu_base + self.len as u64 {
            return Err(RingError::OutOfRange(addr));
        }
        let offset = (addr - self.iommu_base) as usize;
        if offset % self.el_size != 0 {
            return Err(RingError::OutOfRange(addr));
        }
        Ok(offset)
    }

    /// Device address of the context write pointer this ring keeps in sync.
    #[inline]
    pub fn ctxt_wp_addr(&self) -> Option<u64> {
        self.ctxt.map(|c| c + RingContext::WP_OFFSET as u64)
    }

    /// Device address of the context read pointer.
    #[inline]
    pub fn ctxt_rp_addr(&self) -> Option<u64> {
        self.ctxt.map(|c| c + RingContext::RP_OFFSET as u64)
    }

    /// Read the element at `offset`.
    pub fn read_element<M: MemOps>(&self, mem: &M, offset: usize) -> Result<Tre, M::Error> {
        Tre::read_from(mem, self.to_device_address(offset))
    }

    /// Write the element at `offset`. Not visible to the device until published.
    pub fn write_element<M: MemOps>(
        &self,
        mem: &M,
        offset: usize,
        tre: &Tre,
    ) -> Result<(), M::Error> {
        tre.write_to(mem, self.to_device_address(offset))
    }

    /// Publish the local write cursor to the context with release semantics and
    /// return the device address written, which is also the doorbell value.
    pub fn publish_wp<M: MemOps>(&self, mem: &M) -> Result<u64, M::Error> {
        let db = self.to_device_address(self.wp);
        if let Some(addr) = self.ctxt_wp_addr() {
            mem.store_release(addr, db)?;
        }
        Ok(db)
    }

    /// Load the pointer the device publishes in the context `rp` field.
    pub fn load_device_rp<M: MemOps>(&self, mem: &M) -> Result<Option<u64>, M::Error> {
        match self.ctxt_rp_addr() {
            Some(addr) => mem.load_acquire(addr).map(Some),
            None => Ok(None),
        }
    }

    /// Load the context write pointer.
    pub fn load_ctxt_wp<M: MemOps>(&self, mem: &M) -> Result<Option<u64>, M::Error> {
        match self.ctxt_wp_addr() {
            Some(addr) => mem.load_acquire(addr).map(Some),
            None => Ok(None),
        }
    }

    /// Hand every slot but one to the device: `wp` moves to the last slot and the
    /// context write pointer follows. Used when an event ring is (re)armed.
    pub fn prime_event_ring<M: MemOps>(&mut self, mem: &M) -> Result<u64, M::Error> {
        self.rp = 0;
        self.wp = self.len - self.el_size;
        self.publish_wp(mem)
    }

    /// Consume one event ring element and give its slot back to the device.
    pub fn recycle_event_slot<M: MemOps>(&mut self, mem: &M) -> Result<(), M::Error> {
        self.wp += self.el_size;
        if let Some(addr) = self.ctxt_wp_addr() {
            let mut ctxt_wp = mem.load_acquire(addr)? + self.el_size as u64;
            if self.wp >= self.len {
                self.wp = 0;
                ctxt_wp = self.iommu_base;
            }
            mem.store_release(addr, ctxt_wp)?;
        } else if self.wp >= self.len {
            self.wp = 0;
        }

        self.advance_read();
        Ok(())
    }

    /// Like [`recycle_event_slot`](Self::recycle_event_slot), but derives the
    /// context write pointer from the local one so a fast-forwarded ring stays
    /// consistent.
    pub fn recycle_forward<M: MemOps>(&mut self, mem: &M) -> Result<(), M::Error> {
        self.advance_write();
        self.publish_wp(mem)?;
        self.advance_read();
        Ok(())
    }

    /// Skip to the newest element before the device write position `dev_wp`
    /// (a local offset) and recycle everything up to it in one step.
    ///
    /// Returns the offset of the newest element, which the caller processes. On
    /// return `rp == dev_wp`.
    pub fn fast_forward<M: MemOps>(&mut self, mem: &M, dev_wp: usize) -> Result<usize, M::Error> {
        let newest = self.prev(dev_wp);
        self.rp = newest;
        self.wp = self.prev(newest);
        self.recycle_forward(mem)?;
        Ok(newest)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use core::cell::RefCell;
    use std::collections::HashMap;

    use super::*;

    /// Sparse byte-addressed memory for cursor tests.
    #[derive(Default)]
    pub(crate) struct TestMem {
        bytes: RefCell<HashMap<u64, u8>>,
    }

    impl MemOps for TestMem {
        type Error = core::convert::Infallible;

        fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
            let bytes = self.bytes.borrow();
            for (i, b) in dst.iter_mut().enumerate() {
                *b = bytes.get(&(addr + i as u64)).copied().unwrap_or(0);
            }
            Ok(dst.len())
        }

        fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
            let mut bytes = self.bytes.borrow_mut();
            for (i, b) in src.iter().enumerate() {
                bytes.insert(addr + i as u64, *b);
            }
            Ok(src.len())
        }

        fn load_acquire(&self, addr: u64) -> Result<u64, Self::Error> {
            self.read_val(addr)
        }

        fn store_release(&self, addr: u64, val: u64) -> Result<(), Self::Error> {
            self.write_val(addr, val)
        }
    }

    const BASE: u64 = 0x4000;
    const CTXT: u64 = 0x100;

    #[test]
    fn test_capacity_four_has_three_usable_slots() {
        let mut ring = Ring::new(BASE, 4, CTXT);
        assert_eq!(ring.available_slots(), 3);
        for _ in 0..3 {
            assert!(!ring.is_full());
            ring.advance_write();
        }
        assert!(ring.is_full());
        assert_eq!(ring.available_slots(), 0);

        ring.advance_read();
        assert!(!ring.is_full());
        assert_eq!(ring.available_slots(), 1);
    }

    #[test]
    fn test_wrap_preserves_order() {
        let mem = TestMem::default();
        let mut ring = Ring::new(BASE, 4, CTXT);

        // move the cursors near the end so the next writes cross the wrap
        for _ in 0..3 {
            ring.advance_write();
            ring.advance_read();
        }

        for i in 0..3u64 {
            let tre = Tre {
                ptr: 0x100 + i,
                dword: [0, 0],
            };
            ring.write_element(&mem, ring.wp(), &tre).unwrap();
            ring.advance_write();
        }
        assert!(ring.is_full());

        for i in 0..3u64 {
            let tre = ring.read_element(&mem, ring.rp()).unwrap();
            assert_eq!(tre.ptr, 0x100 + i);
            ring.advance_read();
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_address_translation() {
        let ring = Ring::new(BASE, 8, CTXT);
        assert_eq!(ring.to_device_address(0x20), BASE + 0x20);
        assert_eq!(ring.to_local_offset(BASE + 0x30), Ok(0x30));
        assert_eq!(
            ring.to_local_offset(BASE + 0x31),
            Err(RingError::OutOfRange(BASE + 0x31))
        );
        assert_eq!(
            ring.to_local_offset(BASE + 8 * 16),
            Err(RingError::OutOfRange(BASE + 8 * 16))
        );
        assert_eq!(
            ring.to_local_offset(BASE - 16),
            Err(RingError::OutOfRange(BASE - 16))
        );
    }

    #[test]
    fn test_publish_wp_updates_context() {
        let mem = TestMem::default();
        let mut ring = Ring::new(BASE, 8, CTXT);
        ring.advance_write();
        ring.advance_write();
        let db = ring.publish_wp(&mem).unwrap();
        assert_eq!(db, BASE + 32);
        assert_eq!(ring.load_ctxt_wp(&mem).unwrap(), Some(BASE + 32));
    }

    #[test]
    fn test_event_recycling_keeps_ring_full() {
        let mem = TestMem::default();
        let mut ring = Ring::new(BASE, 4, CTXT);
        ring.prime_event_ring(&mem).unwrap();
        assert_eq!(ring.rp(), 0);
        assert_eq!(ring.wp(), 48);
        assert_eq!(ring.load_ctxt_wp(&mem).unwrap(), Some(BASE + 48));

        for _ in 0..9 {
            ring.recycle_event_slot(&mem).unwrap();
            // the slot just consumed becomes the device's limit
            assert!(ring.is_full());
            assert_eq!(
                ring.load_ctxt_wp(&mem).unwrap(),
                Some(ring.to_device_address(ring.wp()))
            );
        }
    }

    #[test]
    fn test_fast_forward_to_newest() {
        let mem = TestMem::default();
        let mut ring = Ring::new(BASE, 8, CTXT);
        ring.prime_event_ring(&mem).unwrap();

        // device wrote three events, its write position is slot 3
        let newest = ring.fast_forward(&mem, 3 * 16).unwrap();
        assert_eq!(newest, 2 * 16);
        assert_eq!(ring.rp(), 3 * 16);
        assert_eq!(ring.wp(), 2 * 16);
        assert_eq!(ring.load_ctxt_wp(&mem).unwrap(), Some(BASE + 2 * 16));

        // device position wrapped to the start, the newest element is the last slot
        let newest = ring.fast_forward(&mem, 0).unwrap();
        assert_eq!(newest, 7 * 16);
        assert_eq!(ring.rp(), 0);
    }

    #[test]
    fn test_host_only_ring() {
        let mut ring = Ring::host_only(4, 40);
        assert_eq!(ring.capacity(), 4);
        ring.advance_write();
        assert_eq!(ring.wp(), 40);
        assert_eq!(ring.wp_index(), 1);
        assert_eq!(ring.ctxt_wp_addr(), None);
    }
}

#[cfg(test)]
mod fuzz {
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::*;

    const MAX_RING: usize = 64;
    const MAX_OPS: usize = 256;

    #[derive(Clone, Debug)]
    enum Op {
        Write,
        Read,
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            if bool::arbitrary(g) { Op::Write } else { Op::Read }
        }
    }

    #[derive(Clone, Debug)]
    struct Scenario {
        elements: usize,
        ops: Vec<Op>,
    }

    impl Arbitrary for Scenario {
        fn arbitrary(g: &mut Gen) -> Self {
            let elements = usize::arbitrary(g) % (MAX_RING - 1) + 2;
            let num_ops = usize::arbitrary(g) % MAX_OPS + 1;
            let ops = (0..num_ops).map(|_| Op::arbitrary(g)).collect();
            Scenario { elements, ops }
        }
    }

    /// Writes only when a slot is free, reads only when something is outstanding,
    /// and checks the free count against a model counter after every step.
    fn run_scenario(s: Scenario) -> bool {
        let mut ring = Ring::host_only(s.elements, 16);
        let mut outstanding = 0usize;

        for op in &s.ops {
            match op {
                Op::Write => {
                    if ring.available_slots() > 0 {
                        ring.advance_write();
                        outstanding += 1;
                    } else if !ring.is_full() {
                        return false;
                    }
                }
                Op::Read => {
                    if !ring.is_empty() {
                        ring.advance_read();
                        outstanding -= 1;
                    }
                }
            }

            let free = ring.available_slots();
            if free > ring.capacity() - 1 {
                return false;
            }
            if free + outstanding != ring.capacity() - 1 {
                return false;
            }
            if ring.is_empty() != (outstanding == 0) {
                return false;
            }
        }
        true
    }

    #[test]
    fn prop_capacity_invariant() {
        #[cfg(miri)]
        let tests = 10;
        #[cfg(not(miri))]
        let tests = 500;

        QuickCheck::new()
            .tests(tests)
            .quickcheck(run_scenario as fn(Scenario) -> bool);
    }
}
