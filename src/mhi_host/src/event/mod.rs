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

//! Event rings.
//!
//! The device writes at the context read pointer and advances it; the host
//! consumes from its local read pointer up to there and hands each slot back
//! by moving the context write pointer one element forward. The device may
//! write as long as its read pointer differs from the write pointer, so one
//! slot always stays empty.
//!
//! The interrupt path only touches the atomics of an [`EventRing`]: the
//! context address and the host read pointer are mirrored there so an
//! interrupt can tell whether work is pending without taking a lock.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use mhi_common::context::ER_TYPE_VALID;
use mhi_common::{DmaOps, Event, MemOps, Ring, RingContext, Tre};

use crate::config::EventRingConfig;
use crate::error::{MhiError, Result, SharedMemResult};
use crate::regs::Mmio;

/// Control ring handling: state changes, EE changes and command completions.
pub(crate) mod ctrl;
/// Transfer completion handling.
pub(crate) mod data;

/// Label of `event` in the events processed counter.
pub(crate) fn kind(event: &Event) -> &'static str {
    match event {
        Event::StateChange(_) => "state_change",
        Event::CommandCompletion { .. } => "command_completion",
        Event::ExecEnvChange(_) => "ee_change",
        Event::Transfer { .. } => "transfer",
        Event::RscTransfer { .. } => "rsc_transfer",
        Event::TimeSync { .. } => "timesync",
        Event::BandwidthRequest { .. } => "bw_request",
        Event::Stale { .. } => "stale",
    }
}

#[derive(Debug, Default)]
pub(crate) struct ErState {
    pub(crate) ring: Option<Ring>,
    /// Raw copy of the element handled last.
    pub(crate) last: Option<Tre>,
}

#[derive(Debug)]
pub(crate) struct EventRing {
    pub(crate) index: usize,
    pub(crate) cfg: EventRingConfig,
    pub(crate) state: Mutex<ErState>,
    /// Device address of the context, zero while unallocated.
    ctxt: AtomicU64,
    /// Device address of the host read pointer.
    local_rp: AtomicU64,
    db_addr: AtomicU64,
    /// Set while a run of this ring is queued on the event worker.
    pub(crate) scheduled: AtomicBool,
}

impl EventRing {
    pub(crate) fn new(index: usize, cfg: EventRingConfig) -> Self {
        Self {
            index,
            cfg,
            state: Mutex::new(ErState::default()),
            ctxt: AtomicU64::new(0),
            local_rp: AtomicU64::new(0),
            db_addr: AtomicU64::new(0),
            scheduled: AtomicBool::new(false),
        }
    }

    pub(crate) fn last_event(&self) -> Option<Tre> {
        self.state.lock().ok()?.last
    }

    /// Allocate the ring memory. The ring is handed to the device by [`arm`](Self::arm).
    pub(crate) fn setup(&self, dma: &dyn DmaOps, ctxt: u64, db_addr: u64) -> Result<()> {
        let mut st = self.state.lock()?;
        if st.ring.is_some() {
            return Err(MhiError::InvalidState(format!(
                "event ring {} is already set up",
                self.index
            )));
        }
        let base = dma.alloc_coherent(self.cfg.elements * Tre::SIZE)?;
        st.ring = Some(Ring::new(base, self.cfg.elements, ctxt));
        st.last = None;
        self.db_addr.store(db_addr, Ordering::Release);
        Ok(())
    }

    /// Write a fresh context and give every slot but one to the device.
    /// Returns the doorbell value.
    pub(crate) fn arm<M: MemOps<Error: std::fmt::Debug>>(&self, mem: &M) -> Result<u64> {
        let mut st = self.state.lock()?;
        let ring = st.ring.as_mut().ok_or_else(|| {
            MhiError::InvalidState(format!("event ring {} is not set up", self.index))
        })?;
        let base = ring.iommu_base();
        let ctxt = ring
            .ctxt_rp_addr()
            .map(|rp| rp - RingContext::RP_OFFSET as u64)
            .unwrap_or_default();
        let rc = RingContext::new(
            0,
            ER_TYPE_VALID,
            self.cfg.irq,
            base,
            ring.len_bytes() as u64,
        );
        mem.write_val(ctxt, rc).shm(ctxt)?;
        let db = ring.prime_event_ring(mem).shm(ctxt)?;
        self.local_rp.store(base, Ordering::Release);
        self.ctxt.store(ctxt, Ordering::Release);
        Ok(db)
    }

    /// Release the ring memory.
    pub(crate) fn teardown(&self, dma: &dyn DmaOps) {
        self.ctxt.store(0, Ordering::Release);
        self.local_rp.store(0, Ordering::Release);
        self.scheduled.store(false, Ordering::Release);
        match self.state.lock() {
            Ok(mut st) => {
                if let Some(ring) = st.ring.take() {
                    dma.free_coherent(ring.iommu_base(), ring.len_bytes());
                }
            }
            Err(e) => log::error!("event ring {} leaked: {e}", self.index),
        }
    }

    /// Whether the device wrote past the host read pointer. Lock free, for the
    /// interrupt path.
    pub(crate) fn has_pending<M: MemOps>(&self, mem: &M) -> bool {
        let ctxt = self.ctxt.load(Ordering::Acquire);
        if ctxt == 0 {
            return false;
        }
        match mem.load_acquire(ctxt + RingContext::RP_OFFSET as u64) {
            Ok(dev_rp) => dev_rp != self.local_rp.load(Ordering::Acquire),
            Err(_) => false,
        }
    }

    /// Tell the device how far the host has consumed.
    pub(crate) fn ring_db<M: MemOps>(&self, mmio: &Mmio, mem: &M) {
        let ctxt = self.ctxt.load(Ordering::Acquire);
        if ctxt == 0 {
            return;
        }
        match mem.load_acquire(ctxt + RingContext::WP_OFFSET as u64) {
            Ok(wp) => mmio.write_db("event", self.db_addr.load(Ordering::Acquire), wp),
            Err(_) => log::error!("event ring {} context is unreadable", self.index),
        }
    }

    /// Host read offset and device write offset of a ring, `None` when caught up.
    fn bounds<M: MemOps<Error: std::fmt::Debug>>(
        ring: &Ring,
        mem: &M,
    ) -> Result<Option<usize>> {
        let Some(dev_rp) = ring.load_device_rp(mem).shm(ring.iommu_base())? else {
            return Ok(None);
        };
        let dev = ring.to_local_offset(dev_rp).map_err(|e| {
            MhiError::ProtocolViolation(format!("event ring read pointer: {e}"))
        })?;
        Ok((dev != ring.rp()).then_some(dev))
    }

    /// Take the oldest unread element and give its slot back to the device.
    pub(crate) fn pull_locked<M: MemOps<Error: std::fmt::Debug>>(
        &self,
        st: &mut ErState,
        mem: &M,
    ) -> Result<Option<Tre>> {
        let Some(ring) = st.ring.as_mut() else {
            return Ok(None);
        };
        if Self::bounds(ring, mem)?.is_none() {
            return Ok(None);
        }
        let tre = ring.read_element(mem, ring.rp()).shm(ring.to_device_address(ring.rp()))?;
        ring.recycle_event_slot(mem).shm(ring.iommu_base())?;
        self.local_rp
            .store(ring.to_device_address(ring.rp()), Ordering::Release);
        st.last = Some(tre);
        Ok(Some(tre))
    }

    /// [`pull_locked`](Self::pull_locked) for callers that do not keep the lock
    /// while handling the element.
    pub(crate) fn pull<M: MemOps<Error: std::fmt::Debug>>(&self, mem: &M) -> Result<Option<Tre>> {
        let mut st = self.state.lock()?;
        self.pull_locked(&mut st, mem)
    }

    /// Skip to the newest element, recycling everything before it. Rings where
    /// only the latest report matters use this.
    pub(crate) fn take_newest<M: MemOps<Error: std::fmt::Debug>>(
        &self,
        mem: &M,
    ) -> Result<Option<Tre>> {
        let mut st = self.state.lock()?;
        let Some(ring) = st.ring.as_mut() else {
            return Ok(None);
        };
        let Some(dev) = Self::bounds(ring, mem)? else {
            return Ok(None);
        };
        let newest = ring.prev(dev);
        let tre = ring
            .read_element(mem, newest)
            .shm(ring.to_device_address(newest))?;
        ring.fast_forward(mem, dev).shm(ring.iommu_base())?;
        self.local_rp
            .store(ring.to_device_address(ring.rp()), Ordering::Release);
        st.last = Some(tre);
        Ok(Some(tre))
    }

    /// Overwrite unread transfer events of channel `chan` with stale markers so
    /// they are skipped once processed.
    pub(crate) fn mark_stale<M: MemOps<Error: std::fmt::Debug>>(
        &self,
        mem: &M,
        chan: u32,
    ) -> Result<usize> {
        let st = self.state.lock()?;
        let Some(ring) = st.ring.as_ref() else {
            return Ok(0);
        };
        let Some(dev) = Self::bounds(ring, mem)? else {
            return Ok(0);
        };

        let stale = Event::Stale { chan: chan as u8 }.encode();
        let mut marked = 0;
        let mut off = ring.rp();
        while off != dev {
            let addr = ring.to_device_address(off);
            let tre = ring.read_element(mem, off).shm(addr)?;
            let ours = matches!(
                Event::decode(&tre),
                Ok(Event::Transfer { chan: c, .. } | Event::RscTransfer { chan: c, .. })
                    if c as u32 == chan
            );
            if ours {
                ring.write_element(mem, off, &stale).shm(addr)?;
                marked += 1;
            }
            off = ring.next(off);
        }
        Ok(marked)
    }
}
