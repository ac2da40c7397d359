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

use std::sync::atomic::Ordering;

use bytes::BytesMut;
use mhi_common::{Tre, TreFlags};

use super::{BufInfo, ChanRings, Channel, ChannelState};
use crate::config::ControllerConfig;
use crate::controller::{Controller, HostMemory};
use crate::device::{ClientBuffer, MhiFlags};
use crate::dma::{map_buffer, unmap_buffer};
use crate::error::{MhiError, Result, SharedMemResult};

impl<M: HostMemory> Controller<M> {
    /// Free elements on channel `idx`; zero while it is not prepared.
    pub(crate) fn free_descriptors(&self, idx: usize) -> Result<usize> {
        let rings = self.chans[idx].rings.lock()?;
        Ok(rings.tre.as_ref().map_or(0, |r| r.available_slots()))
    }

    /// Queue `len` bytes of `buf` on channel `idx`.
    pub(crate) fn queue_buf(
        &self,
        idx: usize,
        buf: ClientBuffer,
        len: usize,
        flags: MhiFlags,
    ) -> Result<()> {
        if len == 0 || len > ControllerConfig::MAX_BUFFER_LEN || len > buf.len() {
            return Err(MhiError::InvalidArgument(format!(
                "cannot queue {len} bytes of a {} byte buffer",
                buf.len()
            )));
        }

        let chan = &self.chans[idx];
        let pm = self.pm.read()?;
        if pm.access_refused() {
            return Err(MhiError::IoError(format!(
                "channel {} refused in PM state {}",
                chan.cfg.num, pm.state
            )));
        }
        if chan.cfg.pre_alloc {
            return Err(MhiError::InvalidState(format!(
                "channel {} owns its receive buffers",
                chan.cfg.num
            )));
        }

        let state = chan.state.read()?;
        if *state != ChannelState::Enabled {
            return Err(MhiError::InvalidState(format!(
                "channel {} is {:?}",
                chan.cfg.num, *state
            )));
        }
        let mut rings = chan.rings.lock()?;

        if pm.state.in_suspend() {
            self.ops.trigger_resume();
        }
        // bring the device out of M2
        self.wake_toggle();

        self.gen_tre(chan, &mut rings, buf, len, flags)?;
        if chan.is_ul() {
            self.pending_pkts.fetch_add(1, Ordering::AcqRel);
        }
        if pm.db_access_valid() {
            self.ring_chan_db(chan, &mut rings);
        }
        Ok(())
    }

    /// Map `buf` and write one element for it at the write pointer.
    ///
    /// Nothing is modified when mapping or writing the element fails.
    pub(crate) fn gen_tre(
        &self,
        chan: &Channel,
        rings: &mut ChanRings,
        buf: ClientBuffer,
        len: usize,
        flags: MhiFlags,
    ) -> Result<()> {
        let ChanRings {
            tre,
            buf: buf_ring,
            bufs,
            ..
        } = rings;
        let tre_ring = tre.as_mut().ok_or_else(|| {
            MhiError::InvalidState(format!("channel {} is not prepared", chan.cfg.num))
        })?;
        let slot = buf_ring.wp_index();
        if tre_ring.is_full() || bufs[slot].used {
            return Err(MhiError::OutOfMemory);
        }

        let mapping = map_buffer(
            self.dma.as_ref(),
            self.mem.as_ref(),
            self.cfg.get_map_policy(),
            &buf,
            len,
            chan.cfg.dir,
        )?;

        let element = if chan.is_rsc() {
            Tre::rsc(mapping.dma_addr, len, slot as u32)
        } else {
            let mut bits = TreFlags::empty();
            bits.set(TreFlags::IEOT, flags.contains(MhiFlags::EOT));
            bits.set(TreFlags::IEOB, flags.contains(MhiFlags::EOB));
            bits.set(TreFlags::CHAIN, flags.contains(MhiFlags::CHAIN));
            bits.set(TreFlags::BEI, chan.cfg.bei);
            Tre::transfer(mapping.dma_addr, len, bits)
        };

        let wp = tre_ring.wp();
        let addr = tre_ring.to_device_address(wp);
        if let Err(e) = tre_ring.write_element(self.mem.as_ref(), wp, &element).shm(addr) {
            let mut buf = buf;
            unmap_buffer(
                self.dma.as_ref(),
                self.mem.as_ref(),
                mapping,
                &mut buf,
                len,
                0,
                chan.cfg.dir,
            );
            return Err(e);
        }

        bufs[slot] = BufInfo {
            buf: Some(buf),
            mapping: Some(mapping),
            len,
            used: true,
        };
        buf_ring.advance_write();
        tre_ring.advance_write();
        // a failed publish leaves the buffer queued; the next reset returns it
        tre_ring
            .publish_wp(self.mem.as_ref())
            .shm(tre_ring.iommu_base())?;
        Ok(())
    }

    /// Ring the doorbell of a prepared channel with its write pointer, honouring
    /// burst mode and the RSC credit floor.
    pub(crate) fn ring_chan_db(&self, chan: &Channel, rings: &mut ChanRings) {
        let Some(tre) = rings.tre.as_ref() else {
            return;
        };
        if chan.is_rsc() && tre.outstanding() < self.cfg.get_rsc_min_credits() {
            log::trace!(
                "channel {}: {} credits queued, holding the doorbell",
                chan.cfg.num,
                tre.outstanding()
            );
            return;
        }
        let db = tre.to_device_address(tre.wp());
        let addr = rings.db_addr;
        rings.db.ring(&self.mmio, addr, db);
    }

    /// Fill a receive channel that owns its buffers.
    pub(crate) fn pre_alloc_fill(&self, idx: usize) -> Result<usize> {
        let chan = &self.chans[idx];
        let len = self.cfg.get_buffer_len();
        let pm = self.pm.read()?;
        let mut rings = chan.rings.lock()?;

        let mut queued = 0;
        while rings.tre.as_ref().is_some_and(|r| !r.is_full()) {
            let buf = ClientBuffer::Owned(BytesMut::zeroed(len));
            self.gen_tre(chan, &mut rings, buf, len, MhiFlags::EOT)?;
            queued += 1;
        }
        if queued > 0 && pm.db_access_valid() {
            self.ring_chan_db(chan, &mut rings);
        }
        Ok(queued)
    }
}
