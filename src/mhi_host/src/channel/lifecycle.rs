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

use mhi_common::context::{CHAN_CTX_DISABLED, CHAN_CTX_ENABLED};
use mhi_common::{CommandType, MemOps, Ring, RingContext, Tre};
use tracing::{Span, instrument};

use super::{BufInfo, ChanRings, Channel, ChannelState};
use crate::controller::{Controller, HostMemory};
use crate::device::{Deliveries, Delivery, TransactionStatus, TransferResult, deliver};
use crate::error::{MhiError, Result, SharedMemResult};
use crate::regs::DbCfg;

impl<M: HostMemory> Controller<M> {
    /// Allocate the transfer ring of `chan` and describe it in its context.
    fn init_chan_ctxt(&self, chan: &Channel) -> Result<()> {
        let contexts = (*self.contexts.lock()?)
            .ok_or_else(|| MhiError::InvalidState("controller is not powered up".into()))?;
        let ctxt = contexts.chan + chan.cfg.num as u64 * RingContext::SIZE as u64;
        let len = chan.cfg.elements * Tre::SIZE;
        let base = self.dma.alloc_coherent(len)?;

        let rc = RingContext::new(
            RingContext::chan_cfg(CHAN_CTX_ENABLED, chan.brstmode()),
            chan.ctxt_kind(),
            chan.cfg.er_index as u32,
            base,
            len as u64,
        );
        if let Err(e) = self.mem.write_val(ctxt, rc).shm(ctxt) {
            self.dma.free_coherent(base, len);
            return Err(e);
        }

        let mut rings = chan.rings.lock()?;
        rings.tre = Some(Ring::new(base, chan.cfg.elements, ctxt));
        rings.buf.reset_cursors();
        rings.bufs.iter_mut().for_each(|b| *b = BufInfo::default());
        rings.db = DbCfg::new(chan.cfg.doorbell, chan.cfg.doorbell_mode_switch);
        rings.db_addr = self.chdb_addr(chan.cfg.num);
        rings.ctxt = ctxt;
        Ok(())
    }

    /// Free the transfer ring and mark the context disabled.
    fn deinit_chan_ctxt(&self, chan: &Channel) {
        let mut rings = match chan.rings.lock() {
            Ok(rings) => rings,
            Err(e) => {
                log::error!("channel {}: cannot tear down rings: {e}", chan.cfg.num);
                return;
            }
        };
        if let Some(ring) = rings.tre.take() {
            let rc = RingContext::new(
                RingContext::chan_cfg(CHAN_CTX_DISABLED, chan.brstmode()),
                chan.ctxt_kind(),
                chan.cfg.er_index as u32,
                0,
                0,
            );
            if let Err(e) = self.mem.write_val(rings.ctxt, rc) {
                log::warn!("channel {}: clearing context failed: {e:?}", chan.cfg.num);
            }
            self.dma.free_coherent(ring.iommu_base(), ring.len_bytes());
        }
        rings.buf.reset_cursors();
        rings.db = DbCfg::new(chan.cfg.doorbell, chan.cfg.doorbell_mode_switch);
    }

    /// Allocate, describe and start channel `idx`.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub(crate) fn prepare_channel(&self, idx: usize) -> Result<()> {
        let chan = &self.chans[idx];
        let _lifecycle = chan.lifecycle.lock()?;
        {
            let pm = self.pm.read()?;
            if pm.access_refused() {
                return Err(MhiError::IoError(format!(
                    "cannot start channel {} in PM state {}",
                    chan.cfg.num, pm.state
                )));
            }
            if chan.cfg.ee_mask & pm.ee.mask_bit() == 0 {
                return Err(MhiError::NotConnected);
            }
        }
        let state = *chan.state.read()?;
        if state != ChannelState::Disabled {
            return Err(MhiError::InvalidState(format!(
                "channel {} is already {state:?}",
                chan.cfg.num
            )));
        }

        self.init_chan_ctxt(chan)?;
        if let Err(e) = self.chan_command(idx, CommandType::StartChannel) {
            self.deinit_chan_ctxt(chan);
            return Err(e);
        }
        *chan.state.write()? = ChannelState::Enabled;

        if chan.cfg.pre_alloc && !chan.is_ul() {
            if let Err(e) = self.pre_alloc_fill(idx) {
                log::error!("channel {}: filling receive ring failed: {e}", chan.cfg.num);
                self.reset_and_deinit(chan);
                return Err(e);
            }
        }
        log::debug!("channel {} ({}) started", chan.cfg.num, chan.cfg.name);
        Ok(())
    }

    /// Reset channel `idx` and release its rings. Queued buffers go back to
    /// the client as not connected. The rings are released even when the
    /// device cannot be told.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub(crate) fn unprepare_channel(&self, idx: usize) -> Result<()> {
        let chan = &self.chans[idx];
        let _lifecycle = chan.lifecycle.lock()?;
        if *chan.state.read()? == ChannelState::Disabled {
            return Ok(());
        }

        let refused = self.pm.read()?.access_refused();
        let res = if refused {
            Err(MhiError::IoError(format!(
                "channel {}: device is not reachable, skipping reset",
                chan.cfg.num
            )))
        } else {
            self.chan_command(idx, CommandType::ResetChannel)
        };
        if let Err(e) = &res {
            log::warn!("channel {}: reset command failed: {e}", chan.cfg.num);
        }
        self.reset_and_deinit(chan);
        res
    }

    /// Stop channel `idx` with its rings in place.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub(crate) fn pause_channel(&self, idx: usize) -> Result<()> {
        self.switch_channel(
            idx,
            ChannelState::Enabled,
            CommandType::StopChannel,
            ChannelState::Suspended,
        )
    }

    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub(crate) fn resume_channel(&self, idx: usize) -> Result<()> {
        self.switch_channel(
            idx,
            ChannelState::Suspended,
            CommandType::StartChannel,
            ChannelState::Enabled,
        )
    }

    fn switch_channel(
        &self,
        idx: usize,
        from: ChannelState,
        command: CommandType,
        to: ChannelState,
    ) -> Result<()> {
        let chan = &self.chans[idx];
        let _lifecycle = chan.lifecycle.lock()?;
        {
            let pm = self.pm.read()?;
            if pm.access_refused() {
                return Err(MhiError::IoError(format!(
                    "channel {} refused in PM state {}",
                    chan.cfg.num, pm.state
                )));
            }
        }
        let state = *chan.state.read()?;
        if state == to {
            return Ok(());
        }
        if state != from {
            return Err(MhiError::InvalidState(format!(
                "channel {} is {state:?}",
                chan.cfg.num
            )));
        }
        self.chan_command(idx, command)?;
        *chan.state.write()? = to;
        Ok(())
    }

    /// Tear channel `idx` down without talking to the device, for error
    /// recovery and power down.
    pub(crate) fn force_reset_chan(&self, idx: usize) {
        let chan = &self.chans[idx];
        let _lifecycle = match chan.lifecycle.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::error!("channel {}: {e}", chan.cfg.num);
                return;
            }
        };
        if chan.state.read().is_ok_and(|s| *s == ChannelState::Disabled) {
            return;
        }
        self.reset_and_deinit(chan);
    }

    fn reset_and_deinit(&self, chan: &Channel) {
        match chan.state.write() {
            Ok(mut state) => *state = ChannelState::Disabled,
            Err(e) => log::error!("channel {}: {e}", chan.cfg.num),
        }
        if let Err(e) = self.reset_chan(chan) {
            log::error!("channel {}: unwinding queued buffers failed: {e}", chan.cfg.num);
        }
        self.deinit_chan_ctxt(chan);
    }

    /// Drop unread completions of `chan` and hand every queued buffer back.
    fn reset_chan(&self, chan: &Channel) -> Result<()> {
        let er = &self.events[chan.cfg.er_index];
        match er.mark_stale(self.mem.as_ref(), chan.cfg.num) {
            Ok(0) => {}
            Ok(n) => log::debug!("channel {}: {n} unread completions marked stale", chan.cfg.num),
            Err(e) => log::warn!("channel {}: marking stale events failed: {e}", chan.cfg.num),
        }

        let mut d = Deliveries::new();
        {
            let mut rings = chan.rings.lock()?;
            let ChanRings {
                tre,
                buf: buf_ring,
                bufs,
                ..
            } = &mut *rings;
            let Some(tre_ring) = tre.as_mut() else {
                return Ok(());
            };

            let mut queued = Vec::new();
            if chan.is_rsc() {
                // RSC slots retire by cookie, not in ring order
                queued.extend(bufs.iter_mut().filter(|b| b.used).map(std::mem::take));
            } else {
                while !tre_ring.is_empty() {
                    queued.push(std::mem::take(&mut bufs[buf_ring.rp_index()]));
                    tre_ring.advance_read();
                    buf_ring.advance_read();
                }
            }

            let client = chan.client();
            for info in queued {
                if chan.is_ul() {
                    self.pending_pkts.fetch_sub(1, Ordering::AcqRel);
                }
                let Some(buf) = self.release_slot(chan, info, 0) else {
                    continue;
                };
                if chan.cfg.pre_alloc {
                    continue;
                }
                if let Some(client) = &client {
                    d.push(Delivery::Xfer {
                        client: client.clone(),
                        ul: chan.is_ul(),
                        result: TransferResult {
                            buf,
                            bytes_xferd: 0,
                            dir: chan.cfg.dir,
                            transaction_status: TransactionStatus::NotConnected,
                        },
                    });
                }
            }
        }
        deliver(d);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use mhi_common::DmaDirection;

    use super::*;
    use crate::config::{ChannelConfig, EventRingConfig, EventRingPurpose, TransferType};
    use crate::device::MhiFlags;
    use crate::testing::Harness;

    const RSC_CHAN: u32 = 10;

    fn rsc_harness() -> Harness {
        let mut cfg = Harness::config();
        cfg.add_event_ring(EventRingConfig::new(EventRingPurpose::RscData, 3))
            .add_channel(
                ChannelConfig::new(RSC_CHAN, "RMNET", DmaDirection::FromDevice, 4)
                    .with_elements(8)
                    .with_transfer_type(TransferType::Rsc),
            );
        Harness::powered_with(cfg)
    }

    #[test]
    fn test_rsc_reset_leaves_cursors_alone() {
        let h = rsc_harness();
        let client = h.bind("RMNET");
        let dev = h.ctrl.device("RMNET").unwrap();
        dev.prepare_for_transfer().unwrap();
        for len in [16, 32, 48] {
            dev.queue_transfer(DmaDirection::FromDevice, BytesMut::zeroed(len), MhiFlags::EOT)
                .unwrap();
        }
        let before = h.ctrl.channel_info(RSC_CHAN).unwrap();
        assert_eq!(before.used, 3);

        let idx = h.ctrl.chan_idx(RSC_CHAN).unwrap();
        h.ctrl.reset_chan(&h.ctrl.chans[idx]).unwrap();

        let after = h.ctrl.channel_info(RSC_CHAN).unwrap();
        assert_eq!(after.used, 0);
        assert_eq!(after.tre_rp, before.tre_rp);
        assert_eq!(after.tre_wp, before.tre_wp);
        assert_eq!(after.outstanding, before.outstanding);

        let dl = client.dl.lock().unwrap();
        let mut lens: Vec<usize> = dl
            .iter()
            .map(|r| {
                assert_eq!(r.transaction_status, TransactionStatus::NotConnected);
                r.buf.len()
            })
            .collect();
        lens.sort_unstable();
        assert_eq!(lens, vec![16, 32, 48]);
        assert_eq!(h.dma.mapped_count(), 0);
    }
}
