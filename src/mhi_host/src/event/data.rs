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
use mhi_common::{CompletionCode, Event};

use crate::channel::{BufInfo, ChanRings, Channel, ChannelState};
use crate::controller::{Controller, HostMemory};
use crate::device::{
    ClientBuffer, Deliveries, Delivery, MhiFlags, TransactionStatus, TransferResult, deliver,
};
use crate::dma::unmap_buffer;
use crate::error::{MhiError, Result};
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::pm::PmInfo;

/// What a completion points at.
#[derive(Clone, Copy, Debug)]
enum XferTarget {
    /// Device address of the last element of the transfer.
    Ptr(u64),
    /// Buffer slot of an RSC element.
    Cookie(u32),
}

impl<M: HostMemory> Controller<M> {
    /// Handle up to `quota` events of data ring `er`. Returns how many were consumed.
    pub(crate) fn process_data_events(&self, er: usize, quota: usize) -> Result<usize> {
        let mut d = Deliveries::new();
        let res = self.drain_data_ring(er, quota, &mut d);
        deliver(d);
        if let Err(e) = &res {
            if e.is_fatal() {
                self.escalate(e);
            }
        }
        res
    }

    fn drain_data_ring(&self, er: usize, quota: usize, d: &mut Deliveries) -> Result<usize> {
        let ev = &self.events[er];
        let mut st = ev.state.lock()?;
        let pm = self.pm.read()?;
        if pm.state.event_access_invalid() {
            return Ok(0);
        }

        let mut count = 0;
        while count < quota {
            let Some(tre) = ev.pull_locked(&mut st, self.mem.as_ref())? else {
                break;
            };
            count += 1;
            match Event::decode(&tre) {
                Ok(event) => {
                    CounterMetric::event(super::kind(&event)).emit();
                    self.handle_xfer_event(&pm, event, d)?;
                }
                Err(e) => log::warn!("event ring {er}: skipping element {tre:?}: {e}"),
            }
        }

        if count > 0 && pm.reg_access_valid() {
            ev.ring_db(&self.mmio, self.mem.as_ref());
        }
        Ok(count)
    }

    /// Dispatch one transfer or RSC completion. Callbacks are collected in `d`.
    pub(crate) fn handle_xfer_event(
        &self,
        pm: &PmInfo,
        event: Event,
        d: &mut Deliveries,
    ) -> Result<()> {
        let (num, target, len, code) = match event {
            Event::Transfer {
                chan,
                ptr,
                len,
                code,
            } => (chan, XferTarget::Ptr(ptr), len, code),
            Event::RscTransfer {
                chan,
                cookie,
                len,
                code,
            } => (chan, XferTarget::Cookie(cookie), len, code),
            Event::Stale { .. } => return Ok(()),
            other => {
                log::warn!("{:?} on a data event ring", other.event_type());
                return Ok(());
            }
        };
        let Some(idx) = self.chan_idx(num as u32) else {
            log::warn!("transfer event for unknown channel {num}");
            return Ok(());
        };
        let chan = &self.chans[idx];

        match code {
            CompletionCode::Eot | CompletionCode::Eob | CompletionCode::Overflow => {
                let state = chan.state.read()?;
                if *state != ChannelState::Enabled {
                    log::debug!("channel {num} is {:?}, dropping completion", *state);
                    return Ok(());
                }
                match target {
                    XferTarget::Ptr(ptr) => self.complete_xfer(pm, chan, ptr, len as usize, code, d),
                    XferTarget::Cookie(cookie) => {
                        self.complete_rsc(pm, chan, cookie, len as usize, code, d)
                    }
                }
            }
            CompletionCode::Oob | CompletionCode::DbMode => {
                let state = chan.state.write()?;
                if *state != ChannelState::Enabled {
                    return Ok(());
                }
                let mut rings = chan.rings.lock()?;
                rings.db.db_mode = true;
                let queued = rings.tre.as_ref().is_some_and(|r| !r.is_empty());
                if queued && pm.db_access_valid() {
                    self.ring_chan_db(chan, &mut rings);
                }
                Ok(())
            }
            CompletionCode::BadTre
            | CompletionCode::UndefinedErr
            | CompletionCode::Success
            | CompletionCode::Invalid => {
                CounterMetric::xfer_error(code as u8).emit();
                log::error!("channel {num}: transfer event with code {code:?}");
                Ok(())
            }
        }
    }

    /// Retire every element from the read pointer up to and including `ptr`.
    fn complete_xfer(
        &self,
        pm: &PmInfo,
        chan: &Channel,
        ptr: u64,
        len: usize,
        code: CompletionCode,
        d: &mut Deliveries,
    ) -> Result<()> {
        let mut rings = chan.rings.lock()?;
        let mut recycle = Vec::new();
        {
            let ChanRings {
                tre,
                buf: buf_ring,
                bufs,
                ..
            } = &mut *rings;
            let Some(tre_ring) = tre.as_mut() else {
                return Ok(());
            };
            let ev_off = tre_ring.to_local_offset(ptr).map_err(|e| {
                MhiError::ProtocolViolation(format!("channel {}: {e}", chan.cfg.num))
            })?;
            let ring_len = tre_ring.len_bytes();
            let dist = |from: usize, to: usize| (to + ring_len - from) % ring_len;
            if tre_ring.is_empty() || dist(tre_ring.rp(), ev_off) >= dist(tre_ring.rp(), tre_ring.wp())
            {
                return Err(MhiError::ProtocolViolation(format!(
                    "channel {}: completion for {ptr:#x} which is not outstanding",
                    chan.cfg.num
                )));
            }

            loop {
                let last = tre_ring.rp() == ev_off;
                let info = std::mem::take(&mut bufs[buf_ring.rp_index()]);
                tre_ring.advance_read();
                buf_ring.advance_read();
                if chan.is_ul() {
                    self.pending_pkts.fetch_sub(1, Ordering::AcqRel);
                }

                let xferd = if last { len.min(info.len) } else { info.len };
                let status = if last && code == CompletionCode::Overflow {
                    TransactionStatus::Overflow
                } else {
                    TransactionStatus::Ok
                };
                self.retire_buf(chan, info, xferd, status, d, &mut recycle);
                if last {
                    break;
                }
            }
        }
        self.recycle(pm, chan, &mut rings, recycle);
        Ok(())
    }

    /// Retire the slot an RSC completion names. Exactly one transfer ring
    /// element is given back whatever the cookie.
    fn complete_rsc(
        &self,
        pm: &PmInfo,
        chan: &Channel,
        cookie: u32,
        len: usize,
        code: CompletionCode,
        d: &mut Deliveries,
    ) -> Result<()> {
        let mut rings = chan.rings.lock()?;
        let mut recycle = Vec::new();
        {
            let ChanRings { tre, bufs, .. } = &mut *rings;
            let Some(tre_ring) = tre.as_mut() else {
                return Ok(());
            };
            let slots = bufs.len();
            let info = bufs.get_mut(cookie as usize).ok_or_else(|| {
                MhiError::ProtocolViolation(format!(
                    "channel {}: RSC cookie {cookie} beyond {slots} slots",
                    chan.cfg.num
                ))
            })?;

            if info.used {
                let info = std::mem::take(info);
                let status = if code == CompletionCode::Overflow {
                    TransactionStatus::Overflow
                } else {
                    TransactionStatus::Ok
                };
                let xferd = len.min(info.len);
                self.retire_buf(chan, info, xferd, status, d, &mut recycle);
            } else {
                log::error!("channel {}: RSC cookie {cookie} is already free", chan.cfg.num);
            }

            if tre_ring.is_empty() {
                log::error!("channel {}: RSC completion on an empty ring", chan.cfg.num);
            } else {
                tre_ring.advance_read();
            }
        }
        self.recycle(pm, chan, &mut rings, recycle);
        Ok(())
    }

    /// Unmap a completed slot and give its buffer to the client. Pre-allocated
    /// buffers are copied out for the client and kept in `recycle`.
    fn retire_buf(
        &self,
        chan: &Channel,
        info: BufInfo,
        xferd: usize,
        status: TransactionStatus,
        d: &mut Deliveries,
        recycle: &mut Vec<BytesMut>,
    ) {
        let Some(buf) = self.release_slot(chan, info, xferd) else {
            log::error!("channel {}: completion for an empty slot", chan.cfg.num);
            return;
        };
        let client = chan.client();

        let buf = match buf {
            ClientBuffer::Owned(bytes) if chan.cfg.pre_alloc => {
                let copy = BytesMut::from(&bytes[..xferd.min(bytes.len())]);
                recycle.push(bytes);
                ClientBuffer::Owned(copy)
            }
            ClientBuffer::Owned(mut bytes) if !chan.is_ul() => {
                bytes.truncate(xferd);
                ClientBuffer::Owned(bytes)
            }
            other => other,
        };

        match client {
            Some(client) => d.push(Delivery::Xfer {
                client,
                ul: chan.is_ul(),
                result: TransferResult {
                    buf,
                    bytes_xferd: xferd,
                    dir: chan.cfg.dir,
                    transaction_status: status,
                },
            }),
            None => log::debug!("channel {}: no client, dropping {xferd} bytes", chan.cfg.num),
        }
    }

    /// Unmap the buffer of a slot that left the device, returning it.
    pub(crate) fn release_slot(
        &self,
        chan: &Channel,
        info: BufInfo,
        xferd: usize,
    ) -> Option<ClientBuffer> {
        let BufInfo {
            buf, mapping, len, ..
        } = info;
        let mut buf = buf?;
        if let Some(mapping) = mapping {
            unmap_buffer(
                self.dma.as_ref(),
                self.mem.as_ref(),
                mapping,
                &mut buf,
                len,
                xferd,
                chan.cfg.dir,
            );
        }
        Some(buf)
    }

    /// Queue pre-allocated buffers again and tell the device about them.
    fn recycle(&self, pm: &PmInfo, chan: &Channel, rings: &mut ChanRings, bufs: Vec<BytesMut>) {
        if bufs.is_empty() {
            return;
        }
        for bytes in bufs {
            let len = bytes.len();
            if let Err(e) =
                self.gen_tre(chan, rings, ClientBuffer::Owned(bytes), len, MhiFlags::EOT)
            {
                log::error!("channel {}: dropping recycled buffer: {e}", chan.cfg.num);
            }
        }
        if pm.db_access_valid() {
            self.ring_chan_db(chan, rings);
        }
    }
}
