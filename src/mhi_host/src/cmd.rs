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

//! The command ring.
//!
//! Commands complete in submission order. A completion event names the element
//! it answers; anything but the oldest outstanding element is a protocol
//! violation.

use std::sync::atomic::Ordering;

use mhi_common::regs::CRDB_LOWER;
use mhi_common::{CommandType, CompletionCode, MemOps, Ring, RingContext, Tre};
use tracing::{Span, instrument};

use crate::controller::{Controller, HostMemory};
use crate::error::{MhiError, Result, SharedMemResult};
use crate::metrics::{CounterMetric, EmittableMetric, HistogramMetric};

/// Elements in the command ring.
pub(crate) const CMD_RING_ELEMENTS: usize = 128;

#[derive(Debug, Default)]
pub(crate) struct CmdRing {
    /// Present between power up and power down.
    pub(crate) ring: Option<Ring>,
}

impl CmdRing {
    /// Write a context describing an empty ring at `base` to `ctxt` and start
    /// tracking it.
    pub(crate) fn setup<M: MemOps<Error: std::fmt::Debug>>(&mut self, mem: &M, base: u64, ctxt: u64) -> Result<()> {
        let len = CMD_RING_ELEMENTS * Tre::SIZE;
        mem.write_val(ctxt, RingContext::new(0, 0, 0, base, len as u64))
            .shm(ctxt)?;
        self.ring = Some(Ring::new(base, CMD_RING_ELEMENTS, ctxt));
        Ok(())
    }

    /// Rewind after a device reset, which forgets every queued command.
    pub(crate) fn rewind<M: MemOps<Error: std::fmt::Debug>>(&mut self, mem: &M) -> Result<()> {
        let Some(ring) = self.ring.as_mut() else {
            return Ok(());
        };
        ring.reset_cursors();
        let (base, ctxt) = (ring.iommu_base(), ring.ctxt_wp_addr());
        if let Some(wp_addr) = ctxt {
            let ctxt = wp_addr - RingContext::WP_OFFSET as u64;
            mem.write_val(ctxt, RingContext::new(0, 0, 0, base, ring.len_bytes() as u64))
                .shm(ctxt)?;
        }
        Ok(())
    }

    /// Retire the oldest outstanding command, which `cmd_ptr` must point at.
    pub(crate) fn retire<M: MemOps<Error: std::fmt::Debug>>(
        &mut self,
        mem: &M,
        cmd_ptr: u64,
    ) -> Result<Tre> {
        let ring = self
            .ring
            .as_mut()
            .ok_or_else(|| MhiError::ProtocolViolation("command ring is not set up".into()))?;
        let expected = ring.to_device_address(ring.rp());
        if ring.is_empty() || cmd_ptr != expected {
            return Err(MhiError::ProtocolViolation(format!(
                "completion for command {cmd_ptr:#x}, oldest outstanding is {expected:#x} ({} queued)",
                ring.outstanding()
            )));
        }
        let tre = ring.read_element(mem, ring.rp()).shm(cmd_ptr)?;
        ring.advance_read();
        Ok(tre)
    }
}

/// The reason string buffer the device fills in on a fatal error.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SfrInfo {
    pub(crate) addr: u64,
    pub(crate) len: usize,
    pub(crate) code: Option<CompletionCode>,
}

/// Holds a runtime vote on the platform for the duration of a command issued
/// in mission mode.
struct PendingVote<'a, M: HostMemory> {
    ctrl: &'a Controller<M>,
    held: bool,
}

impl<'a, M: HostMemory> PendingVote<'a, M> {
    fn new(ctrl: &'a Controller<M>) -> Self {
        let held = ctrl.ee().is_mission_mode();
        if held {
            ctrl.pending_pkts.fetch_add(1, Ordering::AcqRel);
            ctrl.ops.runtime_get();
        }
        Self { ctrl, held }
    }
}

impl<M: HostMemory> Drop for PendingVote<'_, M> {
    fn drop(&mut self) {
        if self.held {
            self.ctrl.pending_pkts.fetch_sub(1, Ordering::AcqRel);
            self.ctrl.ops.runtime_put();
        }
    }
}

impl<M: HostMemory> Controller<M> {
    /// Append `tre` to the command ring and ring its doorbell.
    ///
    /// In a low power state the doorbell waits, bounded by the resume timeout,
    /// until the device is back in M0 or M2.
    pub(crate) fn send_command(&self, tre: Tre) -> Result<()> {
        {
            let pm = self.pm.read()?;
            if pm.access_refused() {
                return Err(MhiError::IoError(format!(
                    "command refused in PM state {}",
                    pm.state
                )));
            }
            // a full ring fails now rather than after a resume
            if self.cmd_ring_full()? {
                return Err(MhiError::OutOfMemory);
            }
            if pm.state.in_suspend() {
                self.ops.trigger_resume();
            }
            if pm.db_access_valid() {
                return self.push_command(tre);
            }
        }

        let timeout = self.cfg.get_resume_timeout();
        let reached = self.state_event.wait_until(timeout, || {
            self.pm
                .read()
                .map(|pm| pm.db_access_valid() || pm.access_refused())
                .unwrap_or(true)
        })?;

        let pm = self.pm.read()?;
        if !reached || !pm.db_access_valid() {
            return Err(MhiError::IoError(format!(
                "doorbell access did not return, PM state {}",
                pm.state
            )));
        }
        self.push_command(tre)
    }

    fn cmd_ring_full(&self) -> Result<bool> {
        Ok(self.cmd.lock()?.ring.as_ref().is_some_and(Ring::is_full))
    }

    fn push_command(&self, tre: Tre) -> Result<()> {
        let mut cmd = self.cmd.lock()?;
        let ring = cmd
            .ring
            .as_mut()
            .ok_or_else(|| MhiError::InvalidState("command ring is not set up".into()))?;
        if ring.is_full() {
            return Err(MhiError::OutOfMemory);
        }
        let wp = ring.wp();
        ring.write_element(self.mem.as_ref(), wp, &tre)
            .shm(ring.to_device_address(wp))?;
        ring.advance_write();
        let db = ring.publish_wp(self.mem.as_ref()).shm(ring.iommu_base())?;
        self.mmio.write_db("command", CRDB_LOWER, db);
        Ok(())
    }

    /// Run `command` on channel `idx` and wait for the device to complete it.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub(crate) fn chan_command(&self, idx: usize, command: CommandType) -> Result<()> {
        let chan = &self.chans[idx];
        chan.completion.reinit()?;
        let _vote = PendingVote::new(self);

        let name = match command {
            CommandType::StartChannel => "start",
            CommandType::StopChannel => "stop",
            CommandType::ResetChannel => "reset",
            CommandType::SfrConfig => "sfr",
        };
        let timeout = self.cfg.get_timeout();
        let res = HistogramMetric::time_and_emit_command(name, || {
            self.send_command(Tre::command(command, chan.cfg.num))?;
            chan.completion.wait(timeout)
        });

        match res {
            Ok(CompletionCode::Success) => Ok(()),
            Ok(code) => Err(MhiError::IoError(format!(
                "{name} of channel {} completed with {code:?}",
                chan.cfg.num
            ))),
            Err(MhiError::Timeout(t)) => {
                CounterMetric::command_timeout().emit();
                log::error!("{name} of channel {} timed out", chan.cfg.num);
                Err(MhiError::Timeout(t))
            }
            Err(e) => Err(e),
        }
    }

    /// Route a command completion to whoever waits for it.
    pub(crate) fn cmd_completion(&self, cmd_ptr: u64, code: CompletionCode) -> Result<()> {
        let tre = self.cmd.lock()?.retire(self.mem.as_ref(), cmd_ptr)?;
        match CommandType::try_from(tre.element_type()) {
            Ok(CommandType::SfrConfig) => self.sfr_completion.complete(code),
            Ok(_) => match self.chan_idx(tre.chan() as u32) {
                Some(idx) => self.chans[idx].completion.complete(code),
                None => log::warn!("completion {code:?} for unknown channel {}", tre.chan()),
            },
            Err(e) => log::error!("command ring held a non-command element: {e}"),
        }
        Ok(())
    }

    /// Hand the device a buffer of `len` bytes for its failure reason.
    pub fn config_sfr(&self, len: usize) -> Result<()> {
        let info = {
            let mut sfr = self.sfr.lock()?;
            match *sfr {
                Some(info) if info.len == len => info,
                _ => {
                    if let Some(old) = sfr.take() {
                        self.dma.free_coherent(old.addr, old.len);
                    }
                    let addr = self.dma.alloc_coherent(len)?;
                    let info = SfrInfo {
                        addr,
                        len,
                        code: None,
                    };
                    *sfr = Some(info);
                    info
                }
            }
        };

        self.sfr_completion.reinit()?;
        self.send_command(Tre::sfr_config(info.addr, len))?;
        let code = self.sfr_completion.wait(self.cfg.get_timeout())?;
        if let Some(sfr) = self.sfr.lock()?.as_mut() {
            sfr.code = Some(code);
        }
        if code != CompletionCode::Success {
            return Err(MhiError::IoError(format!(
                "SFR configuration completed with {code:?}"
            )));
        }
        Ok(())
    }

    /// The failure reason the device wrote, up to the first NUL.
    pub fn read_sfr(&self) -> Result<String> {
        let info = (*self.sfr.lock()?)
            .ok_or_else(|| MhiError::InvalidState("no SFR buffer configured".into()))?;
        let mut raw = vec![0u8; info.len];
        self.mem.read(info.addr, &mut raw).shm(info.addr)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub(crate) fn free_sfr(&self) {
        if let Ok(mut sfr) = self.sfr.lock() {
            if let Some(info) = sfr.take() {
                self.dma.free_coherent(info.addr, info.len);
            }
        }
    }
}
