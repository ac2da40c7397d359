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
use std::thread;
use std::time::{Duration, Instant};

use mhi_common::context::CHAN_CTX_DISABLED;
use mhi_common::regs::{
    BHIOFF, CCABAP_HIGHER, CCABAP_LOWER, CHDBOFF, CRCBAP_HIGHER, CRCBAP_LOWER, ECABAP_HIGHER,
    ECABAP_LOWER, ERDBOFF, MHICTRL, MHICTRL_MHISTATE_MASK, MHICTRL_MHISTATE_SHIFT,
    MHICTRL_RESET_MASK, MHICTRL_RESET_SHIFT, MHISTATUS, MHISTATUS_READY_MASK,
    MHISTATUS_READY_SHIFT,
};
use mhi_common::{ExecEnv, MemOps, MhiState, RingContext, Tre};
use tracing::{Span, instrument};

use super::{PmState, Votes};
use crate::cmd::CMD_RING_ELEMENTS;
use crate::controller::{Contexts, Controller, HostMemory};
use crate::device::StatusEvent;
use crate::error::{MhiError, Result, SharedMemResult};

const READY_POLL: Duration = Duration::from_millis(1);

impl<M: HostMemory> Controller<M> {
    /// Reset the device, hand it the context arrays and start the ready
    /// transition. Returns once M0 has been requested; mission mode follows
    /// asynchronously, see [`sync_power_up`](Self::sync_power_up).
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn power_up(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock()?;
        let state = self.pm_state();
        if state != PmState::DISABLE {
            return Err(MhiError::InvalidState(format!(
                "power up requested in PM state {state}"
            )));
        }

        self.reset_device()?;
        self.bases
            .chdb
            .store(self.mmio.read_reg(CHDBOFF)? as u64, Ordering::Release);
        self.bases
            .erdb
            .store(self.mmio.read_reg(ERDBOFF)? as u64, Ordering::Release);
        self.bases
            .bhi
            .store(self.mmio.read_reg(BHIOFF)? as u64, Ordering::Release);

        let res = self
            .init_contexts()
            .and_then(|()| self.ready_transition());
        if let Err(e) = res {
            log::error!("power up failed: {e}");
            self.free_contexts();
            self.pm_write(|pm| {
                pm.state = PmState::DISABLE;
                pm.ee = ExecEnv::NotSupported;
            })?;
            self.state_event.notify_all();
            return Err(e);
        }
        Ok(())
    }

    /// [`power_up`](Self::power_up), then wait for mission mode.
    pub fn sync_power_up(&self) -> Result<()> {
        self.power_up()?;
        let timeout = self.cfg.get_timeout();
        let reached = self.state_event.wait_until(timeout, || {
            self.is_mission_ready() || self.pm_state().in_error()
        })?;
        if !reached {
            return Err(MhiError::Timeout(timeout));
        }
        let state = self.pm_state();
        if state.in_error() {
            return Err(MhiError::IoError(format!(
                "device failed to reach mission mode, PM state {state}"
            )));
        }
        Ok(())
    }

    /// Stop every channel and free everything handed to the device. A
    /// graceful power down also resets the device; otherwise the device is
    /// assumed gone and clients are told about a fatal error.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn power_down(&self, graceful: bool) -> Result<()> {
        let _lifecycle = self.lifecycle.lock()?;
        let target = if graceful {
            PmState::SHUTDOWN_PROCESS
        } else {
            PmState::SHUTDOWN_NO_ACCESS
        };
        let (prev, cur) = self.pm_write(|pm| {
            let prev = pm.state;
            let mut cur = pm.tryset(target);
            if cur != target {
                cur = pm.tryset(PmState::SHUTDOWN_NO_ACCESS);
            }
            (prev, cur)
        })?;
        if prev == PmState::DISABLE {
            return Ok(());
        }
        log::info!("power down from PM state {prev}, now {cur}");

        self.transitions.lock()?.clear();
        self.mission_ready.store(false, Ordering::Release);
        self.state_event.notify_all();
        self.fail_completions();
        if self.tsync.as_ref().is_some_and(|t| t.abandon()) {
            // the device vote is dropped with the rest below
            self.ops.runtime_put();
        }

        if cur == PmState::SHUTDOWN_PROCESS {
            if let Err(e) = self.reset_device() {
                log::warn!("device did not acknowledge the reset: {e}");
            }
        }
        if !graceful {
            self.notify_clients(StatusEvent::FatalError);
        }
        for idx in 0..self.chans.len() {
            self.force_reset_chan(idx);
        }
        self.devices.lock()?.clear();
        if let Some(offload) = self.mmio.offload() {
            let dropped = offload.reset();
            if dropped > 0 {
                log::debug!("dropped {dropped} queued register writes");
            }
        }
        self.free_contexts();
        self.dev_wake.store(0, Ordering::Release);
        self.wake_set.store(false, Ordering::Release);

        self.pm_write(|pm| {
            pm.tryset(PmState::DISABLE);
            pm.ee = ExecEnv::NotSupported;
            pm.dev_state = MhiState::Reset;
        })?;
        self.state_event.notify_all();
        Ok(())
    }

    /// Put an idle device into M3.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn pm_suspend(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock()?;
        let state = self.pm_state();
        if state == PmState::DISABLE {
            return Err(MhiError::InvalidState("device is powered down".into()));
        }
        if state.in_error() {
            return Err(MhiError::IoError(format!("cannot suspend in PM state {state}")));
        }
        let pending = self.pending_pkts.load(Ordering::Acquire);
        let votes = self.dev_wake.load(Ordering::Acquire);
        if pending > 0 || votes > 0 {
            return Err(MhiError::InvalidState(format!(
                "busy: {pending} packets pending, {votes} wake votes"
            )));
        }

        let cur = self.pm_write(|pm| pm.tryset(PmState::M3_ENTER))?;
        if cur != PmState::M3_ENTER {
            return Err(MhiError::InvalidState(format!(
                "cannot suspend from PM state {cur}"
            )));
        }
        self.state_event.notify_all();
        if let Some(offload) = self.mmio.offload() {
            offload.flush();
        }
        self.mmio.write_reg_field(
            MHICTRL,
            MHICTRL_MHISTATE_MASK,
            MHICTRL_MHISTATE_SHIFT,
            MhiState::M3 as u32,
        )?;
        self.wait_for_state(self.cfg.get_timeout(), |s, _| {
            s == PmState::M3 || s.in_error()
        })?;
        let state = self.pm_state();
        if state != PmState::M3 {
            return Err(MhiError::IoError(format!(
                "device did not enter M3, PM state {state}"
            )));
        }
        Ok(())
    }

    /// Bring a suspended device back to M0.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn pm_resume(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock()?;
        let cur = self.pm_write(|pm| {
            if pm.state == PmState::M3 {
                pm.tryset(PmState::M3_EXIT);
            }
            pm.state
        })?;
        if cur != PmState::M3_EXIT {
            return Err(MhiError::InvalidState(format!(
                "cannot resume from PM state {cur}"
            )));
        }
        self.state_event.notify_all();
        self.mmio.write_reg_field(
            MHICTRL,
            MHICTRL_MHISTATE_MASK,
            MHICTRL_MHISTATE_SHIFT,
            MhiState::M0 as u32,
        )?;
        self.wait_for_state(self.cfg.get_resume_timeout(), |s, _| {
            s == PmState::M0 || s.in_error()
        })?;
        let state = self.pm_state();
        if state != PmState::M0 {
            return Err(MhiError::IoError(format!(
                "device did not return to M0, PM state {state}"
            )));
        }
        Ok(())
    }

    /// Hold `votes` without waiting for the device.
    pub fn device_get(&self, votes: Votes) {
        if votes.contains(Votes::DEVICE) {
            if self.pm_state().in_suspend() {
                self.ops.trigger_resume();
            }
            self.wake_get(true);
        }
        if votes.contains(Votes::BUS) {
            self.ops.runtime_get();
        }
    }

    /// Hold `votes` and wait until doorbells can be rung.
    pub fn device_get_sync(&self, votes: Votes) -> Result<()> {
        self.device_get(votes);
        let timeout = self.cfg.get_resume_timeout();
        let waited = self.wait_for_state(timeout, |s, ee| {
            (s.intersects(PmState::M0 | PmState::M2) && ee != ExecEnv::Rddm) || s.in_error()
        });
        let usable = self.pm.read().map(|pm| pm.db_access_valid()).unwrap_or(false);
        if waited.is_err() || !usable {
            self.device_put(votes);
            return Err(waited.err().unwrap_or_else(|| {
                MhiError::IoError(format!("device unusable in PM state {}", self.pm_state()))
            }));
        }
        Ok(())
    }

    pub fn device_put(&self, votes: Votes) {
        if votes.contains(Votes::DEVICE) {
            self.wake_put(false);
        }
        if votes.contains(Votes::BUS) {
            self.ops.runtime_put();
        }
    }

    /// Take a wake vote, asserting the wake doorbell on the first one or when
    /// `force` is set.
    pub(crate) fn wake_get(&self, force: bool) {
        let votes = self.dev_wake.fetch_add(1, Ordering::AcqRel) + 1;
        if (force || votes == 1)
            && self.reg_access.load(Ordering::Acquire)
            && !self.wake_set.swap(true, Ordering::AcqRel)
        {
            self.mmio.write_db("wake", self.dev_wake_db(), 1);
        }
    }

    /// Drop a wake vote. The doorbell is released with the last vote unless
    /// `keep` is set.
    pub(crate) fn wake_put(&self, keep: bool) {
        let prev = self
            .dev_wake
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| (v > 0).then(|| v - 1));
        match prev {
            Ok(1) => {
                if !keep
                    && self.reg_access.load(Ordering::Acquire)
                    && self.wake_set.swap(false, Ordering::AcqRel)
                {
                    self.mmio.write_db("wake", self.dev_wake_db(), 0);
                }
            }
            Ok(_) => {}
            Err(_) => log::warn!("device wake vote dropped below zero"),
        }
    }

    /// Nudge a device sitting in M2 without keeping a vote.
    pub(crate) fn wake_toggle(&self) {
        self.wake_get(false);
        self.wake_put(true);
    }

    /// Reset the device through MHICTRL and wait until it reports ready.
    pub(crate) fn reset_device(&self) -> Result<()> {
        self.mmio
            .write_reg_field(MHICTRL, MHICTRL_RESET_MASK, MHICTRL_RESET_SHIFT, 1)?;
        self.wait_for_ready()
    }

    fn wait_for_ready(&self) -> Result<()> {
        let timeout = self.cfg.get_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let reset =
                self.mmio
                    .read_reg_field(MHICTRL, MHICTRL_RESET_MASK, MHICTRL_RESET_SHIFT)?;
            let ready = self.mmio.read_reg_field(
                MHISTATUS,
                MHISTATUS_READY_MASK,
                MHISTATUS_READY_SHIFT,
            )?;
            if reset == 0 && ready == 1 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(MhiError::Timeout(timeout));
            }
            thread::sleep(READY_POLL);
        }
    }

    /// Allocate and program the channel, event and command contexts, and the
    /// rings behind the latter two.
    fn init_contexts(&self) -> Result<()> {
        let dma = self.dma.as_ref();
        let ctxt_size = RingContext::SIZE;
        let nchan = self
            .chans
            .iter()
            .map(|c| c.cfg.num as usize + 1)
            .max()
            .unwrap_or(1);
        let chan_len = nchan * ctxt_size;
        let er_len = self.events.len() * ctxt_size;

        let chan = dma.alloc_coherent(chan_len)?;
        let er = match dma.alloc_coherent(er_len) {
            Ok(addr) => addr,
            Err(e) => {
                dma.free_coherent(chan, chan_len);
                return Err(e.into());
            }
        };
        let cmd = match dma.alloc_coherent(ctxt_size) {
            Ok(addr) => addr,
            Err(e) => {
                dma.free_coherent(chan, chan_len);
                dma.free_coherent(er, er_len);
                return Err(e.into());
            }
        };
        *self.contexts.lock()? = Some(Contexts {
            chan,
            chan_len,
            er,
            er_len,
            cmd,
            cmd_len: ctxt_size,
        });

        for c in &self.chans {
            let addr = chan + c.cfg.num as u64 * ctxt_size as u64;
            let rc = RingContext::new(
                RingContext::chan_cfg(CHAN_CTX_DISABLED, c.brstmode()),
                c.ctxt_kind(),
                c.cfg.er_index as u32,
                0,
                0,
            );
            self.mem.write_val(addr, rc).shm(addr)?;
        }
        for ev in &self.events {
            ev.setup(
                dma,
                er + (ev.index * ctxt_size) as u64,
                self.erdb_addr(ev.index),
            )?;
        }
        let cmd_ring = dma.alloc_coherent(CMD_RING_ELEMENTS * Tre::SIZE)?;
        if let Err(e) = self.cmd.lock()?.setup(self.mem.as_ref(), cmd_ring, cmd) {
            dma.free_coherent(cmd_ring, CMD_RING_ELEMENTS * Tre::SIZE);
            return Err(e);
        }

        for (lower, higher, addr) in [
            (CCABAP_LOWER, CCABAP_HIGHER, chan),
            (ECABAP_LOWER, ECABAP_HIGHER, er),
            (CRCBAP_LOWER, CRCBAP_HIGHER, cmd),
        ] {
            self.mmio.write_reg(lower, addr as u32);
            self.mmio.write_reg(higher, (addr >> 32) as u32);
        }
        Ok(())
    }

    fn free_contexts(&self) {
        for ev in &self.events {
            ev.teardown(self.dma.as_ref());
        }
        match self.cmd.lock() {
            Ok(mut cmd) => {
                if let Some(ring) = cmd.ring.take() {
                    self.dma.free_coherent(ring.iommu_base(), ring.len_bytes());
                }
            }
            Err(e) => log::error!("command ring leaked: {e}"),
        }
        match self.contexts.lock() {
            Ok(mut contexts) => {
                if let Some(c) = contexts.take() {
                    self.dma.free_coherent(c.chan, c.chan_len);
                    self.dma.free_coherent(c.er, c.er_len);
                    self.dma.free_coherent(c.cmd, c.cmd_len);
                }
            }
            Err(e) => log::error!("context arrays leaked: {e}"),
        }
        self.free_sfr();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mhi_testing::SimEvent;

    use super::*;
    use crate::testing::Harness;

    #[test]
    fn test_power_cycle_releases_memory() {
        let h = Harness::powered();
        assert!(h.dma.coherent_count() > 0);
        h.ctrl.power_down(true).unwrap();
        assert_eq!(h.ctrl.pm_state(), PmState::DISABLE);
        assert_eq!(h.ctrl.ee(), ExecEnv::NotSupported);
        assert_eq!(h.dma.coherent_count(), 0);
        assert!(h.ctrl.devices().is_empty());

        h.ctrl.sync_power_up().unwrap();
        assert_eq!(h.ctrl.pm_state(), PmState::M0);
        assert!(h.ctrl.device("LOOPBACK").is_some());
    }

    #[test]
    fn test_power_up_twice_is_rejected() {
        let h = Harness::powered();
        assert!(matches!(h.ctrl.power_up(), Err(MhiError::InvalidState(_))));
    }

    #[test]
    fn test_suspend_and_resume() {
        let h = Harness::powered();
        h.ctrl.pm_suspend().unwrap();
        assert_eq!(h.ctrl.pm_state(), PmState::M3);
        assert_eq!(h.dev.state(), MhiState::M3);

        h.ctrl.pm_resume().unwrap();
        assert_eq!(h.ctrl.pm_state(), PmState::M0);
        assert!(matches!(h.ctrl.pm_resume(), Err(MhiError::InvalidState(_))));
    }

    #[test]
    fn test_suspend_refused_with_votes() {
        let h = Harness::powered();
        h.ctrl.device_get(Votes::DEVICE);
        assert!(matches!(h.ctrl.pm_suspend(), Err(MhiError::InvalidState(_))));
        h.ctrl.device_put(Votes::DEVICE);
        assert_eq!(h.ctrl.wake_votes(), 0);
        h.ctrl.pm_suspend().unwrap();
    }

    #[test]
    fn test_wake_doorbell_follows_votes() {
        let h = Harness::powered();
        h.dev.clear_log();
        h.ctrl.device_get(Votes::DEVICE);
        assert!(h.dev.dev_wake());
        h.ctrl.device_get(Votes::DEVICE);
        h.ctrl.device_put(Votes::DEVICE);
        assert!(h.dev.dev_wake());
        h.ctrl.device_put(Votes::DEVICE);
        assert!(!h.dev.dev_wake());
        let wakes: Vec<_> = h
            .dev
            .log()
            .into_iter()
            .filter(|e| matches!(e, SimEvent::DevWake(_)))
            .collect();
        assert_eq!(wakes, vec![SimEvent::DevWake(true), SimEvent::DevWake(false)]);

        // unbalanced puts are ignored
        h.ctrl.device_put(Votes::DEVICE);
        assert_eq!(h.ctrl.wake_votes(), 0);
    }

    #[test]
    fn test_ungraceful_power_down_reports_fatal_error() {
        let h = Harness::powered();
        let client = h.bind("LOOPBACK");
        h.ctrl.power_down(false).unwrap();
        assert!(client.statuses().contains(&StatusEvent::FatalError));
        assert!(
            h.ctrl
                .wait_for_state(Duration::from_millis(10), |s, _| s == PmState::DISABLE)
                .is_ok()
        );
    }
}
