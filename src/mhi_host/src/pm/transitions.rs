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

//! Device state transitions.
//!
//! Transitions reported on the control event ring (M0, M1, M3, SYS_ERR) are
//! handled inline by the event worker because they only flip state and ring
//! doorbells. Anything that may wait for the device is queued as a
//! [`StateTransition`] and run in order on the state worker.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use mhi_common::regs::{
    CRDB_LOWER, MHICTRL, MHICTRL_MHISTATE_MASK, MHICTRL_MHISTATE_SHIFT, MHISTATUS,
    MHISTATUS_MHISTATE_MASK, MHISTATUS_MHISTATE_SHIFT,
};
use mhi_common::{CompletionCode, ExecEnv, MhiState};

use super::PmState;
use crate::channel::ChannelState;
use crate::controller::{Controller, HostMemory};
use crate::device::{Deliveries, Delivery, Device, StatusEvent, deliver};
use crate::error::{MhiError, Result};
use crate::metrics::{CounterMetric, EmittableMetric};

/// Work for the state worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StateTransition {
    /// The device is ready: hand it the event rings and ask for M0.
    Ready,
    /// The secondary bootloader is running.
    Sbl,
    MissionMode,
    /// Recover from a device error.
    SysErr,
    /// Recovery failed: release everything as if the device were gone.
    DisableTransition,
}

impl<M: HostMemory> Controller<M> {
    /// Run queued transitions until the queue is empty.
    pub(crate) fn process_state_transitions(&self) {
        loop {
            let next = match self.transitions.lock() {
                Ok(mut q) => q.pop_front(),
                Err(e) => {
                    log::error!("state transition queue: {e}");
                    return;
                }
            };
            let Some(transition) = next else {
                return;
            };
            log::debug!(
                "processing {transition:?} in PM state {}, EE {}",
                self.pm_state(),
                self.ee()
            );
            let res = match transition {
                StateTransition::Ready => self.ready_transition(),
                StateTransition::Sbl => self.sbl_transition(),
                StateTransition::MissionMode => self.mission_mode_transition(),
                StateTransition::SysErr => self.sys_err_process(),
                StateTransition::DisableTransition => self.power_down(false),
            };
            if let Err(e) = res {
                log::error!("{transition:?} transition failed: {e}");
            }
        }
    }

    /// Enter POR, arm every event ring and request M0.
    pub(crate) fn ready_transition(&self) -> Result<()> {
        let ee = self.read_ee()?;
        let state = self.pm_write(|pm| {
            if pm.tryset(PmState::POR) == PmState::POR {
                pm.ee = ee;
                pm.dev_state = MhiState::Ready;
            }
            pm.state
        })?;
        if state != PmState::POR {
            return Err(MhiError::InvalidState(format!(
                "device ready while in PM state {state}"
            )));
        }
        self.state_event.notify_all();

        for ev in &self.events {
            let db = ev.arm(self.mem.as_ref())?;
            self.mmio.write_db("event", self.erdb_addr(ev.index), db);
        }
        self.mmio.write_reg_field(
            MHICTRL,
            MHICTRL_MHISTATE_MASK,
            MHICTRL_MHISTATE_SHIFT,
            MhiState::M0 as u32,
        )?;

        if ee.is_mission_mode() {
            self.queue_transition(StateTransition::MissionMode);
        } else if ee == ExecEnv::Sbl {
            self.queue_transition(StateTransition::Sbl);
        }
        Ok(())
    }

    fn sbl_transition(&self) -> Result<()> {
        let ee = self.read_ee()?;
        self.pm_write(|pm| pm.ee = ee)?;
        self.state_event.notify_all();
        let created = self.create_devices(ee)?;
        log::info!("EE {ee}: {created} devices created");
        Ok(())
    }

    /// Publish the mission mode devices and start the channels configured to
    /// start on their own.
    fn mission_mode_transition(&self) -> Result<()> {
        let ee = self.read_ee()?;
        if !ee.is_mission_mode() {
            return Err(MhiError::InvalidState(format!(
                "mission mode transition while the device reports {ee}"
            )));
        }
        let state = self.pm_write(|pm| {
            pm.ee = ee;
            pm.state
        })?;
        self.state_event.notify_all();
        if state.in_error() || state == PmState::DISABLE {
            return Err(MhiError::IoError(format!(
                "mission mode abandoned in PM state {state}"
            )));
        }

        self.create_devices(ee)?;
        let mask = ee.mask_bit();
        for (idx, chan) in self.chans.iter().enumerate() {
            let ready = chan.cfg.auto_start
                && chan.cfg.ee_mask & mask != 0
                && chan.state.read().is_ok_and(|s| *s == ChannelState::Disabled);
            if ready {
                if let Err(e) = self.prepare_channel(idx) {
                    log::error!("auto start of channel {} failed: {e}", chan.cfg.num);
                }
            }
        }

        self.notify_all_clients(StatusEvent::EeMissionMode);
        self.mission_ready.store(true, Ordering::Release);
        self.state_event.notify_all();
        log::info!("device in mission mode ({ee})");
        Ok(())
    }

    /// Pair the channels available in `ee` into devices by name. Devices that
    /// already exist are kept.
    fn create_devices(&self, ee: ExecEnv) -> Result<usize> {
        let mask = ee.mask_bit();
        let mut devices = self.devices.lock()?;
        let mut created = 0;
        for chan in self.chans.iter().filter(|c| c.cfg.ee_mask & mask != 0) {
            let name = chan.cfg.name.as_str();
            if devices.iter().any(|d| d.name() == name) {
                continue;
            }
            let (mut ul, mut dl) = (None, None);
            for (idx, c) in self.chans.iter().enumerate() {
                if c.cfg.name != name || c.cfg.ee_mask & mask == 0 {
                    continue;
                }
                let slot = if c.is_ul() { &mut ul } else { &mut dl };
                if slot.is_none() {
                    *slot = Some(idx);
                }
            }
            devices.push(Arc::new(Device::new(name, ul, dl, self.me.clone())));
            created += 1;
        }
        Ok(created)
    }

    /// The device confirmed M0: restart every doorbell it may have missed.
    pub(crate) fn m0_transition(&self) -> Result<()> {
        let pm = self.pm_write(|pm| {
            if pm.tryset(PmState::M0) == PmState::M0 {
                pm.dev_state = MhiState::M0;
            }
            *pm
        })?;
        if pm.state != PmState::M0 {
            return Err(MhiError::InvalidState(format!(
                "device entered M0 while in PM state {}",
                pm.state
            )));
        }

        if pm.db_access_valid() {
            self.wake_get(true);
            for ev in &self.events {
                ev.ring_db(&self.mmio, self.mem.as_ref());
            }
            {
                let cmd = self.cmd.lock()?;
                if let Some(ring) = cmd.ring.as_ref().filter(|r| !r.is_empty()) {
                    self.mmio
                        .write_db("command", CRDB_LOWER, ring.to_device_address(ring.wp()));
                }
            }
            for chan in &self.chans {
                let state = chan.state.read()?;
                if *state == ChannelState::Disabled {
                    continue;
                }
                let mut rings = chan.rings.lock()?;
                if rings.db.reset_req {
                    rings.db.db_mode = true;
                }
                if rings.tre.as_ref().is_some_and(|r| !r.is_empty()) {
                    self.ring_chan_db(chan, &mut rings);
                }
            }
            self.wake_put(false);
        }

        if let Some(offload) = self.mmio.offload() {
            offload.kick();
        }
        self.state_event.notify_all();
        Ok(())
    }

    /// The device asks to drop to low power. Grant M2 unless there is work in
    /// flight, in which case it is woken straight back up.
    pub(crate) fn m1_transition(&self) -> Result<()> {
        let state = self.pm_write(|pm| {
            if pm.tryset(PmState::M2) == PmState::M2 {
                pm.dev_state = MhiState::M2;
            }
            pm.state
        })?;
        if state != PmState::M2 {
            log::debug!("M1 request ignored in PM state {state}");
            return Ok(());
        }
        self.mmio.write_reg_field(
            MHICTRL,
            MHICTRL_MHISTATE_MASK,
            MHICTRL_MHISTATE_SHIFT,
            MhiState::M2 as u32,
        )?;
        self.state_event.notify_all();

        if self.pending_pkts.load(Ordering::Acquire) > 0
            || self.dev_wake.load(Ordering::Acquire) > 0
        {
            self.wake_get(true);
            self.wake_put(true);
        } else {
            self.ops.status_cb(StatusEvent::Idle);
        }
        Ok(())
    }

    pub(crate) fn m3_transition(&self) -> Result<()> {
        let state = self.pm_write(|pm| {
            if pm.tryset(PmState::M3) == PmState::M3 {
                pm.dev_state = MhiState::M3;
            }
            pm.state
        })?;
        self.state_event.notify_all();
        if state != PmState::M3 {
            return Err(MhiError::InvalidState(format!(
                "device entered M3 while in PM state {state}"
            )));
        }
        Ok(())
    }

    /// A device error was seen. Recovery runs on the state worker; this only
    /// fences the engine off and fails anyone waiting on the device.
    pub(crate) fn sys_err_detect(&self) -> Result<()> {
        let (prev, cur, ee) = self.pm_write(|pm| {
            let prev = pm.state;
            let cur = if pm.ee == ExecEnv::Rddm {
                prev
            } else {
                pm.tryset(PmState::SYS_ERR_DETECT)
            };
            (prev, cur, pm.ee)
        })?;
        if ee == ExecEnv::Rddm {
            log::info!("device error while collecting a RAM dump, ignored");
            return Ok(());
        }
        if prev == PmState::SYS_ERR_DETECT || cur != PmState::SYS_ERR_DETECT {
            return Ok(());
        }

        log::error!("device error detected in PM state {prev}");
        self.state_event.notify_all();
        self.fail_completions();
        self.queue_transition(StateTransition::SysErr);
        Ok(())
    }

    /// Complete every outstanding command with an error code.
    pub(crate) fn fail_completions(&self) {
        for chan in &self.chans {
            chan.completion.complete(CompletionCode::Invalid);
        }
        self.sfr_completion.complete(CompletionCode::Invalid);
    }

    /// Reset the device after an error and start over from the ready state.
    fn sys_err_process(&self) -> Result<()> {
        let state = self.pm_write(|pm| pm.tryset(PmState::SYS_ERR_PROCESS))?;
        if state != PmState::SYS_ERR_PROCESS {
            return Err(MhiError::InvalidState(format!(
                "cannot process a device error in PM state {state}"
            )));
        }
        CounterMetric::sys_error().emit();
        self.mission_ready.store(false, Ordering::Release);
        self.state_event.notify_all();

        self.ops.status_cb(StatusEvent::SysError);
        self.notify_clients(StatusEvent::FatalError);
        self.fail_completions();
        for idx in 0..self.chans.len() {
            self.force_reset_chan(idx);
        }

        if self.cfg.get_rddm_supported() {
            match self.wait_for_state(self.cfg.get_timeout(), |_, ee| ee == ExecEnv::Rddm) {
                Ok(()) => {
                    log::info!("device is collecting a RAM dump, not resetting");
                    return Ok(());
                }
                Err(e) => log::warn!("no RAM dump after the error ({e}), resetting"),
            }
        }

        let res = self.reset_device().and_then(|()| {
            self.cmd.lock()?.rewind(self.mem.as_ref())?;
            Ok(())
        });
        if let Err(e) = res {
            self.pm_write(|pm| pm.tryset(PmState::SYS_ERR_FAIL))?;
            self.state_event.notify_all();
            self.queue_transition(StateTransition::DisableTransition);
            return Err(e);
        }
        self.queue_transition(StateTransition::Ready);
        Ok(())
    }

    /// Turn an engine level protocol violation into device error handling.
    pub(crate) fn escalate(&self, err: &MhiError) {
        log::error!("fatal protocol error: {err}");
        if let Err(e) = self.sys_err_detect() {
            log::error!("cannot start error recovery: {e}");
        }
    }

    /// The device switched to its RAM dump environment. Clients hear about it
    /// once per entry.
    pub(crate) fn rddm_entry(&self) -> Result<()> {
        let first = self.pm_write(|pm| {
            let closing = pm
                .state
                .intersects(PmState::DISABLE | PmState::SHUTDOWN_PROCESS | PmState::SHUTDOWN_NO_ACCESS);
            if pm.ee == ExecEnv::Rddm || closing {
                return false;
            }
            pm.ee = ExecEnv::Rddm;
            true
        })?;
        if !first {
            return Ok(());
        }
        CounterMetric::rddm_entry().emit();
        log::warn!("device entered the RAM dump environment");
        self.mission_ready.store(false, Ordering::Release);
        self.notify_all_clients(StatusEvent::EeRddm);
        self.state_event.notify_all();
        Ok(())
    }

    /// An EE change event from the device.
    pub(crate) fn ee_change(&self, raw: u8) -> Result<()> {
        let ee = ExecEnv::from_device(raw, self.cfg.get_ee_table());
        log::debug!("device EE changed to {ee}");
        match ee {
            ExecEnv::Sbl => {
                self.pm_write(|pm| pm.ee = ee)?;
                self.state_event.notify_all();
                self.queue_transition(StateTransition::Sbl);
            }
            ExecEnv::Amss | ExecEnv::Wfw => self.queue_transition(StateTransition::MissionMode),
            ExecEnv::Rddm => self.rddm_entry()?,
            other => {
                self.pm_write(|pm| pm.ee = other)?;
                self.state_event.notify_all();
            }
        }
        Ok(())
    }

    /// Status to bound clients only.
    pub(crate) fn notify_clients(&self, event: StatusEvent) {
        let mut d = Deliveries::new();
        if let Ok(devices) = self.devices.lock() {
            for dev in devices.iter() {
                if let Some(client) = dev.client() {
                    d.push(Delivery::Status { client, event });
                }
            }
        }
        deliver(d);
    }

    /// Device state as MHISTATUS reports it.
    pub(crate) fn read_dev_state(&self) -> Result<MhiState> {
        let raw = self.mmio.read_reg_field(
            MHISTATUS,
            MHISTATUS_MHISTATE_MASK,
            MHISTATUS_MHISTATE_SHIFT,
        )?;
        MhiState::try_from(raw as u8)
            .map_err(|e| MhiError::ProtocolViolation(format!("MHISTATUS state: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mhi_common::Event;

    use super::*;
    use crate::testing::Harness;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_m1_without_work_reports_idle() {
        let h = Harness::powered();
        h.dev.enter_m1().unwrap();
        h.ctrl
            .wait_for_state(WAIT, |s, _| s == PmState::M2)
            .unwrap();
        assert_eq!(h.ctrl.dev_state(), MhiState::M2);
        assert!(h.ops.statuses().contains(&StatusEvent::Idle));
    }

    #[test]
    fn test_rddm_notifies_clients_once() {
        let mut cfg = Harness::config();
        cfg.set_rddm_supported(true);
        let h = Harness::powered_with(cfg);
        let client = h.bind("LOOPBACK");
        h.dev.enter_rddm();
        h.ctrl
            .wait_for_state(WAIT, |_, ee| ee == ExecEnv::Rddm)
            .unwrap();
        h.dev.post_ctrl_event(Event::ExecEnvChange(3)).unwrap();
        h.dev.enter_rddm();
        // give both reports time to be handled
        h.settle();
        let rddm = client
            .statuses()
            .iter()
            .filter(|s| **s == StatusEvent::EeRddm)
            .count();
        assert_eq!(rddm, 1);
        assert!(!h.ctrl.is_mission_ready());
    }

    #[test]
    fn test_rddm_ignored_without_support() {
        let h = Harness::powered();
        let client = h.bind("LOOPBACK");
        h.dev.enter_rddm();
        h.settle();
        assert_ne!(h.ctrl.ee(), ExecEnv::Rddm);
        assert!(!client.statuses().contains(&StatusEvent::EeRddm));
        assert_eq!(h.ctrl.pm_state(), PmState::M0);
    }

    #[test]
    fn test_sys_err_recovers_to_mission_mode() {
        let h = Harness::powered();
        let client = h.bind("LOOPBACK");
        h.dev.enter_sys_err();
        assert!(h.wait_for(|| client.statuses().contains(&StatusEvent::FatalError)));
        assert!(h.wait_for(|| h.ctrl.is_mission_ready()));
        assert_eq!(h.ctrl.pm_state(), PmState::M0);
        assert!(h.ops.statuses().contains(&StatusEvent::SysError));
        assert!(h.dev.log().contains(&mhi_testing::SimEvent::Reset));
    }
}
