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

use mhi_common::{Event, MhiState, Tre};

use crate::controller::{Controller, HostMemory};
use crate::device::{Deliveries, deliver};
use crate::error::Result;
use crate::metrics::{CounterMetric, EmittableMetric};

impl<M: HostMemory> Controller<M> {
    /// Drain control ring `er`. No engine lock is held while an element is
    /// handled, since state changes take the PM lock for writing.
    pub(crate) fn process_ctrl_events(&self, er: usize) -> Result<usize> {
        let ev = &self.events[er];
        let mut count = 0;
        while let Some(tre) = ev.pull(self.mem.as_ref())? {
            count += 1;
            if let Err(e) = self.handle_ctrl_event(&tre) {
                if e.is_fatal() {
                    return Err(e);
                }
                log::error!("control event {tre:?} failed: {e}");
            }
        }
        if count > 0 && self.reg_access.load(Ordering::Acquire) {
            ev.ring_db(&self.mmio, self.mem.as_ref());
        }
        Ok(count)
    }

    fn handle_ctrl_event(&self, tre: &Tre) -> Result<()> {
        let event = match Event::decode(tre) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("skipping control element {tre:?}: {e}");
                return Ok(());
            }
        };
        CounterMetric::event(super::kind(&event)).emit();
        log::trace!("control event {event:?}");

        match event {
            Event::StateChange(state) => self.dev_state_change(state),
            Event::CommandCompletion { cmd_ptr, code } => self.cmd_completion(cmd_ptr, code),
            Event::ExecEnvChange(raw) => self.ee_change(raw),
            Event::Transfer { .. } | Event::RscTransfer { .. } => {
                let mut d = Deliveries::new();
                let res = {
                    let pm = self.pm.read()?;
                    self.handle_xfer_event(&pm, event, &mut d)
                };
                deliver(d);
                res
            }
            Event::Stale { .. } => Ok(()),
            Event::TimeSync { .. } | Event::BandwidthRequest { .. } => {
                log::warn!("{:?} on the control event ring", event.event_type());
                Ok(())
            }
        }
    }

    fn dev_state_change(&self, state: MhiState) -> Result<()> {
        match state {
            MhiState::M0 => self.m0_transition(),
            MhiState::M1 => self.m1_transition(),
            MhiState::M3 => self.m3_transition(),
            MhiState::SysErr => self.sys_err_detect(),
            other => {
                log::warn!("unhandled device state change to {other}");
                Ok(())
            }
        }
    }
}
