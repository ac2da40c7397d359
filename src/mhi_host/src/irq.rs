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

//! Interrupt entry points and the worker threads behind them.
//!
//! [`Controller::handle_irq`] may be called from any context, including the
//! thread that is in the middle of a register write, so it never blocks: it
//! only checks ring pointers and queues work. Event rings are drained on the
//! `mhi-events` thread, high priority rings first. Deferred state transitions
//! run on `mhi-state` and bandwidth negotiation on `mhi-bw`, where it is safe
//! to wait for the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{Receiver, Sender, select};
use mhi_common::regs::{MHISTATUS, MHISTATUS_SYSERR_MASK, MHISTATUS_SYSERR_SHIFT};
use mhi_common::{ExecEnv, MhiState};

use crate::config::{EventRingPriority, EventRingPurpose};
use crate::controller::{Controller, HostMemory};
use crate::device::StatusEvent;
use crate::error::{MhiError, Result};
use crate::event::EventRing;

/// A unit of deferred interrupt work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Work {
    /// Drain event ring `n`.
    Ring(usize),
    /// Re-read device state after the BHI interrupt.
    Intvec,
}

#[derive(Debug)]
pub(crate) struct WorkReceivers {
    high: Receiver<Work>,
    normal: Receiver<Work>,
}

/// Queues interrupt work for the event thread.
#[derive(Debug)]
pub(crate) struct EventWorker {
    high: Sender<Work>,
    normal: Sender<Work>,
    intvec_scheduled: AtomicBool,
}

impl EventWorker {
    pub(crate) fn new() -> (Self, WorkReceivers) {
        let (high, high_rx) = crossbeam_channel::unbounded();
        let (normal, normal_rx) = crossbeam_channel::unbounded();
        (
            Self {
                high,
                normal,
                intvec_scheduled: AtomicBool::new(false),
            },
            WorkReceivers {
                high: high_rx,
                normal: normal_rx,
            },
        )
    }

    fn schedule(&self, priority: EventRingPriority, work: Work) {
        let tx = match priority {
            EventRingPriority::High => &self.high,
            EventRingPriority::Normal => &self.normal,
        };
        if tx.send(work).is_err() {
            log::error!("event worker is gone, dropping {work:?}");
        }
    }
}

/// Start the event and state transition threads of `ctrl`. Both exit once the
/// controller is dropped.
pub(crate) fn spawn_workers<M: HostMemory>(
    ctrl: &Arc<Controller<M>>,
    work: WorkReceivers,
    transitions: Receiver<()>,
) -> Result<()> {
    let weak = Arc::downgrade(ctrl);
    thread::Builder::new()
        .name("mhi-events".to_string())
        .spawn(move || event_loop(weak, work))
        .map_err(|e| MhiError::IoError(format!("cannot start event worker: {e}")))?;

    let weak = Arc::downgrade(ctrl);
    thread::Builder::new()
        .name("mhi-state".to_string())
        .spawn(move || {
            while transitions.recv().is_ok() {
                let Some(ctrl) = weak.upgrade() else {
                    return;
                };
                ctrl.process_state_transitions();
            }
        })
        .map_err(|e| MhiError::IoError(format!("cannot start state worker: {e}")))?;
    Ok(())
}

fn event_loop<M: HostMemory>(ctrl: Weak<Controller<M>>, rx: WorkReceivers) {
    loop {
        let next = match rx.high.try_recv() {
            Ok(work) => Ok(work),
            Err(_) => select! {
                recv(rx.high) -> work => work,
                recv(rx.normal) -> work => work,
            },
        };
        let Ok(work) = next else {
            return;
        };
        let Some(ctrl) = ctrl.upgrade() else {
            return;
        };
        ctrl.run_work(work);
    }
}

impl<M: HostMemory> Controller<M> {
    /// Entry point for interrupt `vector` of this controller. Never blocks.
    pub fn handle_irq(&self, vector: u32) {
        if vector == self.cfg.get_intvec() {
            self.intvec_handler();
        }
        for ev in self.events.iter().filter(|ev| ev.cfg.irq == vector) {
            self.msi_handler(ev);
        }
    }

    fn intvec_handler(&self) {
        // wake anyone waiting for a state or EE change first
        self.state_event.notify_all();
        if !self.worker.intvec_scheduled.swap(true, Ordering::AcqRel) {
            self.worker.schedule(EventRingPriority::High, Work::Intvec);
        }
    }

    fn msi_handler(&self, ev: &EventRing) {
        if !ev.has_pending(self.mem.as_ref()) {
            return;
        }
        if ev.cfg.client_managed {
            let client = ev
                .cfg
                .chan
                .and_then(|num| self.chan_idx(num))
                .and_then(|idx| self.chans[idx].client());
            match client {
                Some(client) => client.status_cb(StatusEvent::PendingData),
                None => log::debug!("event ring {}: no client to poll it", ev.index),
            }
            return;
        }
        if !ev.scheduled.swap(true, Ordering::AcqRel) {
            self.worker.schedule(ev.cfg.priority, Work::Ring(ev.index));
        }
    }

    fn run_work(&self, work: Work) {
        match work {
            Work::Intvec => {
                self.worker.intvec_scheduled.store(false, Ordering::Release);
                if let Err(e) = self.intvec_work() {
                    log::error!("state interrupt: {e}");
                }
            }
            Work::Ring(er) => {
                let ev = &self.events[er];
                ev.scheduled.store(false, Ordering::Release);
                if !self.reg_access.load(Ordering::Acquire) {
                    // the device is not reachable; the next M0 drains the ring
                    self.ops.trigger_resume();
                    return;
                }
                if let Err(e) = self.drain_ring(ev) {
                    log::error!("event ring {er}: {e}");
                }
            }
        }
    }

    fn drain_ring(&self, ev: &EventRing) -> Result<()> {
        match ev.cfg.purpose {
            EventRingPurpose::Control => {
                let handled = match self.process_ctrl_events(ev.index) {
                    Ok(n) => n,
                    Err(e) => {
                        if e.is_fatal() {
                            self.escalate(&e);
                        }
                        return Err(e);
                    }
                };
                if handled == 0 {
                    // an interrupt without events may be the only sign of a
                    // device error
                    self.check_sys_err()?;
                }
            }
            EventRingPurpose::Data | EventRingPurpose::RscData => {
                let quota = self.cfg.get_event_quota();
                if self.process_data_events(ev.index, quota)? >= quota
                    && !ev.scheduled.swap(true, Ordering::AcqRel)
                {
                    self.worker.schedule(ev.cfg.priority, Work::Ring(ev.index));
                }
            }
            EventRingPurpose::TimeSync | EventRingPurpose::BwScale => {
                let res = if ev.cfg.purpose == EventRingPurpose::TimeSync {
                    self.process_tsync_events(ev.index)
                } else {
                    self.process_bw_events(ev.index)
                };
                if let Err(e) = res {
                    if e.is_fatal() {
                        self.escalate(&e);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn check_sys_err(&self) -> Result<()> {
        if self.read_dev_state()? == MhiState::SysErr {
            self.sys_err_detect()?;
        }
        Ok(())
    }

    /// Work of the BHI interrupt: pick up EE and error changes the device
    /// signalled without an event.
    fn intvec_work(&self) -> Result<()> {
        if !self.reg_access.load(Ordering::Acquire) {
            return Ok(());
        }
        let ee = self.read_ee()?;
        let syserr = self.mmio.read_reg_field(
            MHISTATUS,
            MHISTATUS_SYSERR_MASK,
            MHISTATUS_SYSERR_SHIFT,
        )? != 0;
        if ee == ExecEnv::Rddm && self.cfg.get_rddm_supported() {
            self.rddm_entry()?;
        } else if syserr || self.read_dev_state()? == MhiState::SysErr {
            self.sys_err_detect()?;
        }
        self.state_event.notify_all();
        Ok(())
    }
}
