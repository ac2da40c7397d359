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

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use mhi_common::regs::{BHI_EXECENV, DEV_WAKE_DB, DOORBELL_STRIDE};
use mhi_common::{DmaOps, ExecEnv, MemOps, MhiState, RegisterIo, Tre};
use tracing::{Span, instrument};

use crate::bw_scale::{self, BwScale, LinkInfo};
use crate::channel::{Channel, ChannelInfo};
use crate::cmd::{CmdRing, SfrInfo};
use crate::completion::{Completion, StateEvent};
use crate::config::{ControllerConfig, EventRingPurpose};
use crate::device::{Deliveries, Delivery, Device, StatusEvent, deliver};
use crate::error::{MhiError, Result};
use crate::event::EventRing;
use crate::irq::{self, EventWorker};
use crate::offload::RegOffload;
use crate::pm::transitions::StateTransition;
use crate::pm::{PmInfo, PmState};
use crate::regs::Mmio;
use crate::timesync::TimeSync;

/// Shared memory the engine can drive: ring and context accesses go through it.
pub trait HostMemory: MemOps<Error: Debug> + Send + Sync + 'static {}

impl<T> HostMemory for T where T: MemOps<Error: Debug> + Send + Sync + 'static {}

/// Platform hooks of a controller. Every method has a default so a platform
/// only overrides what it supports.
pub trait ControllerOps: Send + Sync {
    /// Whether the link to the device is up. Consulted when a register reads
    /// back as all ones.
    fn link_status(&self) -> bool {
        true
    }

    /// Bring the link out of low power. Must not block on the engine.
    fn trigger_resume(&self) {}

    fn runtime_get(&self) {}

    fn runtime_put(&self) {}

    /// Controller wide status changes.
    fn status_cb(&self, _event: StatusEvent) {}

    /// Apply the link speed and width the device asked for.
    fn bw_scale(&self, _info: &LinkInfo) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("bandwidth scaling is not supported"))
    }

    /// Local time for timesync, in ticks of the local timer.
    fn time_get(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    /// Keep the link out of low power around a time critical register write.
    fn lpm_disable(&self) {}

    fn lpm_enable(&self) {}
}

/// Register space layout discovered at power up.
#[derive(Debug, Default)]
pub(crate) struct RegBases {
    pub(crate) chdb: AtomicU64,
    pub(crate) erdb: AtomicU64,
    pub(crate) bhi: AtomicU64,
}

/// Context arrays handed to the device, allocated at power up.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Contexts {
    pub(crate) chan: u64,
    pub(crate) chan_len: usize,
    pub(crate) er: u64,
    pub(crate) er_len: usize,
    pub(crate) cmd: u64,
    pub(crate) cmd_len: usize,
}

/// One MHI controller: the rings, channels and power state of a single device.
///
/// Created with [`Controller::new`], which also starts the event and state
/// transition workers. The workers hold only weak references and exit once the
/// last `Arc` is dropped.
pub struct Controller<M: HostMemory> {
    pub(crate) me: Weak<Self>,
    pub(crate) cfg: ControllerConfig,
    pub(crate) mem: Arc<M>,
    pub(crate) mmio: Mmio,
    pub(crate) dma: Arc<dyn DmaOps>,
    pub(crate) ops: Arc<dyn ControllerOps>,
    /// Serialises power up, power down, suspend and resume.
    pub(crate) lifecycle: Mutex<()>,
    pub(crate) pm: RwLock<PmInfo>,
    /// Mirrors `pm.reg_access_valid()` for paths that must not take the PM lock.
    pub(crate) reg_access: Arc<AtomicBool>,
    pub(crate) chans: Vec<Channel>,
    chan_index: HashMap<u32, usize>,
    pub(crate) events: Vec<EventRing>,
    pub(crate) cmd: Mutex<CmdRing>,
    pub(crate) sfr: Mutex<Option<SfrInfo>>,
    pub(crate) sfr_completion: Completion,
    pub(crate) state_event: StateEvent,
    pub(crate) transitions: Mutex<VecDeque<StateTransition>>,
    transition_kick: Sender<()>,
    pub(crate) worker: EventWorker,
    pub(crate) dev_wake: AtomicI32,
    /// The wake doorbell currently reads as asserted.
    pub(crate) wake_set: AtomicBool,
    pub(crate) pending_pkts: AtomicI32,
    pub(crate) bases: RegBases,
    pub(crate) tsync: Option<TimeSync>,
    pub(crate) bw: Option<BwScale>,
    pub(crate) devices: Mutex<Vec<Arc<Device<M>>>>,
    pub(crate) contexts: Mutex<Option<Contexts>>,
    pub(crate) mission_ready: AtomicBool,
}

impl<M: HostMemory> Debug for Controller<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("pm", &self.pm)
            .field("channels", &self.chans.len())
            .field("event_rings", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl<M: HostMemory> Controller<M> {
    /// Build a controller for the device behind `regs` and start its workers.
    /// The device is left untouched until [`power_up`](Self::power_up).
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn new(
        cfg: ControllerConfig,
        mem: Arc<M>,
        regs: Arc<dyn RegisterIo>,
        dma: Arc<dyn DmaOps>,
        ops: Arc<dyn ControllerOps>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;

        let reg_access = Arc::new(AtomicBool::new(false));
        let offload = match cfg.get_reg_write_offload() {
            Some(len) => Some(RegOffload::new(regs.clone(), reg_access.clone(), len)?),
            None => None,
        };
        let mmio = Mmio::new(regs, ops.clone(), offload);

        let chans: Vec<Channel> = cfg.channels.iter().cloned().map(Channel::new).collect();
        let chan_index = chans
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.cfg.num, idx))
            .collect();
        let events: Vec<EventRing> = cfg
            .event_rings
            .iter()
            .cloned()
            .enumerate()
            .map(|(idx, er)| EventRing::new(idx, er))
            .collect();

        let tsync = match (
            cfg.get_tsync_db_offset(),
            cfg.event_rings
                .iter()
                .position(|er| er.purpose == EventRingPurpose::TimeSync),
        ) {
            (Some(db), Some(er)) => Some(TimeSync::new(db, er)),
            _ => None,
        };
        let (bw, bw_requests) = match (
            cfg.get_bw_scale_db_offset(),
            cfg.event_rings
                .iter()
                .position(|er| er.purpose == EventRingPurpose::BwScale),
        ) {
            (Some(db), Some(_)) => {
                let (bw, rx) = BwScale::new(db);
                (Some(bw), Some(rx))
            }
            _ => (None, None),
        };

        let (worker, work_rx) = EventWorker::new();
        let (transition_kick, transition_rx) = crossbeam_channel::unbounded();

        let ctrl = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            cfg,
            mem,
            mmio,
            dma,
            ops,
            lifecycle: Mutex::new(()),
            pm: RwLock::new(PmInfo::new()),
            reg_access,
            chans,
            chan_index,
            events,
            cmd: Mutex::new(CmdRing::default()),
            sfr: Mutex::new(None),
            sfr_completion: Completion::default(),
            state_event: StateEvent::default(),
            transitions: Mutex::new(VecDeque::new()),
            transition_kick,
            worker,
            dev_wake: AtomicI32::new(0),
            wake_set: AtomicBool::new(false),
            pending_pkts: AtomicI32::new(0),
            bases: RegBases::default(),
            tsync,
            bw,
            devices: Mutex::new(Vec::new()),
            contexts: Mutex::new(None),
            mission_ready: AtomicBool::new(false),
        });

        irq::spawn_workers(&ctrl, work_rx, transition_rx)?;
        if let Some(requests) = bw_requests {
            bw_scale::spawn_bw_worker(&ctrl, requests)?;
        }
        Ok(ctrl)
    }

    /// Update the PM state and keep the register access gate in step.
    pub(crate) fn pm_write<T>(&self, f: impl FnOnce(&mut PmInfo) -> T) -> Result<T> {
        let mut pm = self.pm.write()?;
        let ret = f(&mut pm);
        self.reg_access
            .store(pm.reg_access_valid(), Ordering::Release);
        Ok(ret)
    }

    pub(crate) fn chan_idx(&self, num: u32) -> Option<usize> {
        self.chan_index.get(&num).copied()
    }

    pub(crate) fn chdb_addr(&self, num: u32) -> u64 {
        self.bases.chdb.load(Ordering::Acquire) + num as u64 * DOORBELL_STRIDE
    }

    pub(crate) fn erdb_addr(&self, idx: usize) -> u64 {
        self.bases.erdb.load(Ordering::Acquire) + idx as u64 * DOORBELL_STRIDE
    }

    /// Read the device's execution environment.
    pub(crate) fn read_ee(&self) -> Result<ExecEnv> {
        let raw = self
            .mmio
            .read_reg(self.bases.bhi.load(Ordering::Acquire) + BHI_EXECENV)?;
        Ok(ExecEnv::from_device(raw as u8, self.cfg.get_ee_table()))
    }

    /// Queue deferred work for the state transition worker.
    pub(crate) fn queue_transition(&self, transition: StateTransition) {
        match self.transitions.lock() {
            Ok(mut q) => q.push_back(transition),
            Err(e) => {
                log::error!("dropping state transition {transition:?}: {e}");
                return;
            }
        }
        if self.transition_kick.send(()).is_err() {
            log::error!("state transition worker is gone");
        }
    }

    /// Tell the platform and every bound client about `event`.
    pub(crate) fn notify_all_clients(&self, event: StatusEvent) {
        self.ops.status_cb(event);
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

    pub(crate) fn dev_wake_db(&self) -> u64 {
        self.chdb_addr(DEV_WAKE_DB as u32)
    }

    /// Current host power state.
    pub fn pm_state(&self) -> PmState {
        self.pm
            .read()
            .map(|pm| pm.state)
            .unwrap_or(PmState::LD_ERR_FATAL_DETECT)
    }

    /// Execution environment as last seen by the host.
    pub fn ee(&self) -> ExecEnv {
        self.pm
            .read()
            .map(|pm| pm.ee)
            .unwrap_or(ExecEnv::NotSupported)
    }

    /// MHI state the device last confirmed.
    pub fn dev_state(&self) -> MhiState {
        self.pm
            .read()
            .map(|pm| pm.dev_state)
            .unwrap_or(MhiState::SysErr)
    }

    /// Uplink buffers queued and not completed.
    pub fn pending_packets(&self) -> i32 {
        self.pending_pkts.load(Ordering::Acquire)
    }

    /// Outstanding device wake votes.
    pub fn wake_votes(&self) -> i32 {
        self.dev_wake.load(Ordering::Acquire)
    }

    /// Block until `cond` holds for the PM state and EE, or `timeout` passes.
    pub fn wait_for_state<F>(&self, timeout: Duration, cond: F) -> Result<()>
    where
        F: Fn(PmState, ExecEnv) -> bool,
    {
        let reached = self.state_event.wait_until(timeout, || {
            self.pm
                .read()
                .map(|pm| cond(pm.state, pm.ee))
                .unwrap_or(true)
        })?;
        if reached {
            Ok(())
        } else {
            Err(MhiError::Timeout(timeout))
        }
    }

    /// Snapshot of channel `num`.
    pub fn channel_info(&self, num: u32) -> Option<ChannelInfo> {
        let idx = self.chan_idx(num)?;
        self.chans[idx].info().ok()
    }

    /// The device named `name`, once the engine has created it.
    pub fn device(&self, name: &str) -> Option<Arc<Device<M>>> {
        self.devices
            .lock()
            .ok()?
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Device<M>>> {
        self.devices
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// The raw element event ring `er` handled last, kept for post-mortem dumps.
    pub fn last_event(&self, er: usize) -> Option<Tre> {
        self.events.get(er)?.last_event()
    }

    /// Whether the mission mode transition has run to completion.
    pub fn is_mission_ready(&self) -> bool {
        self.mission_ready.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mhi_common::DmaDirection;

    use super::*;
    use crate::config::ChannelConfig;
    use crate::testing::Harness;

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut cfg = ControllerConfig::default();
        cfg.add_channel(ChannelConfig::new(0, "LOOP", DmaDirection::ToDevice, 0));
        assert!(matches!(
            Harness::try_with_config(cfg),
            Err(MhiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_fresh_controller_is_disabled() {
        let h = Harness::new();
        assert_eq!(h.ctrl.pm_state(), PmState::DISABLE);
        assert_eq!(h.ctrl.ee(), ExecEnv::NotSupported);
        assert!(h.ctrl.devices().is_empty());
        assert!(matches!(
            h.ctrl
                .wait_for_state(Duration::from_millis(5), |s, _| s == PmState::M0),
            Err(MhiError::Timeout(_))
        ));
    }

    #[test]
    fn test_power_up_reaches_mission_mode() {
        let h = Harness::powered();
        assert_eq!(h.ctrl.pm_state(), PmState::M0);
        assert_eq!(h.ctrl.ee(), ExecEnv::Amss);
        assert_eq!(h.ctrl.dev_state(), MhiState::M0);
        assert!(h.ctrl.device("LOOPBACK").is_some());
        assert_eq!(h.ctrl.wake_votes(), 0);
    }
}
