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

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mhi_common::DmaDirection;
use mhi_testing::device::{BW_SCALE_DB, TSYNC_DB};
use mhi_testing::{ARENA_BASE, ARENA_SIZE, DeviceMemory, SimDevice, SimDma, SimEvent};

use crate::bw_scale::LinkInfo;
use crate::config::{
    ChannelConfig, ControllerConfig, EventRingConfig, EventRingPriority, EventRingPurpose,
};
use crate::controller::{Controller, ControllerOps};
use crate::device::{Device, MhiClient, StatusEvent, TransferResult};
use crate::error::Result;
use crate::pm::PmState;

/// Platform hooks that record what the engine tells the platform.
#[derive(Default)]
pub(crate) struct RecordingOps {
    statuses: Mutex<Vec<StatusEvent>>,
    refuse_bw: AtomicBool,
    clock: AtomicU64,
}

impl RecordingOps {
    pub(crate) fn statuses(&self) -> Vec<StatusEvent> {
        self.statuses.lock().unwrap().clone()
    }

    pub(crate) fn accept_bw_scale(&self, accept: bool) {
        self.refuse_bw.store(!accept, Ordering::SeqCst);
    }
}

impl ControllerOps for RecordingOps {
    fn status_cb(&self, event: StatusEvent) {
        self.statuses.lock().unwrap().push(event);
    }

    fn bw_scale(&self, _info: &LinkInfo) -> anyhow::Result<()> {
        if self.refuse_bw.load(Ordering::SeqCst) {
            anyhow::bail!("link cannot be retrained");
        }
        Ok(())
    }

    fn time_get(&self) -> u64 {
        self.clock.fetch_add(100, Ordering::SeqCst)
    }
}

/// A client that keeps everything it is handed.
#[derive(Default)]
pub(crate) struct RecordingClient {
    statuses: Mutex<Vec<StatusEvent>>,
    pub(crate) ul: Mutex<Vec<TransferResult>>,
    pub(crate) dl: Mutex<Vec<TransferResult>>,
}

impl RecordingClient {
    pub(crate) fn statuses(&self) -> Vec<StatusEvent> {
        self.statuses.lock().unwrap().clone()
    }
}

impl MhiClient for RecordingClient {
    fn ul_xfer_cb(&self, result: TransferResult) {
        self.ul.lock().unwrap().push(result);
    }

    fn dl_xfer_cb(&self, result: TransferResult) {
        self.dl.lock().unwrap().push(result);
    }

    fn status_cb(&self, event: StatusEvent) {
        self.statuses.lock().unwrap().push(event);
    }
}

/// A controller wired to a simulated device.
pub(crate) struct Harness {
    pub(crate) ctrl: Arc<Controller<DeviceMemory>>,
    pub(crate) dev: Arc<SimDevice>,
    pub(crate) dma: Arc<SimDma>,
    pub(crate) ops: Arc<RecordingOps>,
}

impl Harness {
    pub(crate) const CTRL_ER: u32 = 0;
    pub(crate) const DATA_ER: u32 = 1;
    pub(crate) const TSYNC_ER: u32 = 2;
    pub(crate) const BW_ER: u32 = 3;
    pub(crate) const UL_CHAN: u32 = 0;
    pub(crate) const DL_CHAN: u32 = 1;

    const WAIT: Duration = Duration::from_secs(5);

    fn base_config() -> ControllerConfig {
        let mut cfg = ControllerConfig::default();
        cfg.set_timeout(Duration::from_secs(2));
        cfg.add_event_ring(
            EventRingConfig::new(EventRingPurpose::Control, 1)
                .with_priority(EventRingPriority::High),
        )
        .add_event_ring(EventRingConfig::new(EventRingPurpose::Data, 2))
        .add_channel(ChannelConfig::new(
            Self::UL_CHAN,
            "LOOPBACK",
            DmaDirection::ToDevice,
            Self::DATA_ER as usize,
        ))
        .add_channel(ChannelConfig::new(
            Self::DL_CHAN,
            "LOOPBACK",
            DmaDirection::FromDevice,
            Self::DATA_ER as usize,
        ));
        cfg
    }

    /// Loopback channels plus timesync and bandwidth scaling rings.
    pub(crate) fn config() -> ControllerConfig {
        let mut cfg = Self::base_config();
        cfg.add_event_ring(EventRingConfig::new(EventRingPurpose::TimeSync, 3))
            .add_event_ring(EventRingConfig::new(EventRingPurpose::BwScale, 3));
        cfg.set_tsync_db_offset(TSYNC_DB);
        cfg.set_bw_scale_db_offset(BW_SCALE_DB);
        cfg
    }

    pub(crate) fn try_with_config(cfg: ControllerConfig) -> Result<Self> {
        let mem = Arc::new(DeviceMemory::new(ARENA_BASE, ARENA_SIZE));
        let dev = Arc::new(SimDevice::new(mem.clone()));
        let dma = Arc::new(SimDma::new(mem.clone()));
        let ops = Arc::new(RecordingOps::default());
        dev.set_ctrl_event_ring(Self::CTRL_ER);
        if cfg.get_tsync_db_offset().is_some() {
            dev.set_tsync_responder(Some(Self::TSYNC_ER));
        }

        let ctrl = Controller::new(cfg, mem, dev.clone(), dma.clone(), ops.clone())?;
        let weak = Arc::downgrade(&ctrl);
        dev.set_irq_handler(move |vector| {
            if let Some(ctrl) = weak.upgrade() {
                ctrl.handle_irq(vector);
            }
        });
        Ok(Self {
            ctrl,
            dev,
            dma,
            ops,
        })
    }

    pub(crate) fn new() -> Self {
        Self::try_with_config(Self::config()).unwrap()
    }

    /// Powered up, in mission mode, with the M0 doorbell work done.
    pub(crate) fn powered() -> Self {
        Self::new().into_powered()
    }

    pub(crate) fn powered_with(cfg: ControllerConfig) -> Self {
        Self::try_with_config(cfg).unwrap().into_powered()
    }

    pub(crate) fn powered_without_sideband() -> Self {
        Self::try_with_config(Self::base_config())
            .unwrap()
            .into_powered()
    }

    fn into_powered(self) -> Self {
        self.ctrl.sync_power_up().unwrap();
        assert!(self.wait_for(|| {
            self.ctrl.pm_state() == PmState::M0
                && self.ctrl.wake_votes() == 0
                && self.dev.log().contains(&SimEvent::DevWake(false))
        }));
        self
    }

    pub(crate) fn loopback(&self) -> Arc<Device<DeviceMemory>> {
        self.ctrl.device("LOOPBACK").unwrap()
    }

    /// Bind a recording client to device `name`.
    pub(crate) fn bind(&self, name: &str) -> Arc<RecordingClient> {
        let client = Arc::new(RecordingClient::default());
        self.ctrl
            .device(name)
            .unwrap()
            .bind(client.clone())
            .unwrap();
        client
    }

    /// Poll `cond` until it holds or a few seconds pass.
    pub(crate) fn wait_for(&self, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Self::WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    /// Let the workers run for a moment.
    pub(crate) fn settle(&self) {
        thread::sleep(Duration::from_millis(50));
    }
}
