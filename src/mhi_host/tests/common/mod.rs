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
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mhi_common::DmaDirection;
use mhi_host::{
    ChannelConfig, Controller, ControllerConfig, ControllerOps, Device, EventRingConfig,
    EventRingPriority, EventRingPurpose, MhiClient, PmState, StatusEvent, TransferResult,
};
use mhi_testing::{ARENA_BASE, ARENA_SIZE, DeviceMemory, SimDevice, SimDma, SimEvent};

pub const CTRL_ER: u32 = 0;
pub const DATA_ER: u32 = 1;
pub const UL: u32 = 0;
pub const DL: u32 = 1;

/// Platform hooks that only record status changes.
#[derive(Default)]
pub struct Platform {
    pub statuses: Mutex<Vec<StatusEvent>>,
}

impl ControllerOps for Platform {
    fn status_cb(&self, event: StatusEvent) {
        self.statuses.lock().unwrap().push(event);
    }
}

/// A client keeping every completion and status it receives.
#[derive(Default)]
pub struct Recorder {
    pub ul: Mutex<Vec<TransferResult>>,
    pub dl: Mutex<Vec<TransferResult>>,
    pub statuses: Mutex<Vec<StatusEvent>>,
}

impl Recorder {
    pub fn ul_count(&self) -> usize {
        self.ul.lock().unwrap().len()
    }

    pub fn dl_count(&self) -> usize {
        self.dl.lock().unwrap().len()
    }

    pub fn statuses(&self) -> Vec<StatusEvent> {
        self.statuses.lock().unwrap().clone()
    }
}

impl MhiClient for Recorder {
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

pub struct Sim {
    pub ctrl: Arc<Controller<DeviceMemory>>,
    pub dev: Arc<SimDevice>,
    pub dma: Arc<SimDma>,
    pub platform: Arc<Platform>,
}

/// A control ring and a data ring, nothing else.
pub fn base_config() -> ControllerConfig {
    let mut cfg = ControllerConfig::default();
    cfg.set_timeout(Duration::from_secs(2));
    cfg.add_event_ring(
        EventRingConfig::new(EventRingPurpose::Control, 1).with_priority(EventRingPriority::High),
    )
    .add_event_ring(EventRingConfig::new(EventRingPurpose::Data, 2));
    cfg
}

/// A LOOPBACK device on channels 0 and 1 with `elements` per ring.
pub fn loopback_config(elements: usize) -> ControllerConfig {
    let mut cfg = base_config();
    cfg.add_channel(
        ChannelConfig::new(UL, "LOOPBACK", DmaDirection::ToDevice, DATA_ER as usize)
            .with_elements(elements),
    )
    .add_channel(
        ChannelConfig::new(DL, "LOOPBACK", DmaDirection::FromDevice, DATA_ER as usize)
            .with_elements(elements),
    );
    cfg
}

/// Build a controller on a simulated device and bring it to mission mode.
pub fn powered(cfg: ControllerConfig) -> Sim {
    let sim = unpowered(cfg);
    sim.ctrl.sync_power_up().unwrap();
    assert!(wait_for(|| {
        sim.ctrl.pm_state() == PmState::M0
            && sim.ctrl.wake_votes() == 0
            && sim.dev.log().contains(&SimEvent::DevWake(false))
    }));
    sim
}

pub fn unpowered(cfg: ControllerConfig) -> Sim {
    let mem = Arc::new(DeviceMemory::new(ARENA_BASE, ARENA_SIZE));
    let dev = Arc::new(SimDevice::new(mem.clone()));
    let dma = Arc::new(SimDma::new(mem.clone()));
    let platform = Arc::new(Platform::default());
    dev.set_ctrl_event_ring(CTRL_ER);

    let ctrl = Controller::new(cfg, mem, dev.clone(), dma.clone(), platform.clone()).unwrap();
    let weak = Arc::downgrade(&ctrl);
    dev.set_irq_handler(move |vector| {
        if let Some(ctrl) = weak.upgrade() {
            ctrl.handle_irq(vector);
        }
    });
    Sim {
        ctrl,
        dev,
        dma,
        platform,
    }
}

impl Sim {
    pub fn device(&self, name: &str) -> Arc<Device<DeviceMemory>> {
        self.ctrl.device(name).unwrap()
    }

    /// Bind a fresh recorder to `name` and start its channels.
    pub fn open(&self, name: &str) -> (Arc<Device<DeviceMemory>>, Arc<Recorder>) {
        let dev = self.device(name);
        let rec = Arc::new(Recorder::default());
        dev.bind(rec.clone()).unwrap();
        dev.prepare_for_transfer().unwrap();
        (dev, rec)
    }
}

/// Poll `cond` for up to five seconds.
pub fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Give the event workers a moment to run.
pub fn settle() {
    thread::sleep(Duration::from_millis(50));
}
