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

#![no_main]

use std::sync::{Arc, Mutex, OnceLock};

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use mhi_common::{DmaDirection, Event};
use mhi_host::{
    ChannelConfig, Controller, ControllerConfig, ControllerOps, Device, EventRingConfig,
    EventRingPurpose, MhiFlags,
};
use mhi_testing::{ARENA_BASE, ARENA_SIZE, DeviceMemory, SimDevice};

struct NoOps;

impl ControllerOps for NoOps {}

struct Target {
    ctrl: Arc<Controller<DeviceMemory>>,
    sim: Arc<SimDevice>,
    dev: Arc<Device<DeviceMemory>>,
}

static TARGET: OnceLock<Mutex<Target>> = OnceLock::new();

// Feeds arbitrary events to a running controller. The engine may log, drop or
// escalate them but must never panic, and it must come back to mission mode.
fuzz_target!(
    init: {
        let mut cfg = ControllerConfig::default();
        cfg.add_event_ring(EventRingConfig::new(EventRingPurpose::Control, 1))
            .add_event_ring(EventRingConfig::new(EventRingPurpose::Data, 2))
            .add_channel(ChannelConfig::new(0, "LOOPBACK", DmaDirection::ToDevice, 1))
            .add_channel(ChannelConfig::new(1, "LOOPBACK", DmaDirection::FromDevice, 1));
        let mem = Arc::new(DeviceMemory::new(ARENA_BASE, ARENA_SIZE));
        let sim = Arc::new(SimDevice::new(mem.clone()));
        let dma = Arc::new(mhi_testing::SimDma::new(mem.clone()));
        sim.set_ctrl_event_ring(0);
        let ctrl = Controller::new(cfg, mem, sim.clone(), dma, Arc::new(NoOps)).unwrap();
        let weak = Arc::downgrade(&ctrl);
        sim.set_irq_handler(move |vector| {
            if let Some(ctrl) = weak.upgrade() {
                ctrl.handle_irq(vector);
            }
        });
        ctrl.sync_power_up().unwrap();
        let dev = ctrl.device("LOOPBACK").unwrap();
        dev.prepare_for_transfer().unwrap();
        TARGET.set(Mutex::new(Target { ctrl, sim, dev })).ok().unwrap();
    },

    |data: (Vec<(bool, Event)>, u8)| {
        let (events, queued) = data;
        let target = TARGET.get().unwrap().lock().unwrap();
        for _ in 0..queued % 4 {
            // a full ring or a recovering device refuses the buffer
            let _ = target.dev.queue_transfer(
                DmaDirection::ToDevice,
                BytesMut::zeroed(32),
                MhiFlags::EOT,
            );
        }
        for (ctrl_ring, event) in events {
            let er = if ctrl_ring { 0 } else { 1 };
            let _ = target.sim.post_event(er, event);
        }
        let _ = target.ctrl.wait_for_state(std::time::Duration::from_secs(5), |_, _| {
            target.ctrl.is_mission_ready()
        });
    }
);
