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

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use crossbeam_channel::{Receiver, Sender, unbounded};
use mhi_common::{CompletionCode, DmaDirection, Event, Ring, Tre, TreFlags};
use mhi_host::{
    ChannelConfig, Controller, ControllerConfig, ControllerOps, Device, EventRingConfig,
    EventRingPurpose, MhiClient, MhiFlags, TransferResult,
};
use mhi_testing::{ARENA_BASE, ARENA_SIZE, DeviceMemory, SimDevice, SimDma};

const WAIT: Duration = Duration::from_secs(5);

struct NoOps;

impl ControllerOps for NoOps {}

/// Forwards uplink completions to the benchmark loop.
struct Completions(Sender<usize>);

impl MhiClient for Completions {
    fn ul_xfer_cb(&self, result: TransferResult) {
        let _ = self.0.send(result.bytes_xferd);
    }
}

struct Loopback {
    // keeps the controller alive for the device handle
    _ctrl: Arc<Controller<DeviceMemory>>,
    dev: Arc<Device<DeviceMemory>>,
    done: Receiver<usize>,
}

fn powered_loopback() -> Loopback {
    let mut cfg = ControllerConfig::default();
    cfg.add_event_ring(EventRingConfig::new(EventRingPurpose::Control, 1))
        .add_event_ring(EventRingConfig::new(EventRingPurpose::Data, 2))
        .add_channel(
            ChannelConfig::new(0, "LOOPBACK", DmaDirection::ToDevice, 1).with_elements(128),
        )
        .add_channel(
            ChannelConfig::new(1, "LOOPBACK", DmaDirection::FromDevice, 1).with_elements(128),
        );

    let mem = Arc::new(DeviceMemory::new(ARENA_BASE, ARENA_SIZE));
    let sim = Arc::new(SimDevice::new(mem.clone()));
    let dma = Arc::new(SimDma::new(mem.clone()));
    sim.set_ctrl_event_ring(0);
    let ctrl = Controller::new(cfg, mem, sim.clone(), dma, Arc::new(NoOps)).unwrap();
    let weak = Arc::downgrade(&ctrl);
    sim.set_irq_handler(move |vector| {
        if let Some(ctrl) = weak.upgrade() {
            ctrl.handle_irq(vector);
        }
    });
    ctrl.sync_power_up().unwrap();

    let (tx, done) = unbounded();
    let dev = ctrl.device("LOOPBACK").unwrap();
    dev.bind(Arc::new(Completions(tx))).unwrap();
    dev.prepare_for_transfer().unwrap();
    Loopback {
        _ctrl: ctrl,
        dev,
        done,
    }
}

fn ring_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");

    group.bench_function("advance_256", |b| {
        let mut ring = Ring::host_only(256, Tre::SIZE);
        b.iter(|| {
            while !ring.is_full() {
                ring.advance_write();
            }
            while !ring.is_empty() {
                ring.advance_read();
            }
        });
    });

    let events = [
        Event::Transfer {
            chan: 4,
            ptr: 0x1000_2040,
            len: 1500,
            code: CompletionCode::Eot,
        },
        Event::RscTransfer {
            chan: 100,
            cookie: 17,
            len: 9000,
            code: CompletionCode::Eot,
        },
        Event::CommandCompletion {
            cmd_ptr: 0x1000_0010,
            code: CompletionCode::Success,
        },
    ];
    let encoded: Vec<Tre> = events.iter().map(Event::encode).collect();
    group.bench_function("event_decode", |b| {
        b.iter(|| {
            for tre in &encoded {
                Event::decode(tre).unwrap();
            }
        });
    });

    group.bench_function("transfer_element", |b| {
        b.iter(|| Tre::transfer(0x1000_4000, 4096, TreFlags::IEOT | TreFlags::CHAIN));
    });

    group.finish();
}

fn loopback_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("loopback");
    let lb = powered_loopback();

    for size in [64usize, 1500, 16 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("uplink", size), &size, |b, &size| {
            b.iter(|| {
                lb.dev
                    .queue_transfer(DmaDirection::ToDevice, BytesMut::zeroed(size), MhiFlags::EOT)
                    .unwrap();
                lb.done.recv_timeout(WAIT).unwrap()
            });
        });
    }

    // a full ring's worth queued before the first completion is collected
    group.throughput(Throughput::Elements(64));
    group.bench_function("uplink_burst_64", |b| {
        b.iter(|| {
            for _ in 0..64 {
                lb.dev
                    .queue_transfer(DmaDirection::ToDevice, BytesMut::zeroed(256), MhiFlags::EOT)
                    .unwrap();
            }
            for _ in 0..64 {
                lb.done.recv_timeout(WAIT).unwrap();
            }
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets =
        ring_benchmark,
        loopback_benchmark
}
criterion_main!(benches);
