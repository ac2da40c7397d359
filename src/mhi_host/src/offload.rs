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

//! Deferred register writes.
//!
//! Some platforms cannot touch device registers from every context that wants
//! to ring a doorbell. With offload enabled, writes are pushed into a bounded
//! lock-free queue and a dedicated thread performs them in submission order.
//! The queue publishes each entry with release semantics, so the draining
//! thread never observes a slot before its payload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use mhi_common::RegisterIo;

use crate::error::{MhiError, Result};
use crate::new_error;

struct Shared {
    queue: ArrayQueue<(u64, u32)>,
    regs: Arc<dyn RegisterIo>,
    /// Register access allowed by the current power state.
    gate: Arc<AtomicBool>,
    /// Keeps the worker and synchronous flushes from interleaving.
    drain_lock: Mutex<()>,
}

impl Shared {
    fn drain(&self) -> usize {
        let _guard = match self.drain_lock.lock() {
            Ok(g) => g,
            Err(e) => {
                log::error!("register offload drain lock poisoned: {e}");
                return 0;
            }
        };
        let mut n = 0;
        while let Some((addr, val)) = self.queue.pop() {
            self.regs.write_u32(addr, val);
            n += 1;
        }
        n
    }
}

pub(crate) struct RegOffload {
    shared: Arc<Shared>,
    kick: Sender<()>,
}

impl RegOffload {
    /// Create the queue and start its worker thread.
    pub(crate) fn new(
        regs: Arc<dyn RegisterIo>,
        gate: Arc<AtomicBool>,
        queue_len: usize,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(queue_len),
            regs,
            gate,
            drain_lock: Mutex::new(()),
        });
        let (kick, rx) = crossbeam_channel::unbounded();

        let worker = shared.clone();
        thread::Builder::new()
            .name("mhi-reg-offload".to_string())
            .spawn(move || offload_worker(worker, rx))
            .map_err(|e| new_error!("failed to spawn register offload worker: {}", e))?;

        Ok(Self { shared, kick })
    }

    /// Queue a 32-bit register write. Fails with `OutOfMemory` when the queue is full.
    pub(crate) fn enqueue(&self, addr: u64, val: u32) -> Result<()> {
        self.shared
            .queue
            .push((addr, val))
            .map_err(|_| MhiError::OutOfMemory)
    }

    /// Wake the worker. Writes stay queued while register access is not valid.
    pub(crate) fn kick(&self) {
        if self.kick.send(()).is_err() {
            log::warn!("register offload worker is gone");
        }
    }

    /// Perform every queued write on the calling thread.
    pub(crate) fn flush(&self) -> usize {
        self.shared.drain()
    }

    /// Discard every queued write.
    pub(crate) fn reset(&self) -> usize {
        let _guard = self.shared.drain_lock.lock();
        let mut n = 0;
        while self.shared.queue.pop().is_some() {
            n += 1;
        }
        n
    }

    pub(crate) fn pending(&self) -> usize {
        self.shared.queue.len()
    }
}

fn offload_worker(shared: Arc<Shared>, kicks: Receiver<()>) {
    // Exits once the owning `RegOffload`, and with it the sender, is dropped.
    for () in kicks {
        if shared.gate.load(Ordering::Acquire) {
            shared.drain();
        }
    }
    log::debug!("register offload worker exiting");
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[derive(Default)]
    struct RecordingRegs {
        writes: Mutex<Vec<(u64, u32)>>,
    }

    impl RegisterIo for RecordingRegs {
        fn read_u32(&self, _addr: u64) -> u32 {
            0
        }

        fn write_u32(&self, addr: u64, val: u32) {
            self.writes.lock().unwrap().push((addr, val));
        }
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_worker_writes_in_order() {
        let regs = Arc::new(RecordingRegs::default());
        let gate = Arc::new(AtomicBool::new(true));
        let offload = RegOffload::new(regs.clone(), gate, 8).unwrap();

        for i in 0..5 {
            offload.enqueue(0x100 + i * 4, i as u32).unwrap();
        }
        offload.kick();

        assert!(wait_for(|| regs.writes.lock().unwrap().len() == 5));
        let writes = regs.writes.lock().unwrap().clone();
        assert_eq!(
            writes,
            (0..5).map(|i| (0x100 + i * 4, i as u32)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_closed_gate_retains_writes_until_flush() {
        let regs = Arc::new(RecordingRegs::default());
        let gate = Arc::new(AtomicBool::new(false));
        let offload = RegOffload::new(regs.clone(), gate, 4).unwrap();

        offload.enqueue(0x10, 1).unwrap();
        offload.kick();
        thread::sleep(Duration::from_millis(20));
        assert!(regs.writes.lock().unwrap().is_empty());
        assert_eq!(offload.pending(), 1);

        assert_eq!(offload.flush(), 1);
        assert_eq!(*regs.writes.lock().unwrap(), vec![(0x10, 1)]);
    }

    #[test]
    fn test_full_queue_and_reset() {
        let regs = Arc::new(RecordingRegs::default());
        let offload = RegOffload::new(regs.clone(), Arc::new(AtomicBool::new(false)), 2).unwrap();

        offload.enqueue(0, 0).unwrap();
        offload.enqueue(4, 1).unwrap();
        assert!(matches!(offload.enqueue(8, 2), Err(MhiError::OutOfMemory)));

        assert_eq!(offload.reset(), 2);
        assert_eq!(offload.flush(), 0);
        assert!(regs.writes.lock().unwrap().is_empty());
    }
}
