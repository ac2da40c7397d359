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

//! Host/device time correlation.
//!
//! A request samples the local clock and rings the timesync doorbell with a
//! sequence number; the device answers on the timesync event ring with its own
//! clock. Requests made while an answer is outstanding join that round trip.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use mhi_common::Event;

use crate::controller::{Controller, HostMemory};
use crate::error::{MhiError, Result};
use crate::log_then_return;
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::pm::Votes;

/// One answered time request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncResult {
    /// Sequence number of the doorbell the device answered.
    pub sequence: u32,
    /// Local timer ticks sampled right before the doorbell.
    pub local_time: u64,
    /// Device timer ticks reported back.
    pub remote_time: u64,
    pub local_ns: u64,
    pub remote_ns: u64,
}

type TimeCallback = Box<dyn FnOnce(TimeSyncResult) + Send>;

#[derive(Default)]
struct TsyncState {
    sequence: u32,
    local_time: u64,
    /// A doorbell was rung and its answer has not arrived yet.
    response_pending: bool,
    waiters: VecDeque<TimeCallback>,
}

pub(crate) struct TimeSync {
    db: u64,
    pub(crate) er_index: usize,
    state: Mutex<TsyncState>,
}

impl std::fmt::Debug for TimeSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSync")
            .field("db", &self.db)
            .field("er_index", &self.er_index)
            .finish_non_exhaustive()
    }
}

impl TimeSync {
    pub(crate) fn new(db: u64, er_index: usize) -> Self {
        Self {
            db,
            er_index,
            state: Mutex::new(TsyncState::default()),
        }
    }

    /// Drop every outstanding request. Returns whether a round trip (and the
    /// vote it holds) was abandoned.
    pub(crate) fn abandon(&self) -> bool {
        match self.state.lock() {
            Ok(mut st) => {
                st.waiters.clear();
                std::mem::take(&mut st.response_pending)
            }
            Err(e) => {
                log::error!("timesync: {e}");
                false
            }
        }
    }
}

fn next_sequence(cur: u32) -> u32 {
    match cur.wrapping_add(1) {
        u32::MAX | 0 => 1,
        n => n,
    }
}

fn ticks_to_ns(ticks: u64, freq: u64) -> u64 {
    (ticks as u128 * 1_000_000_000 / freq.max(1) as u128) as u64
}

impl<M: HostMemory> Controller<M> {
    /// Ask the device for its time. `cb` runs on the event worker with the
    /// local and remote timestamps of the round trip it joined.
    pub fn get_remote_time<F>(&self, cb: F) -> Result<()>
    where
        F: FnOnce(TimeSyncResult) + Send + 'static,
    {
        let tsync = self.tsync.as_ref().ok_or(MhiError::NotConnected)?;
        self.device_get_sync(Votes::DEVICE | Votes::BUS)?;

        let mut st = tsync.state.lock()?;
        if self.pm.read()?.state.in_error() {
            drop(st);
            self.device_put(Votes::DEVICE | Votes::BUS);
            return Err(MhiError::IoError(format!(
                "cannot sample time in PM state {}",
                self.pm_state()
            )));
        }

        st.waiters.push_back(Box::new(cb));
        if st.response_pending {
            // the outstanding round trip holds the vote for everyone
            drop(st);
            self.device_put(Votes::DEVICE | Votes::BUS);
            return Ok(());
        }

        st.sequence = next_sequence(st.sequence);
        self.ops.lpm_disable();
        st.local_time = self.ops.time_get();
        self.mmio.write_reg(tsync.db, st.sequence);
        self.ops.lpm_enable();
        st.response_pending = true;
        log::trace!("timesync request {:#x}", st.sequence);
        Ok(())
    }

    /// Blocking [`get_remote_time`](Self::get_remote_time).
    pub fn get_remote_time_sync(&self, timeout: Duration) -> Result<TimeSyncResult> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.get_remote_time(move |res| {
            // the caller may have stopped waiting
            let _ = tx.send(res);
        })?;
        rx.recv_timeout(timeout)
            .map_err(|_| MhiError::Timeout(timeout))
    }

    /// Handle the newest answer on timesync ring `er`.
    pub(crate) fn process_tsync_events(&self, er: usize) -> Result<()> {
        let ev = &self.events[er];
        let Some(tre) = ev.take_newest(self.mem.as_ref())? else {
            return Ok(());
        };
        if self.pm.read()?.db_access_valid() {
            ev.ring_db(&self.mmio, self.mem.as_ref());
        }

        let event = Event::decode(&tre)?;
        CounterMetric::event(crate::event::kind(&event)).emit();
        let Event::TimeSync {
            sequence,
            remote_time,
        } = event
        else {
            log_then_return!(MhiError::ProtocolViolation(format!(
                "{:?} on the timesync ring",
                event.event_type()
            )));
        };
        let Some(tsync) = self.tsync.as_ref() else {
            return Ok(());
        };

        let (local_time, waiters) = {
            let mut st = tsync.state.lock()?;
            if !st.response_pending {
                log::warn!("timesync answer {sequence:#x} without a request");
                return Ok(());
            }
            st.response_pending = false;
            if st.sequence != sequence {
                log::error!(
                    "timesync answer {sequence:#x}, expected {:#x}; dropping {} request(s)",
                    st.sequence,
                    st.waiters.len()
                );
                st.waiters.clear();
                drop(st);
                self.device_put(Votes::DEVICE | Votes::BUS);
                return Ok(());
            }
            (st.local_time, std::mem::take(&mut st.waiters))
        };
        self.device_put(Votes::DEVICE | Votes::BUS);

        let (local_freq, remote_freq) = self.cfg.get_timer_freqs();
        let res = TimeSyncResult {
            sequence,
            local_time,
            remote_time,
            local_ns: ticks_to_ns(local_time, local_freq),
            remote_ns: ticks_to_ns(remote_time, remote_freq),
        };
        for cb in waiters {
            cb(res);
        }
        Ok(())
    }
}
