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

use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use mhi_common::Event;

use crate::controller::{Controller, HostMemory};
use crate::device::StatusEvent;
use crate::error::{MhiError, Result};
use crate::log_then_return;
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::pm::Votes;

/// Result codes written back to the device.
const BW_SCALE_ACK: u32 = 0;
const BW_SCALE_NACK: u32 = 0xF;

/// Link parameters the device asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub target_link_speed: u8,
    pub target_link_width: u8,
    pub sequence_num: u8,
}

#[derive(Debug)]
pub(crate) struct BwScale {
    db: u64,
    /// Held across a negotiation; guards the link info it settles on.
    cur: Mutex<LinkInfo>,
    /// Requests for the `mhi-bw` worker.
    requests: Sender<LinkInfo>,
}

impl BwScale {
    pub(crate) fn new(db: u64) -> (Self, Receiver<LinkInfo>) {
        let (requests, rx) = crossbeam_channel::unbounded();
        (
            Self {
                db,
                cur: Mutex::new(LinkInfo::default()),
                requests,
            },
            rx,
        )
    }
}

/// Start the bandwidth negotiation worker. Negotiation waits for the device
/// to reach M0, and that state change arrives on the event thread, so it
/// cannot run there.
pub(crate) fn spawn_bw_worker<M: HostMemory>(
    ctrl: &Arc<Controller<M>>,
    requests: Receiver<LinkInfo>,
) -> Result<()> {
    let weak = Arc::downgrade(ctrl);
    thread::Builder::new()
        .name("mhi-bw".to_string())
        .spawn(move || {
            while let Ok(info) = requests.recv() {
                // a newer request supersedes anything still queued
                let info = requests.try_iter().last().unwrap_or(info);
                let Some(ctrl) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = ctrl.negotiate_bw(&info) {
                    log::error!("bandwidth request {}: {e}", info.sequence_num);
                }
            }
        })
        .map_err(|e| MhiError::IoError(format!("cannot start bandwidth worker: {e}")))?;
    Ok(())
}

fn bw_result(ack: bool, sequence: u8) -> u32 {
    let code = if ack { BW_SCALE_ACK } else { BW_SCALE_NACK };
    (code << 8) | sequence as u32
}

impl<M: HostMemory> Controller<M> {
    /// Link parameters last agreed with the device.
    pub fn link_info(&self) -> Option<LinkInfo> {
        let bw = self.bw.as_ref()?;
        bw.cur.lock().ok().map(|cur| *cur)
    }

    /// Pick up the newest bandwidth request on ring `er` and hand it to the
    /// bandwidth worker.
    pub(crate) fn process_bw_events(&self, er: usize) -> Result<()> {
        let ev = &self.events[er];
        let Some(tre) = ev.take_newest(self.mem.as_ref())? else {
            return Ok(());
        };
        if self.pm.read()?.db_access_valid() {
            ev.ring_db(&self.mmio, self.mem.as_ref());
        }

        let event = Event::decode(&tre)?;
        CounterMetric::event(crate::event::kind(&event)).emit();
        let Event::BandwidthRequest {
            link_speed,
            link_width,
            sequence,
        } = event
        else {
            log_then_return!(MhiError::ProtocolViolation(format!(
                "{:?} on the bandwidth scaling ring",
                event.event_type()
            )));
        };
        let Some(bw) = self.bw.as_ref() else {
            return Ok(());
        };
        let info = LinkInfo {
            target_link_speed: link_speed,
            target_link_width: link_width,
            sequence_num: sequence,
        };
        log::debug!("bandwidth request {info:?}");
        self.ops.status_cb(StatusEvent::BandwidthRequest);
        if bw.requests.send(info).is_err() {
            log::error!("bandwidth worker is gone, dropping request {sequence}");
        }
        Ok(())
    }

    /// Wake the device, let the platform retrain the link and report the
    /// outcome.
    fn negotiate_bw(&self, info: &LinkInfo) -> Result<()> {
        let Some(bw) = self.bw.as_ref() else {
            return Ok(());
        };
        self.device_get_sync(Votes::DEVICE | Votes::BUS)?;
        let res = (|| -> Result<()> {
            let mut cur = bw.cur.lock()?;
            let ack = match self.ops.bw_scale(info) {
                Ok(()) => {
                    *cur = *info;
                    true
                }
                Err(e) => {
                    log::warn!("bandwidth request {} refused: {e:#}", info.sequence_num);
                    false
                }
            };
            if self.pm.read()?.db_access_valid() {
                self.mmio
                    .write_reg(bw.db, bw_result(ack, info.sequence_num));
            }
            Ok(())
        })();
        self.device_put(Votes::DEVICE | Votes::BUS);
        res
    }
}

#[cfg(test)]
mod tests {
    use mhi_common::MhiState;
    use mhi_testing::SimEvent;

    use super::*;
    use crate::pm::PmState;
    use crate::testing::Harness;

    #[test]
    fn test_result_encoding() {
        assert_eq!(bw_result(true, 7), 0x007);
        assert_eq!(bw_result(false, 0x2a), 0xF2a);
    }

    fn request(h: &Harness, sequence: u8) {
        h.dev
            .post_event(
                Harness::BW_ER,
                Event::BandwidthRequest {
                    link_speed: 3,
                    link_width: 2,
                    sequence,
                },
            )
            .unwrap();
    }

    fn results(h: &Harness) -> Vec<u32> {
        h.dev
            .log()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::BwScaleResult(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_accepted_request_updates_link_info() {
        let h = Harness::powered();
        h.ops.accept_bw_scale(true);
        request(&h, 5);
        assert!(h.wait_for(|| results(&h) == vec![5]));
        assert_eq!(
            h.ctrl.link_info(),
            Some(LinkInfo {
                target_link_speed: 3,
                target_link_width: 2,
                sequence_num: 5,
            })
        );
        assert!(h.ops.statuses().contains(&StatusEvent::BandwidthRequest));
        assert!(h.wait_for(|| h.ctrl.wake_votes() == 0));
    }

    #[test]
    fn test_refused_request_is_nacked() {
        let h = Harness::powered();
        h.ops.accept_bw_scale(false);
        request(&h, 9);
        assert!(h.wait_for(|| results(&h) == vec![0xF09]));
        assert_eq!(h.ctrl.link_info(), Some(LinkInfo::default()));
    }

    #[test]
    fn test_request_during_resume_waits_for_m0() {
        let h = Harness::powered();
        h.ops.accept_bw_scale(true);
        h.ctrl.pm_suspend().unwrap();
        assert_eq!(
            h.ctrl.pm_write(|pm| pm.tryset(PmState::M3_EXIT)).unwrap(),
            PmState::M3_EXIT
        );

        request(&h, 4);
        assert!(h.wait_for(|| h.ops.statuses().contains(&StatusEvent::BandwidthRequest)));
        assert!(results(&h).is_empty());

        // the M0 confirmation is drained while the negotiation waits for it
        h.dev.post_ctrl_event(Event::StateChange(MhiState::M0)).unwrap();
        assert!(h.wait_for(|| h.ctrl.pm_state() == PmState::M0));
        assert!(h.wait_for(|| results(&h) == vec![4]));
        assert_eq!(h.ctrl.link_info().map(|l| l.sequence_num), Some(4));
        assert!(h.wait_for(|| h.ctrl.wake_votes() == 0));
    }
}
