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

//! Client devices.
//!
//! A [`Device`] pairs the uplink and downlink channel that share a name and is
//! what a client driver binds to. Completions and status changes reach the
//! client through its [`MhiClient`] implementation; the engine always calls it
//! with no internal lock held, so a callback may queue new buffers.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use bitflags::bitflags;
use bytes::BytesMut;
use mhi_common::DmaDirection;
use smallvec::SmallVec;
use tracing::{Span, instrument};

use crate::controller::{Controller, HostMemory};
use crate::error::{MhiError, Result};
use crate::timesync::TimeSyncResult;

bitflags! {
    /// Per-buffer transfer flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MhiFlags: u32 {
        /// Interrupt at the end of the block.
        const EOB = 1 << 0;
        /// Interrupt at the end of the transfer.
        const EOT = 1 << 1;
        /// The next buffer continues this transfer.
        const CHAIN = 1 << 2;
    }
}

/// A buffer the caller already made visible to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MhiBuf {
    pub dma_addr: u64,
    pub len: usize,
}

/// A buffer handed to the engine and returned on completion.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientBuffer {
    Owned(BytesMut),
    Mapped(MhiBuf),
}

impl ClientBuffer {
    pub fn len(&self) -> usize {
        match self {
            ClientBuffer::Owned(b) => b.len(),
            ClientBuffer::Mapped(m) => m.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The owned bytes, if any.
    pub fn into_bytes(self) -> Option<BytesMut> {
        match self {
            ClientBuffer::Owned(b) => Some(b),
            ClientBuffer::Mapped(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Ok,
    /// The device had more data than the buffer could take.
    Overflow,
    /// The channel was reset with the buffer still queued.
    NotConnected,
}

/// One completed buffer.
#[derive(Debug)]
pub struct TransferResult {
    pub buf: ClientBuffer,
    pub bytes_xferd: usize,
    pub dir: DmaDirection,
    pub transaction_status: TransactionStatus,
}

/// Lifecycle notifications for clients and the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    /// A client managed event ring has events waiting.
    PendingData,
    FatalError,
    /// The device entered its RAM dump environment.
    EeRddm,
    EeMissionMode,
    SysError,
    /// The device may go to low power.
    Idle,
    BandwidthRequest,
}

/// Implemented by client drivers.
pub trait MhiClient: Send + Sync {
    fn ul_xfer_cb(&self, _result: TransferResult) {}

    fn dl_xfer_cb(&self, _result: TransferResult) {}

    fn status_cb(&self, _event: StatusEvent) {}
}

/// A callback collected under the engine's locks, run once they are released.
pub(crate) enum Delivery {
    Xfer {
        client: Arc<dyn MhiClient>,
        ul: bool,
        result: TransferResult,
    },
    Status {
        client: Arc<dyn MhiClient>,
        event: StatusEvent,
    },
}

pub(crate) type Deliveries = SmallVec<[Delivery; 4]>;

pub(crate) fn deliver(deliveries: Deliveries) {
    for d in deliveries {
        match d {
            Delivery::Xfer {
                client,
                ul: true,
                result,
            } => client.ul_xfer_cb(result),
            Delivery::Xfer { client, result, .. } => client.dl_xfer_cb(result),
            Delivery::Status { client, event } => client.status_cb(event),
        }
    }
}

/// The uplink and downlink channels of one name.
pub struct Device<M: HostMemory> {
    name: String,
    pub(crate) ul: Option<usize>,
    pub(crate) dl: Option<usize>,
    ctrl: Weak<Controller<M>>,
    client: RwLock<Option<Arc<dyn MhiClient>>>,
}

impl<M: HostMemory> std::fmt::Debug for Device<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("ul", &self.ul)
            .field("dl", &self.dl)
            .finish_non_exhaustive()
    }
}

impl<M: HostMemory> Device<M> {
    pub(crate) fn new(
        name: &str,
        ul: Option<usize>,
        dl: Option<usize>,
        ctrl: Weak<Controller<M>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            ul,
            dl,
            ctrl,
            client: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ctrl(&self) -> Result<Arc<Controller<M>>> {
        self.ctrl
            .upgrade()
            .ok_or_else(|| MhiError::InvalidState("controller is gone".to_string()))
    }

    fn chan(&self, dir: DmaDirection) -> Result<usize> {
        let idx = match dir {
            DmaDirection::ToDevice => self.ul,
            DmaDirection::FromDevice => self.dl,
            DmaDirection::Bidirectional => self.ul.or(self.dl),
        };
        idx.ok_or_else(|| {
            MhiError::InvalidArgument(format!("{} has no {dir:?} channel", self.name))
        })
    }

    fn chans(&self) -> impl Iterator<Item = usize> + '_ {
        self.ul.into_iter().chain(self.dl.filter(|dl| Some(*dl) != self.ul))
    }

    /// Attach `client`; completions of both channels go to it from now on.
    pub fn bind(&self, client: Arc<dyn MhiClient>) -> Result<()> {
        let ctrl = self.ctrl()?;
        for idx in self.chans() {
            ctrl.chans[idx].set_client(Some(client.clone()))?;
        }
        *self.client.write()? = Some(client);
        Ok(())
    }

    pub fn unbind(&self) -> Result<()> {
        let ctrl = self.ctrl()?;
        for idx in self.chans() {
            ctrl.chans[idx].set_client(None)?;
        }
        *self.client.write()? = None;
        Ok(())
    }

    pub(crate) fn client(&self) -> Option<Arc<dyn MhiClient>> {
        self.client.read().ok().and_then(|c| c.clone())
    }

    /// Start both channels, uplink first. A downlink failure stops the uplink again.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn prepare_for_transfer(&self) -> Result<()> {
        let ctrl = self.ctrl()?;
        if let Some(ul) = self.ul {
            ctrl.prepare_channel(ul)?;
        }
        if let Some(dl) = self.dl.filter(|dl| Some(*dl) != self.ul) {
            if let Err(e) = ctrl.prepare_channel(dl) {
                log::debug!("{}: downlink start failed ({})", self.name, e.errno());
                if let Some(ul) = self.ul {
                    if let Err(undo) = ctrl.unprepare_channel(ul) {
                        log::warn!("{}: rolling back uplink failed: {undo}", self.name);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Reset both channels. Both are torn down even if the device does not answer;
    /// the first failure is returned.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn unprepare_from_transfer(&self) -> Result<()> {
        let ctrl = self.ctrl()?;
        let mut first = Ok(());
        for idx in self.chans() {
            if let Err(e) = ctrl.unprepare_channel(idx) {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn pause_transfer(&self) -> Result<()> {
        let ctrl = self.ctrl()?;
        for idx in self.chans() {
            ctrl.pause_channel(idx)?;
        }
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn resume_transfer(&self) -> Result<()> {
        let ctrl = self.ctrl()?;
        for idx in self.chans() {
            ctrl.resume_channel(idx)?;
        }
        Ok(())
    }

    /// Descriptors that can be queued on the `dir` channel right now.
    pub fn get_no_free_descriptors(&self, dir: DmaDirection) -> Result<usize> {
        let ctrl = self.ctrl()?;
        ctrl.free_descriptors(self.chan(dir)?)
    }

    /// Queue an engine-mapped buffer. Its full length is transferred on uplink
    /// and offered to the device on downlink.
    pub fn queue_transfer(&self, dir: DmaDirection, buf: BytesMut, flags: MhiFlags) -> Result<()> {
        let ctrl = self.ctrl()?;
        let len = buf.len();
        ctrl.queue_buf(self.chan(dir)?, ClientBuffer::Owned(buf), len, flags)
    }

    /// Queue a buffer the caller already mapped.
    pub fn queue_dma(&self, dir: DmaDirection, buf: MhiBuf, flags: MhiFlags) -> Result<()> {
        let ctrl = self.ctrl()?;
        ctrl.queue_buf(self.chan(dir)?, ClientBuffer::Mapped(buf), buf.len, flags)
    }

    /// Drain up to `budget` events of a client managed event ring.
    pub fn poll(&self, budget: usize) -> Result<usize> {
        let ctrl = self.ctrl()?;
        let chan = self.dl.or(self.ul).ok_or_else(|| {
            MhiError::InvalidArgument(format!("{} has no channels", self.name))
        })?;
        let er = ctrl.chans[chan].cfg.er_index;
        if !ctrl.events[er].cfg.client_managed {
            return Err(MhiError::InvalidState(format!(
                "event ring {er} of {} is not client managed",
                self.name
            )));
        }
        ctrl.process_data_events(er, budget)
    }

    /// Ask the device for its time; `cb` runs when the answer arrives.
    pub fn get_remote_time<F>(&self, cb: F) -> Result<()>
    where
        F: FnOnce(TimeSyncResult) + Send + 'static,
    {
        self.ctrl()?.get_remote_time(cb)
    }

    /// Blocking [`get_remote_time`](Self::get_remote_time).
    pub fn get_remote_time_sync(&self, timeout: Duration) -> Result<TimeSyncResult> {
        self.ctrl()?.get_remote_time_sync(timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl MhiClient for Recorder {
        fn ul_xfer_cb(&self, result: TransferResult) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("ul {}", result.bytes_xferd));
        }

        fn dl_xfer_cb(&self, result: TransferResult) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("dl {:?}", result.transaction_status));
        }

        fn status_cb(&self, event: StatusEvent) {
            self.seen.lock().unwrap().push(format!("{event:?}"));
        }
    }

    #[test]
    fn test_deliveries_route_by_direction() {
        let rec = Arc::new(Recorder::default());
        let client: Arc<dyn MhiClient> = rec.clone();
        let mut d = Deliveries::new();
        d.push(Delivery::Xfer {
            client: client.clone(),
            ul: true,
            result: TransferResult {
                buf: ClientBuffer::Owned(BytesMut::zeroed(3)),
                bytes_xferd: 3,
                dir: DmaDirection::ToDevice,
                transaction_status: TransactionStatus::Ok,
            },
        });
        d.push(Delivery::Xfer {
            client: client.clone(),
            ul: false,
            result: TransferResult {
                buf: ClientBuffer::Owned(BytesMut::new()),
                bytes_xferd: 0,
                dir: DmaDirection::FromDevice,
                transaction_status: TransactionStatus::NotConnected,
            },
        });
        d.push(Delivery::Status {
            client,
            event: StatusEvent::EeRddm,
        });
        deliver(d);

        assert_eq!(
            *rec.seen.lock().unwrap(),
            vec!["ul 3", "dl NotConnected", "EeRddm"]
        );
    }

    #[test]
    fn test_client_buffer_len() {
        assert_eq!(ClientBuffer::Owned(BytesMut::zeroed(7)).len(), 7);
        let mapped = ClientBuffer::Mapped(MhiBuf {
            dma_addr: 0x1000,
            len: 64,
        });
        assert_eq!(mapped.len(), 64);
        assert!(mapped.into_bytes().is_none());
    }
}
