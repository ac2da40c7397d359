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

//! Channels.
//!
//! A channel owns a transfer ring shared with the device and a host-only buffer
//! ring of the same capacity. Slot `i` of the buffer ring remembers what was
//! queued in TRE `i`: the client buffer, its mapping and its length.
//!
//! Locking: `state` is taken for read on the data path and for write only on
//! lifecycle transitions and doorbell mode changes; `rings` guards both rings
//! and the doorbell state. `lifecycle` serialises prepare, unprepare, pause and
//! resume of one channel.

use std::sync::{Arc, Mutex, RwLock};

use mhi_common::context::{
    CHAN_CTX_BRSTMODE_DISABLE, CHAN_CTX_BRSTMODE_ENABLE, CHAN_TYPE_INBOUND,
    CHAN_TYPE_INBOUND_COALESCED, CHAN_TYPE_OUTBOUND,
};
use mhi_common::{DmaDirection, Ring};

use crate::completion::Completion;
use crate::config::{ChannelConfig, DoorbellMode, TransferType};
use crate::device::{ClientBuffer, MhiClient};
use crate::dma::Mapping;
use crate::error::Result;
use crate::regs::DbCfg;

/// Ring set-up, tear-down and channel commands.
pub(crate) mod lifecycle;
/// Buffer queueing and TRE generation.
pub(crate) mod queue;

/// Host view of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Disabled,
    Enabled,
    /// Stopped with its rings intact.
    Suspended,
    Stop,
    Error,
}

/// Bookkeeping for one transfer ring slot.
#[derive(Debug, Default)]
pub(crate) struct BufInfo {
    pub(crate) buf: Option<ClientBuffer>,
    pub(crate) mapping: Option<Mapping>,
    pub(crate) len: usize,
    /// RSC slots are retired by cookie rather than in ring order.
    pub(crate) used: bool,
}

#[derive(Debug)]
pub(crate) struct ChanRings {
    /// Present while the channel is prepared.
    pub(crate) tre: Option<Ring>,
    pub(crate) buf: Ring,
    pub(crate) bufs: Vec<BufInfo>,
    pub(crate) db: DbCfg,
    pub(crate) db_addr: u64,
    /// Device address of the channel context.
    pub(crate) ctxt: u64,
}

impl ChanRings {
    fn new(cfg: &ChannelConfig) -> Self {
        Self {
            tre: None,
            buf: Ring::host_only(cfg.elements, 1),
            bufs: (0..cfg.elements).map(|_| BufInfo::default()).collect(),
            db: DbCfg::new(cfg.doorbell, cfg.doorbell_mode_switch),
            db_addr: 0,
            ctxt: 0,
        }
    }
}

pub(crate) struct Channel {
    pub(crate) cfg: ChannelConfig,
    pub(crate) state: RwLock<ChannelState>,
    pub(crate) rings: Mutex<ChanRings>,
    pub(crate) completion: Completion,
    pub(crate) lifecycle: Mutex<()>,
    client: RwLock<Option<Arc<dyn MhiClient>>>,
}

impl Channel {
    pub(crate) fn new(cfg: ChannelConfig) -> Self {
        let rings = ChanRings::new(&cfg);
        Self {
            cfg,
            state: RwLock::new(ChannelState::Disabled),
            rings: Mutex::new(rings),
            completion: Completion::default(),
            lifecycle: Mutex::new(()),
            client: RwLock::new(None),
        }
    }

    pub(crate) fn set_client(&self, client: Option<Arc<dyn MhiClient>>) -> Result<()> {
        *self.client.write()? = client;
        Ok(())
    }

    pub(crate) fn client(&self) -> Option<Arc<dyn MhiClient>> {
        self.client.read().ok().and_then(|c| c.clone())
    }

    /// Completions go to the uplink callback.
    pub(crate) fn is_ul(&self) -> bool {
        self.cfg.dir != DmaDirection::FromDevice
    }

    pub(crate) fn is_rsc(&self) -> bool {
        self.cfg.xfer_type == TransferType::Rsc
    }

    /// Channel type advertised in the context.
    pub(crate) fn ctxt_kind(&self) -> u32 {
        match (self.cfg.dir, self.cfg.xfer_type) {
            (DmaDirection::FromDevice, TransferType::Rsc) => CHAN_TYPE_INBOUND_COALESCED,
            (DmaDirection::FromDevice, TransferType::Normal) => CHAN_TYPE_INBOUND,
            // offload style bidirectional channels are described as outbound
            (DmaDirection::ToDevice | DmaDirection::Bidirectional, _) => CHAN_TYPE_OUTBOUND,
        }
    }

    pub(crate) fn brstmode(&self) -> u32 {
        match self.cfg.doorbell {
            DoorbellMode::Burst => CHAN_CTX_BRSTMODE_ENABLE,
            DoorbellMode::Disable => CHAN_CTX_BRSTMODE_DISABLE,
        }
    }

    pub(crate) fn info(&self) -> Result<ChannelInfo> {
        let state = *self.state.read()?;
        let rings = self.rings.lock()?;
        let (tre_rp, tre_wp, outstanding) = match &rings.tre {
            Some(r) => (
                Some(r.to_device_address(r.rp())),
                Some(r.to_device_address(r.wp())),
                r.outstanding(),
            ),
            None => (None, None, 0),
        };
        Ok(ChannelInfo {
            num: self.cfg.num,
            state,
            db_mode: rings.db.db_mode,
            tre_rp,
            tre_wp,
            outstanding,
            used: rings.bufs.iter().filter(|b| b.used).count(),
        })
    }
}

/// A snapshot of one channel, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    pub num: u32,
    pub state: ChannelState,
    /// The next doorbell will be rung even in burst mode.
    pub db_mode: bool,
    /// Device addresses of the transfer ring cursors, while prepared.
    pub tre_rp: Option<u64>,
    pub tre_wp: Option<u64>,
    /// Queued elements not yet completed.
    pub outstanding: usize,
    /// Buffer slots still owned by the device.
    pub used: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_kind() {
        let ul = Channel::new(ChannelConfig::new(0, "A", DmaDirection::ToDevice, 1));
        let dl = Channel::new(ChannelConfig::new(1, "A", DmaDirection::FromDevice, 1));
        let rsc = Channel::new(
            ChannelConfig::new(3, "IP_HW", DmaDirection::FromDevice, 1)
                .with_transfer_type(TransferType::Rsc)
                .with_doorbell_mode(DoorbellMode::Burst),
        );
        assert_eq!(ul.ctxt_kind(), CHAN_TYPE_OUTBOUND);
        assert_eq!(dl.ctxt_kind(), CHAN_TYPE_INBOUND);
        assert_eq!(rsc.ctxt_kind(), CHAN_TYPE_INBOUND_COALESCED);
        assert_eq!(rsc.brstmode(), CHAN_CTX_BRSTMODE_ENABLE);
        assert!(ul.is_ul() && !dl.is_ul());
    }

    #[test]
    fn test_fresh_channel_info() {
        let chan = Channel::new(ChannelConfig::new(4, "DIAG", DmaDirection::ToDevice, 1).with_elements(8));
        let info = chan.info().unwrap();
        assert_eq!(info.state, ChannelState::Disabled);
        assert!(info.db_mode);
        assert_eq!(info.tre_rp, None);
        assert_eq!(chan.rings.lock().unwrap().bufs.len(), 8);
    }
}
