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

//! Ring contexts
//!
//! The host describes every ring to the device with a context entry in one of
//! three arrays (channels, event rings, command ring) whose base addresses are
//! programmed into CCABAP, ECABAP and CRCBAP. The three context flavours share
//! one layout; only the meaning of the leading words differs.
//!
//! The `rp`/`wp` fields are the synchronization points of the protocol:
//!
//! - transfer and command rings: the host publishes `wp`, the device publishes `rp`
//! - event rings: the device publishes `rp` (its write position), the host
//!   publishes `wp` (how far the device may write)

use bytemuck::{Pod, Zeroable};

use crate::MemOps;

/// Channel context state, low byte of [`RingContext::cfg`].
pub const CHAN_CTX_DISABLED: u32 = 0;
pub const CHAN_CTX_ENABLED: u32 = 1;
pub const CHAN_CTX_RUNNING: u32 = 2;
pub const CHAN_CTX_SUSPENDED: u32 = 3;
pub const CHAN_CTX_STOP: u32 = 4;
pub const CHAN_CTX_ERROR: u32 = 5;

/// Burst mode field of a channel context, bits 9:8 of [`RingContext::cfg`].
pub const CHAN_CTX_BRSTMODE_DISABLE: u32 = 2;
pub const CHAN_CTX_BRSTMODE_ENABLE: u32 = 3;

/// Channel types carried in [`RingContext::kind`] for channel contexts.
pub const CHAN_TYPE_OUTBOUND: u32 = 1;
pub const CHAN_TYPE_INBOUND: u32 = 2;
pub const CHAN_TYPE_INBOUND_COALESCED: u32 = 3;

/// Event ring type carried in [`RingContext::kind`] for event contexts.
pub const ER_TYPE_VALID: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq)]
pub struct RingContext {
    /// Channels: state and burst mode. Event rings: interrupt moderation.
    pub cfg: u32,
    /// Channel type or event ring type.
    pub kind: u32,
    /// Channels: event ring index. Event rings: MSI vector.
    pub index: u32,
    pub reserved: u32,
    /// Device address of the ring.
    pub rbase: u64,
    /// Ring length in bytes.
    pub rlen: u64,
    pub rp: u64,
    pub wp: u64,
}

const _: () = assert!(core::mem::size_of::<RingContext>() == 48);
const _: () = assert!(RingContext::RP_OFFSET == 32);
const _: () = assert!(RingContext::WP_OFFSET == 40);

impl RingContext {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub const CFG_OFFSET: usize = core::mem::offset_of!(Self, cfg);
    pub const RBASE_OFFSET: usize = core::mem::offset_of!(Self, rbase);
    pub const RP_OFFSET: usize = core::mem::offset_of!(Self, rp);
    pub const WP_OFFSET: usize = core::mem::offset_of!(Self, wp);

    /// A context for a ring of `rlen` bytes at `rbase` with both pointers at the base.
    pub fn new(cfg: u32, kind: u32, index: u32, rbase: u64, rlen: u64) -> Self {
        Self {
            cfg,
            kind,
            index,
            reserved: 0,
            rbase,
            rlen,
            rp: rbase,
            wp: rbase,
        }
    }

    /// Channel context configuration word.
    #[inline]
    pub fn chan_cfg(chstate: u32, brstmode: u32) -> u32 {
        (chstate & 0xFF) | ((brstmode & 0x3) << 8)
    }

    /// Channel state recorded in `cfg`.
    #[inline]
    pub fn chstate(&self) -> u32 {
        self.cfg & 0xFF
    }

    /// Update only the channel state byte in shared memory.
    pub fn write_chstate<M: MemOps>(mem: &M, ctxt: u64, chstate: u32) -> Result<(), M::Error> {
        let cfg: u32 = mem.read_val(ctxt + Self::CFG_OFFSET as u64)?;
        mem.write_val(
            ctxt + Self::CFG_OFFSET as u64,
            (cfg & !0xFF) | (chstate & 0xFF),
        )
    }
}
