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

//! Transfer Ring Element
//!
//! Every MHI ring (transfer, command, event) is an array of 16-byte elements:
//!
//! ```text
//!  0               8              12              16
//!  ┌───────────────┬───────────────┬───────────────┐
//!  │      ptr      │   dword[0]    │   dword[1]    │
//!  └───────────────┴───────────────┴───────────────┘
//! ```
//!
//! The meaning of each field depends on the element type carried in
//! `dword[1]` bits 23:16. Host-written element encoders live here; the typed
//! decoding of device-written events is in [`crate::event`].

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::MemOps;
use crate::event::EventError;

bitflags! {
    /// Control bits of a data TRE, stored in `dword[1]`.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct TreFlags: u32 {
        /// More TREs of the same transfer follow.
        const CHAIN = 1 << 0;
        /// Interrupt on end of block.
        const IEOB  = 1 << 8;
        /// Interrupt on end of transfer.
        const IEOT  = 1 << 9;
        /// Block event interrupt.
        const BEI   = 1 << 10;
    }
}

/// Element type of a host-written data TRE.
pub const TRE_TYPE_TRANSFER: u8 = 0x2;
/// Element type of a host-written RSC (coalescing) TRE.
pub const TRE_TYPE_COALESCING: u8 = 0x8;

/// Commands understood by the device's command ring.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandType {
    ResetChannel = 0x10,
    StopChannel = 0x11,
    StartChannel = 0x12,
    /// Side-band feature config: hands the device a buffer for its
    /// failure-reason string.
    SfrConfig = 0x73,
}

impl TryFrom<u8> for CommandType {
    type Error = EventError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x10 => Ok(Self::ResetChannel),
            0x11 => Ok(Self::StopChannel),
            0x12 => Ok(Self::StartChannel),
            0x73 => Ok(Self::SfrConfig),
            other => Err(EventError::UnknownType(other)),
        }
    }
}

/// Element types a device writes into event rings.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    StateChange = 0x20,
    CommandCompletion = 0x21,
    Transfer = 0x22,
    RscTransfer = 0x28,
    ExecEnv = 0x40,
    TimeSync = 0x48,
    BandwidthRequest = 0x50,
    /// Host-internal: a transfer event rewritten in place during channel
    /// reset so the dispatcher skips it.
    Stale = 0x74,
}

impl TryFrom<u8> for EventType {
    type Error = EventError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x20 => Ok(Self::StateChange),
            0x21 => Ok(Self::CommandCompletion),
            0x22 => Ok(Self::Transfer),
            0x28 => Ok(Self::RscTransfer),
            0x40 => Ok(Self::ExecEnv),
            0x48 => Ok(Self::TimeSync),
            0x50 => Ok(Self::BandwidthRequest),
            0x74 => Ok(Self::Stale),
            other => Err(EventError::UnknownType(other)),
        }
    }
}

/// Completion codes carried by transfer and command completion events.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum CompletionCode {
    Invalid = 0x0,
    Success = 0x1,
    /// End of transfer.
    Eot = 0x2,
    Overflow = 0x3,
    /// End of block.
    Eob = 0x4,
    /// Out of buffer: the device ran dry and switched to doorbell mode.
    Oob = 0x5,
    /// Doorbell mode: the device wants a doorbell for the next TRE.
    DbMode = 0x6,
    UndefinedErr = 0x10,
    BadTre = 0x11,
}

impl CompletionCode {
    /// Codes at or above [`CompletionCode::Oob`] change the channel's doorbell
    /// mode and must be processed with the channel locked for writing.
    #[inline]
    pub fn is_doorbell_mode_change(self) -> bool {
        self >= CompletionCode::Oob
    }
}

impl TryFrom<u8> for CompletionCode {
    type Error = EventError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x0 => Ok(Self::Invalid),
            0x1 => Ok(Self::Success),
            0x2 => Ok(Self::Eot),
            0x3 => Ok(Self::Overflow),
            0x4 => Ok(Self::Eob),
            0x5 => Ok(Self::Oob),
            0x6 => Ok(Self::DbMode),
            0x10 => Ok(Self::UndefinedErr),
            0x11 => Ok(Self::BadTre),
            other => Err(EventError::UnknownCode(other)),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub struct Tre {
    /// Buffer address, event source pointer, or packed payload.
    pub ptr: u64,
    /// Type-specific words; `dword[1]` bits 23:16 always hold the type.
    pub dword: [u32; 2],
}

const _: () = assert!(core::mem::size_of::<Tre>() == 16);
const _: () = assert!(Tre::PTR_OFFSET == 0);
const _: () = assert!(Tre::DWORD0_OFFSET == 8);
const _: () = assert!(Tre::DWORD1_OFFSET == 12);

impl Tre {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const ALIGN: usize = core::mem::align_of::<Self>();

    pub const PTR_OFFSET: usize = core::mem::offset_of!(Self, ptr);
    pub const DWORD0_OFFSET: usize = core::mem::offset_of!(Self, dword);
    pub const DWORD1_OFFSET: usize = core::mem::offset_of!(Self, dword) + 4;

    /// A normal data TRE pointing at `len` bytes at device address `addr`.
    pub fn transfer(addr: u64, len: usize, flags: TreFlags) -> Self {
        Self {
            ptr: addr,
            dword: [
                (len as u32) & 0xFFFF,
                ((TRE_TYPE_TRANSFER as u32) << 16) | flags.bits(),
            ],
        }
    }

    /// An RSC TRE. The length rides in the top 16 bits of `ptr`, and `dword[0]`
    /// carries the cookie the device echoes back in its completion.
    pub fn rsc(addr: u64, len: usize, cookie: u32) -> Self {
        Self {
            ptr: (((len as u64) & 0xFFFF) << 48) | (addr & 0xFFFF_FFFF_FFFF),
            dword: [cookie, (TRE_TYPE_COALESCING as u32) << 16],
        }
    }

    /// A channel command (start/stop/reset).
    pub fn command(cmd: CommandType, chan: u32) -> Self {
        Self {
            ptr: 0,
            dword: [0, ((chan & 0xFF) << 24) | ((cmd as u32) << 16)],
        }
    }

    /// The side-band feature config command handing the device a `len` byte buffer.
    pub fn sfr_config(addr: u64, len: usize) -> Self {
        Self {
            ptr: addr,
            dword: [
                (len as u32).saturating_sub(1),
                (CommandType::SfrConfig as u32) << 16,
            ],
        }
    }

    /// Element type, `dword[1]` bits 23:16.
    #[inline]
    pub fn element_type(&self) -> u8 {
        ((self.dword[1] >> 16) & 0xFF) as u8
    }

    /// Channel id, `dword[1]` bits 31:24.
    #[inline]
    pub fn chan(&self) -> u8 {
        ((self.dword[1] >> 24) & 0xFF) as u8
    }

    /// Completion code (or state/EE value), `dword[0]` bits 31:24.
    #[inline]
    pub fn code(&self) -> u8 {
        ((self.dword[0] >> 24) & 0xFF) as u8
    }

    /// Transfer length, `dword[0]` bits 15:0.
    #[inline]
    pub fn xfer_len(&self) -> u16 {
        (self.dword[0] & 0xFFFF) as u16
    }

    /// Data TRE control bits.
    #[inline]
    pub fn flags(&self) -> TreFlags {
        TreFlags::from_bits_truncate(self.dword[1])
    }

    /// Buffer address of an RSC TRE.
    #[inline]
    pub fn rsc_addr(&self) -> u64 {
        self.ptr & 0xFFFF_FFFF_FFFF
    }

    /// Buffer length of an RSC TRE.
    #[inline]
    pub fn rsc_len(&self) -> u16 {
        (self.ptr >> 48) as u16
    }

    /// Rewrite the element type in place, keeping the channel id.
    #[inline]
    pub fn set_element_type(&mut self, ty: u8) {
        self.dword[1] = (self.dword[1] & 0xFF00_FFFF) | ((ty as u32) << 16);
    }

    /// Read an element from shared memory.
    ///
    /// Elements carry no validity bit; callers must have observed the ring
    /// pointer that covers `addr` through [`MemOps::load_acquire`] first.
    pub fn read_from<M: MemOps>(mem: &M, addr: u64) -> Result<Self, M::Error> {
        mem.read_val(addr)
    }

    /// Write an element to shared memory. Becomes visible to the device once the
    /// ring's write pointer is published with release semantics.
    pub fn write_to<M: MemOps>(&self, mem: &M, addr: u64) -> Result<(), M::Error> {
        mem.write_val(addr, *self)
    }
}
