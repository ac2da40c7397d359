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

// MMIO register map, offsets relative to the MHI register base.

pub const MHIREGLEN: u64 = 0x00;
pub const MHIVER: u64 = 0x08;
pub const MHICFG: u64 = 0x10;
/// Offset of the channel doorbell array.
pub const CHDBOFF: u64 = 0x18;
/// Offset of the event ring doorbell array.
pub const ERDBOFF: u64 = 0x20;
/// Offset of the BHI register block.
pub const BHIOFF: u64 = 0x28;
pub const MHICTRL: u64 = 0x38;
pub const MHISTATUS: u64 = 0x48;
pub const CCABAP_LOWER: u64 = 0x58;
pub const CCABAP_HIGHER: u64 = 0x5C;
pub const ECABAP_LOWER: u64 = 0x60;
pub const ECABAP_HIGHER: u64 = 0x64;
pub const CRCBAP_LOWER: u64 = 0x68;
pub const CRCBAP_HIGHER: u64 = 0x6C;
/// Command ring doorbell.
pub const CRDB_LOWER: u64 = 0x70;
pub const CRDB_HIGHER: u64 = 0x74;

pub const MHICTRL_MHISTATE_MASK: u32 = 0xFF00;
pub const MHICTRL_MHISTATE_SHIFT: u32 = 8;
pub const MHICTRL_RESET_MASK: u32 = 0x2;
pub const MHICTRL_RESET_SHIFT: u32 = 1;

pub const MHISTATUS_MHISTATE_MASK: u32 = 0xFF00;
pub const MHISTATUS_MHISTATE_SHIFT: u32 = 8;
pub const MHISTATUS_SYSERR_MASK: u32 = 0x4;
pub const MHISTATUS_SYSERR_SHIFT: u32 = 2;
pub const MHISTATUS_READY_MASK: u32 = 0x1;
pub const MHISTATUS_READY_SHIFT: u32 = 0;

/// Execution environment, relative to the BHI block.
pub const BHI_EXECENV: u64 = 0x28;

/// Doorbells are 64-bit registers laid out back to back.
pub const DOORBELL_STRIDE: u64 = 8;
/// Index of the device wake doorbell inside the channel doorbell array.
pub const DEV_WAKE_DB: u64 = 127;

/// Value read back from a register when the link is down.
pub const INVALID_REG_VALUE: u32 = 0xFFFF_FFFF;
