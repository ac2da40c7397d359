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

use core::fmt;

use crate::event::EventError;

/// MHI state as reported by the device in MHISTATUS and state change events.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum MhiState {
    #[default]
    Reset = 0x0,
    Ready = 0x1,
    M0 = 0x2,
    M1 = 0x3,
    M2 = 0x4,
    M3 = 0x5,
    M3Fast = 0x6,
    Bhi = 0x7,
    SysErr = 0xFF,
}

impl TryFrom<u8> for MhiState {
    type Error = EventError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x0 => Ok(Self::Reset),
            0x1 => Ok(Self::Ready),
            0x2 => Ok(Self::M0),
            0x3 => Ok(Self::M1),
            0x4 => Ok(Self::M2),
            0x5 => Ok(Self::M3),
            0x6 => Ok(Self::M3Fast),
            0x7 => Ok(Self::Bhi),
            0xFF => Ok(Self::SysErr),
            other => Err(EventError::UnknownState(other)),
        }
    }
}

impl fmt::Display for MhiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MhiState::Reset => "RESET",
            MhiState::Ready => "READY",
            MhiState::M0 => "M0",
            MhiState::M1 => "M1",
            MhiState::M2 => "M2",
            MhiState::M3 => "M3",
            MhiState::M3Fast => "M3_FAST",
            MhiState::Bhi => "BHI",
            MhiState::SysErr => "SYS_ERR",
        };
        f.write_str(s)
    }
}

/// Execution environment of the device, in host numbering.
///
/// Devices may number their environments differently; the host keeps a table
/// mapping host indices to device values and translates with
/// [`ExecEnv::from_device`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum ExecEnv {
    /// Primary boot loader.
    Pbl,
    /// Secondary boot loader.
    Sbl,
    /// Mission mode.
    Amss,
    /// RAM dump download mode.
    Rddm,
    /// WLAN firmware.
    Wfw,
    /// Pass-through.
    Pthru,
    /// Emergency download.
    Edl,
    /// Flash programmer.
    Fp,
    Uefi,
    DisableTransition,
    #[default]
    NotSupported,
}

impl ExecEnv {
    /// Host indices `0..=8` map onto the identical device values unless the
    /// platform says otherwise.
    pub const DEFAULT_TABLE: [u8; 9] = [0, 1, 2, 3, 4, 5, 6, 7, 8];

    const BY_INDEX: [ExecEnv; 9] = [
        ExecEnv::Pbl,
        ExecEnv::Sbl,
        ExecEnv::Amss,
        ExecEnv::Rddm,
        ExecEnv::Wfw,
        ExecEnv::Pthru,
        ExecEnv::Edl,
        ExecEnv::Fp,
        ExecEnv::Uefi,
    ];

    /// Translate a device-reported EE value through `table`. Unknown values map
    /// to [`ExecEnv::NotSupported`].
    pub fn from_device(raw: u8, table: &[u8]) -> Self {
        table
            .iter()
            .zip(Self::BY_INDEX.iter())
            .find(|(dev, _)| **dev == raw)
            .map(|(_, ee)| *ee)
            .unwrap_or(ExecEnv::NotSupported)
    }

    /// The device value of this environment under `table`, if it has one.
    pub fn to_device(self, table: &[u8]) -> Option<u8> {
        Self::BY_INDEX
            .iter()
            .position(|ee| *ee == self)
            .and_then(|idx| table.get(idx).copied())
    }

    /// Mission mode environments run the full channel set.
    #[inline]
    pub fn is_mission_mode(self) -> bool {
        matches!(self, ExecEnv::Amss | ExecEnv::Wfw)
    }

    /// Boot ROM style environments.
    #[inline]
    pub fn is_pbl(self) -> bool {
        matches!(self, ExecEnv::Pbl | ExecEnv::Pthru | ExecEnv::Edl)
    }

    /// Bit for this environment in a channel's EE mask.
    #[inline]
    pub fn mask_bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for ExecEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecEnv::Pbl => "PBL",
            ExecEnv::Sbl => "SBL",
            ExecEnv::Amss => "AMSS",
            ExecEnv::Rddm => "RDDM",
            ExecEnv::Wfw => "WFW",
            ExecEnv::Pthru => "PASS THRU",
            ExecEnv::Edl => "EDL",
            ExecEnv::Fp => "FLASH PROGRAMMER",
            ExecEnv::Uefi => "UEFI",
            ExecEnv::DisableTransition => "RESET",
            ExecEnv::NotSupported => "NOT SUPPORTED",
        };
        f.write_str(s)
    }
}
