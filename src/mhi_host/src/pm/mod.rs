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

//! Joint host/device power management state.
//!
//! [`PmState`] is the host's view of the link. Every ring and register access
//! checks it, and only the transitions listed in [`PmState::allowed`] are
//! taken; [`PmInfo::tryset`] leaves the state untouched for anything else and
//! reports what the state is now, so callers compare against their target.

use std::fmt;

use bitflags::bitflags;
use mhi_common::{ExecEnv, MhiState};

/// Power-up, suspend/resume, shutdown and vote handling.
pub(crate) mod power;
/// Reactions to device state changes and the deferred transition worker.
pub(crate) mod transitions;

bitflags! {
    /// Host power management state. Exactly one bit is set at a time; the
    /// bit order matters since every state from `FW_DL_ERR` upward is an
    /// error state.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PmState: u32 {
        const DISABLE = 1 << 0;
        const POR = 1 << 1;
        const M0 = 1 << 2;
        const M2 = 1 << 3;
        const M3_ENTER = 1 << 4;
        const M3 = 1 << 5;
        const M3_EXIT = 1 << 6;
        const FW_DL_ERR = 1 << 7;
        const SYS_ERR_DETECT = 1 << 8;
        const SYS_ERR_PROCESS = 1 << 9;
        const SYS_ERR_FAIL = 1 << 10;
        const SHUTDOWN_PROCESS = 1 << 11;
        const SHUTDOWN_NO_ACCESS = 1 << 12;
        const LD_ERR_FATAL_DETECT = 1 << 13;
    }
}

impl PmState {
    const REG_ACCESS_VALID: PmState = PmState::POR
        .union(PmState::M0)
        .union(PmState::M2)
        .union(PmState::M3_ENTER)
        .union(PmState::M3_EXIT)
        .union(PmState::SYS_ERR_DETECT)
        .union(PmState::SYS_ERR_PROCESS)
        .union(PmState::SHUTDOWN_PROCESS)
        .union(PmState::FW_DL_ERR);

    const DB_ACCESS: PmState = PmState::M0.union(PmState::M2);

    const IN_SUSPEND: PmState = PmState::M3_ENTER.union(PmState::M3);

    /// States reachable from `self`.
    pub fn allowed(self) -> PmState {
        // common exits of every error-free and error state
        let fatal = PmState::SYS_ERR_DETECT
            .union(PmState::SHUTDOWN_PROCESS)
            .union(PmState::LD_ERR_FATAL_DETECT);
        let next = match self {
            PmState::DISABLE => return PmState::POR,
            PmState::POR => PmState::POR | PmState::DISABLE | PmState::M0 | PmState::FW_DL_ERR | fatal,
            PmState::M0 => PmState::M0 | PmState::M2 | PmState::M3_ENTER | fatal,
            PmState::M2 => PmState::M0 | fatal,
            PmState::M3_ENTER => PmState::M3 | fatal,
            PmState::M3 => PmState::M3_EXIT | fatal,
            PmState::M3_EXIT => PmState::M0 | fatal,
            PmState::FW_DL_ERR => PmState::FW_DL_ERR | fatal,
            PmState::SYS_ERR_DETECT => {
                PmState::SYS_ERR_PROCESS | PmState::SHUTDOWN_PROCESS | PmState::LD_ERR_FATAL_DETECT
            }
            PmState::SYS_ERR_PROCESS => {
                PmState::POR
                    | PmState::SYS_ERR_FAIL
                    | PmState::SHUTDOWN_PROCESS
                    | PmState::LD_ERR_FATAL_DETECT
            }
            PmState::SYS_ERR_FAIL => PmState::SHUTDOWN_PROCESS | PmState::LD_ERR_FATAL_DETECT,
            PmState::SHUTDOWN_PROCESS => PmState::DISABLE | PmState::LD_ERR_FATAL_DETECT,
            PmState::SHUTDOWN_NO_ACCESS => return PmState::DISABLE,
            PmState::LD_ERR_FATAL_DETECT => {
                PmState::LD_ERR_FATAL_DETECT
                    | PmState::SHUTDOWN_PROCESS
                    | PmState::SHUTDOWN_NO_ACCESS
                    | PmState::DISABLE
            }
            _ => PmState::empty(),
        };
        next | PmState::SHUTDOWN_NO_ACCESS
    }

    /// Registers may be read and written.
    pub fn reg_access_valid(self) -> bool {
        self.intersects(Self::REG_ACCESS_VALID)
    }

    pub fn in_error(self) -> bool {
        self.bits() >= PmState::FW_DL_ERR.bits()
    }

    /// Events are not processed at all.
    pub fn event_access_invalid(self) -> bool {
        self == PmState::DISABLE || self.in_error()
    }

    pub fn in_suspend(self) -> bool {
        self.intersects(Self::IN_SUSPEND)
    }

    fn name(self) -> &'static str {
        match self {
            PmState::DISABLE => "DISABLE",
            PmState::POR => "POR",
            PmState::M0 => "M0",
            PmState::M2 => "M2",
            PmState::M3_ENTER => "M3->ENTER",
            PmState::M3 => "M3",
            PmState::M3_EXIT => "M3->EXIT",
            PmState::FW_DL_ERR => "FW DL Error",
            PmState::SYS_ERR_DETECT => "SYS_ERR Detect",
            PmState::SYS_ERR_PROCESS => "SYS_ERR Process",
            PmState::SYS_ERR_FAIL => "SYS_ERR Fail",
            PmState::SHUTDOWN_PROCESS => "SHUTDOWN Process",
            PmState::SHUTDOWN_NO_ACCESS => "SHUTDOWN No Access",
            PmState::LD_ERR_FATAL_DETECT => "LD or Error Fatal Detect",
            _ => "Invalid",
        }
    }
}

impl fmt::Display for PmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Classes of votes keeping the device out of low power.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Votes: u32 {
        /// Assert device wake.
        const DEVICE = 1 << 0;
        /// Keep the bus out of runtime suspend.
        const BUS = 1 << 1;
    }
}

/// Everything guarded by the controller's PM lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PmInfo {
    pub(crate) state: PmState,
    /// Last MHI state the device confirmed.
    pub(crate) dev_state: MhiState,
    pub(crate) ee: ExecEnv,
}

impl PmInfo {
    pub(crate) fn new() -> Self {
        Self {
            state: PmState::DISABLE,
            dev_state: MhiState::Reset,
            ee: ExecEnv::NotSupported,
        }
    }

    /// Move to `target` if the current state allows it. Returns the state after
    /// the attempt.
    pub(crate) fn tryset(&mut self, target: PmState) -> PmState {
        if target.bits().count_ones() == 1 && self.state.allowed().contains(target) {
            log::trace!("PM state {} -> {}", self.state, target);
            self.state = target;
        } else {
            log::debug!("PM state {} -> {} not allowed", self.state, target);
        }
        self.state
    }

    pub(crate) fn reg_access_valid(&self) -> bool {
        self.state.reg_access_valid()
    }

    /// Doorbells may be rung: M0 or M2, and the device is not collecting a dump.
    pub(crate) fn db_access_valid(&self) -> bool {
        self.state.intersects(PmState::DB_ACCESS) && self.ee != ExecEnv::Rddm
    }

    /// Client ring access is refused outright.
    pub(crate) fn access_refused(&self) -> bool {
        self.state.in_error() || self.ee == ExecEnv::Rddm
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::*;

    const ALL: [PmState; 14] = [
        PmState::DISABLE,
        PmState::POR,
        PmState::M0,
        PmState::M2,
        PmState::M3_ENTER,
        PmState::M3,
        PmState::M3_EXIT,
        PmState::FW_DL_ERR,
        PmState::SYS_ERR_DETECT,
        PmState::SYS_ERR_PROCESS,
        PmState::SYS_ERR_FAIL,
        PmState::SHUTDOWN_PROCESS,
        PmState::SHUTDOWN_NO_ACCESS,
        PmState::LD_ERR_FATAL_DETECT,
    ];

    #[test]
    fn test_suspend_resume_path() {
        let mut pm = PmInfo::new();
        for target in [
            PmState::POR,
            PmState::M0,
            PmState::M3_ENTER,
            PmState::M3,
            PmState::M3_EXIT,
            PmState::M0,
        ] {
            assert_eq!(pm.tryset(target), target);
        }
    }

    #[test]
    fn test_illegal_transition_keeps_state() {
        let mut pm = PmInfo::new();
        assert_eq!(pm.tryset(PmState::M0), PmState::DISABLE);
        pm.tryset(PmState::POR);
        pm.tryset(PmState::M0);
        assert_eq!(pm.tryset(PmState::M3), PmState::M0);

        pm.tryset(PmState::SYS_ERR_DETECT);
        // a second detection is refused, recovery is already underway
        assert_eq!(pm.tryset(PmState::SYS_ERR_DETECT), PmState::SYS_ERR_DETECT);
        assert_eq!(pm.tryset(PmState::M0), PmState::SYS_ERR_DETECT);
        // multi-bit targets are never states
        assert_eq!(
            pm.tryset(PmState::SYS_ERR_PROCESS | PmState::POR),
            PmState::SYS_ERR_DETECT
        );
    }

    #[test]
    fn test_access_masks() {
        assert!(PmState::M0.reg_access_valid());
        assert!(!PmState::M3.reg_access_valid());
        assert!(PmState::SYS_ERR_DETECT.in_error());
        assert!(!PmState::M3_EXIT.in_error());
        assert!(PmState::DISABLE.event_access_invalid());
        assert!(!PmState::M3.event_access_invalid());

        let mut pm = PmInfo::new();
        pm.state = PmState::M2;
        assert!(pm.db_access_valid());
        pm.ee = ExecEnv::Rddm;
        assert!(!pm.db_access_valid());
        assert!(pm.access_refused());
    }

    #[derive(Clone, Debug)]
    struct Walk(Vec<usize>);

    impl Arbitrary for Walk {
        fn arbitrary(g: &mut Gen) -> Self {
            let len = usize::arbitrary(g) % 64;
            Walk((0..len).map(|_| usize::arbitrary(g) % ALL.len()).collect())
        }
    }

    #[test]
    fn prop_state_is_always_single_and_reachable() {
        fn walk(w: Walk) -> bool {
            let mut pm = PmInfo::new();
            w.0.iter().all(|&i| {
                let before = pm.state;
                let after = pm.tryset(ALL[i]);
                after.bits().count_ones() == 1
                    && (after == before || before.allowed().contains(after))
            })
        }
        let tests = if cfg!(miri) { 10 } else { 500 };
        QuickCheck::new()
            .tests(tests)
            .quickcheck(walk as fn(Walk) -> bool);
    }
}
