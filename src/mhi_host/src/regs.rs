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

use std::sync::Arc;

use mhi_common::RegisterIo;
use mhi_common::regs::INVALID_REG_VALUE;

use crate::config::DoorbellMode;
use crate::controller::ControllerOps;
use crate::error::{MhiError, Result};
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::offload::RegOffload;

/// Register and doorbell access for one controller.
pub(crate) struct Mmio {
    io: Arc<dyn RegisterIo>,
    ops: Arc<dyn ControllerOps>,
    offload: Option<RegOffload>,
}

impl Mmio {
    pub(crate) fn new(
        io: Arc<dyn RegisterIo>,
        ops: Arc<dyn ControllerOps>,
        offload: Option<RegOffload>,
    ) -> Self {
        Self { io, ops, offload }
    }

    /// Read a register. An all-ones value on a link the controller reports as
    /// down is an I/O error rather than data.
    pub(crate) fn read_reg(&self, offset: u64) -> Result<u32> {
        let val = self.io.read_u32(offset);
        if val == INVALID_REG_VALUE && !self.ops.link_status() {
            return Err(MhiError::IoError(format!(
                "register {offset:#x} read failed, link is down"
            )));
        }
        Ok(val)
    }

    pub(crate) fn read_reg_field(&self, offset: u64, mask: u32, shift: u32) -> Result<u32> {
        Ok((self.read_reg(offset)? & mask) >> shift)
    }

    pub(crate) fn write_reg(&self, offset: u64, val: u32) {
        self.io.write_u32(offset, val);
    }

    /// Read-modify-write of one register field.
    pub(crate) fn write_reg_field(&self, offset: u64, mask: u32, shift: u32, val: u32) -> Result<()> {
        let cur = self.read_reg(offset)?;
        self.write_reg(offset, (cur & !mask) | ((val << shift) & mask));
        Ok(())
    }

    /// Write a 64-bit doorbell as two halves, high word first. `ring` names the
    /// kind of ring for accounting.
    pub(crate) fn write_db(&self, ring: &'static str, addr: u64, val: u64) {
        CounterMetric::doorbell(ring).emit();
        let hi = (val >> 32) as u32;
        let lo = val as u32;

        if let Some(offload) = &self.offload {
            if offload.enqueue(addr + 4, hi).is_ok() && offload.enqueue(addr, lo).is_ok() {
                offload.kick();
                return;
            }
            // A half-queued doorbell must still reach the device in order.
            log::warn!("register offload queue full, writing doorbell {addr:#x} inline");
            offload.flush();
        }
        self.io.write_u32(addr + 4, hi);
        self.io.write_u32(addr, lo);
    }

    pub(crate) fn offload(&self) -> Option<&RegOffload> {
        self.offload.as_ref()
    }
}

/// Per-channel doorbell policy state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DbCfg {
    pub(crate) brstmode: DoorbellMode,
    /// In burst mode: the device asked for a doorbell and the next one must be rung.
    pub(crate) db_mode: bool,
    /// Return to doorbell mode on every M0 entry.
    pub(crate) reset_req: bool,
    /// Last value rung.
    pub(crate) db_val: u64,
}

impl DbCfg {
    pub(crate) fn new(brstmode: DoorbellMode, reset_req: bool) -> Self {
        Self {
            brstmode,
            db_mode: true,
            reset_req,
            db_val: 0,
        }
    }

    /// Ring `val` at `addr` if the policy allows it. Returns whether a write happened.
    pub(crate) fn ring(&mut self, mmio: &Mmio, addr: u64, val: u64) -> bool {
        match self.brstmode {
            DoorbellMode::Burst => {
                if !self.db_mode {
                    return false;
                }
                self.db_val = val;
                mmio.write_db("channel", addr, val);
                self.db_mode = false;
                true
            }
            DoorbellMode::Disable => {
                self.db_val = val;
                mmio.write_db("channel", addr, val);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Default)]
    struct FakeRegs {
        regs: Mutex<HashMap<u64, u32>>,
        writes: Mutex<Vec<(u64, u32)>>,
    }

    impl RegisterIo for FakeRegs {
        fn read_u32(&self, addr: u64) -> u32 {
            self.regs.lock().unwrap().get(&addr).copied().unwrap_or(0)
        }

        fn write_u32(&self, addr: u64, val: u32) {
            self.regs.lock().unwrap().insert(addr, val);
            self.writes.lock().unwrap().push((addr, val));
        }
    }

    struct Link(AtomicBool);

    impl ControllerOps for Link {
        fn link_status(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn mmio() -> (Arc<FakeRegs>, Arc<Link>, Mmio) {
        let regs = Arc::new(FakeRegs::default());
        let link = Arc::new(Link(AtomicBool::new(true)));
        let mmio = Mmio::new(regs.clone(), link.clone(), None);
        (regs, link, mmio)
    }

    #[test]
    fn test_doorbell_high_word_first() {
        let (regs, _, mmio) = mmio();
        mmio.write_db("channel", 0x1000, 0x1234_5678_9abc_def0);
        assert_eq!(
            *regs.writes.lock().unwrap(),
            vec![(0x1004, 0x1234_5678), (0x1000, 0x9abc_def0)]
        );
    }

    #[test]
    fn test_invalid_read_on_dead_link() {
        let (regs, link, mmio) = mmio();
        regs.write_u32(0x48, INVALID_REG_VALUE);
        // all ones on a live link is just a value
        assert_eq!(mmio.read_reg(0x48).unwrap(), INVALID_REG_VALUE);

        link.0.store(false, Ordering::SeqCst);
        assert!(matches!(mmio.read_reg(0x48), Err(MhiError::IoError(_))));
    }

    #[test]
    fn test_field_helpers() {
        let (regs, _, mmio) = mmio();
        regs.write_u32(0x38, 0xFFFF_00FF);
        mmio.write_reg_field(0x38, 0xFF00, 8, 0x5).unwrap();
        assert_eq!(regs.read_u32(0x38), 0xFFFF_05FF);
        assert_eq!(mmio.read_reg_field(0x38, 0xFF00, 8).unwrap(), 0x5);
    }

    #[test]
    fn test_burst_mode_rings_once_per_request() {
        let (regs, _, mmio) = mmio();
        let mut db = DbCfg::new(DoorbellMode::Burst, false);

        assert!(db.ring(&mmio, 0x1000, 0x10));
        assert!(!db.ring(&mmio, 0x1000, 0x20));
        assert_eq!(db.db_val, 0x10);

        // the device asks again
        db.db_mode = true;
        assert!(db.ring(&mmio, 0x1000, 0x30));
        assert_eq!(regs.writes.lock().unwrap().len(), 4);

        let mut always = DbCfg::new(DoorbellMode::Disable, false);
        assert!(always.ring(&mmio, 0x1008, 1));
        assert!(always.ring(&mmio, 0x1008, 2));
    }
}
