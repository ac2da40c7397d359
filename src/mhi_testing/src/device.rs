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

//! A software MHI device.
//!
//! [`SimDevice`] implements [`RegisterIo`] and services doorbells inline: a
//! command ring doorbell consumes every new command and posts its completion,
//! an uplink channel doorbell consumes the new transfer elements and posts
//! transfer events. Downlink data is injected with [`SimDevice::send_dl`].
//!
//! Interrupts are delivered through the handler installed with
//! [`SimDevice::set_irq_handler`], always after the device's own lock is
//! released so the handler may call back into the register file. Vector 0 is
//! the BHI/state interrupt; event rings use the vector programmed in their
//! context.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail, ensure};
use mhi_common::context::{
    CHAN_CTX_DISABLED, CHAN_CTX_RUNNING, CHAN_CTX_STOP, CHAN_TYPE_INBOUND_COALESCED,
    CHAN_TYPE_OUTBOUND,
};
use mhi_common::regs::*;
use mhi_common::{
    CommandType, CompletionCode, Event, ExecEnv, MemOps, MhiState, RegisterIo, RingContext, Tre,
    TreFlags,
};

use crate::mem::DeviceMemory;

/// Register offset of the channel doorbell array.
pub const CHDB_BASE: u64 = 0x1000;
/// Register offset of the event ring doorbell array.
pub const ERDB_BASE: u64 = 0x2000;
/// Register offset of the BHI block.
pub const BHI_BASE: u64 = 0x3000;
/// Timesync doorbell.
pub const TSYNC_DB: u64 = 0x4000;
/// Bandwidth scale result register.
pub const BW_SCALE_DB: u64 = 0x4100;
/// Vector of the BHI/state interrupt.
pub const INTVEC: u32 = 0;

const MAX_CHANNELS: u64 = 128;

type IrqHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// What the device saw the host do, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    Command { cmd: CommandType, chan: u32 },
    ChannelDoorbell { chan: u32, wp: u64 },
    EventDoorbell { er: u32, wp: u64 },
    CommandDoorbell { wp: u64 },
    DevWake(bool),
    StateRequest(MhiState),
    Reset,
    TimeSync(u32),
    BwScaleResult(u32),
}

#[derive(Debug, Default)]
struct SimChan {
    /// Device-local read position, device address.
    rp: Option<u64>,
    hold: bool,
    pending: VecDeque<(u64, Tre)>,
    partial: Vec<u8>,
    received: VecDeque<Vec<u8>>,
    doorbells: usize,
}

#[derive(Debug)]
struct Inner {
    regs: HashMap<u64, u32>,
    state: MhiState,
    ee: u8,
    syserr: bool,
    ready: bool,
    link_down: bool,
    dev_wake: bool,
    chans: HashMap<u32, SimChan>,
    cmd_rp: Option<u64>,
    script: VecDeque<CompletionCode>,
    drop_commands: bool,
    ctrl_er: u32,
    tsync_er: Option<u32>,
    remote_time: u64,
    log: Vec<SimEvent>,
}

pub struct SimDevice {
    mem: Arc<DeviceMemory>,
    inner: Mutex<Inner>,
    irq: Mutex<Option<IrqHandler>>,
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDevice")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

fn ring_next(ctxt: &RingContext, addr: u64) -> u64 {
    let next = addr + Tre::SIZE as u64;
    if next >= ctxt.rbase + ctxt.rlen {
        ctxt.rbase
    } else {
        next
    }
}

impl Inner {
    fn reg64(&self, lower: u64) -> u64 {
        let lo = self.regs.get(&lower).copied().unwrap_or(0) as u64;
        let hi = self.regs.get(&(lower + 4)).copied().unwrap_or(0) as u64;
        (hi << 32) | lo
    }

    fn chan_ctxt(&self, chan: u32) -> u64 {
        self.reg64(CCABAP_LOWER) + chan as u64 * RingContext::SIZE as u64
    }

    fn er_ctxt(&self, er: u32) -> u64 {
        self.reg64(ECABAP_LOWER) + er as u64 * RingContext::SIZE as u64
    }

    fn status(&self) -> u32 {
        ((self.state as u32) << MHISTATUS_MHISTATE_SHIFT)
            | ((self.syserr as u32) << MHISTATUS_SYSERR_SHIFT)
            | ((self.ready as u32) << MHISTATUS_READY_SHIFT)
    }

    fn post(
        &mut self,
        mem: &DeviceMemory,
        er: u32,
        event: &Event,
        irqs: &mut Vec<u32>,
    ) -> Result<()> {
        let ctxt_addr = self.er_ctxt(er);
        let ctxt: RingContext = mem.read_val(ctxt_addr)?;
        ensure!(ctxt.rlen != 0, "event ring {er} is not programmed");

        let rp = mem.load_acquire(ctxt_addr + RingContext::RP_OFFSET as u64)?;
        let wp = mem.load_acquire(ctxt_addr + RingContext::WP_OFFSET as u64)?;
        ensure!(rp != wp, "event ring {er} is full, dropping {event:?}");

        event.encode().write_to(mem, rp)?;
        mem.store_release(
            ctxt_addr + RingContext::RP_OFFSET as u64,
            ring_next(&ctxt, rp),
        )?;
        if !irqs.contains(&ctxt.index) {
            irqs.push(ctxt.index);
        }
        Ok(())
    }

    fn mhictrl(&mut self, mem: &DeviceMemory, val: u32, irqs: &mut Vec<u32>) -> Result<()> {
        if val & MHICTRL_RESET_MASK != 0 {
            self.log.push(SimEvent::Reset);
            self.syserr = false;
            self.state = MhiState::Ready;
            self.ready = true;
            self.cmd_rp = None;
            self.chans.clear();
            self.regs.insert(MHICTRL, val & !MHICTRL_RESET_MASK);
            return Ok(());
        }

        let raw = ((val & MHICTRL_MHISTATE_MASK) >> MHICTRL_MHISTATE_SHIFT) as u8;
        let requested = MhiState::try_from(raw)?;
        self.log.push(SimEvent::StateRequest(requested));
        match requested {
            MhiState::M0 | MhiState::M3 => {
                self.state = requested;
                let er = self.ctrl_er;
                self.post(mem, er, &Event::StateChange(requested), irqs)
            }
            MhiState::M2 => {
                self.state = requested;
                Ok(())
            }
            other => bail!("unexpected state request {other}"),
        }
    }

    fn command_doorbell(&mut self, mem: &DeviceMemory, irqs: &mut Vec<u32>) -> Result<()> {
        let ctxt_addr = self.reg64(CRCBAP_LOWER);
        let ctxt: RingContext = mem.read_val(ctxt_addr)?;
        let wp = mem.load_acquire(ctxt_addr + RingContext::WP_OFFSET as u64)?;
        self.log.push(SimEvent::CommandDoorbell { wp });

        let mut rp = self.cmd_rp.unwrap_or(ctxt.rp);
        while rp != wp {
            let tre = Tre::read_from(mem, rp)?;
            let cmd_ptr = rp;
            rp = ring_next(&ctxt, rp);
            self.cmd_rp = Some(rp);
            mem.store_release(ctxt_addr + RingContext::RP_OFFSET as u64, rp)?;

            let cmd = CommandType::try_from(tre.element_type())?;
            let chan = tre.chan() as u32;
            self.log.push(SimEvent::Command { cmd, chan });
            if self.drop_commands {
                continue;
            }

            let code = self.script.pop_front().unwrap_or(CompletionCode::Success);
            if code == CompletionCode::Success {
                self.apply_command(mem, cmd, chan, irqs)?;
            }
            let er = self.ctrl_er;
            self.post(mem, er, &Event::CommandCompletion { cmd_ptr, code }, irqs)?;
        }
        Ok(())
    }

    fn apply_command(
        &mut self,
        mem: &DeviceMemory,
        cmd: CommandType,
        chan: u32,
        irqs: &mut Vec<u32>,
    ) -> Result<()> {
        let ctxt_addr = self.chan_ctxt(chan);
        match cmd {
            CommandType::StartChannel => {
                let ctxt: RingContext = mem.read_val(ctxt_addr)?;
                RingContext::write_chstate(mem, ctxt_addr, CHAN_CTX_RUNNING)?;
                let sc = self.chans.entry(chan).or_default();
                if sc.rp.is_none() {
                    sc.rp = Some(ctxt.rp);
                }
                if ctxt.kind == CHAN_TYPE_OUTBOUND {
                    self.consume_ul(mem, chan, irqs)?;
                }
            }
            CommandType::StopChannel => {
                RingContext::write_chstate(mem, ctxt_addr, CHAN_CTX_STOP)?;
            }
            CommandType::ResetChannel => {
                RingContext::write_chstate(mem, ctxt_addr, CHAN_CTX_DISABLED)?;
                self.chans.remove(&chan);
            }
            CommandType::SfrConfig => {
                // nothing has failed yet, leave an empty reason behind
            }
        }
        Ok(())
    }

    /// Pick up every uplink element between the device read position and the
    /// published write pointer.
    fn consume_ul(&mut self, mem: &DeviceMemory, chan: u32, irqs: &mut Vec<u32>) -> Result<()> {
        let ctxt_addr = self.chan_ctxt(chan);
        let ctxt: RingContext = mem.read_val(ctxt_addr)?;
        if ctxt.chstate() != CHAN_CTX_RUNNING {
            return Ok(());
        }
        let wp = mem.load_acquire(ctxt_addr + RingContext::WP_OFFSET as u64)?;

        let sc = self.chans.entry(chan).or_default();
        let mut rp = sc.rp.unwrap_or(ctxt.rp);
        while rp != wp {
            sc.pending.push_back((rp, Tre::read_from(mem, rp)?));
            rp = ring_next(&ctxt, rp);
        }
        sc.rp = Some(rp);

        if !sc.hold {
            let n = sc.pending.len();
            self.complete_ul(mem, chan, n, irqs)?;
        }
        Ok(())
    }

    fn complete_ul(
        &mut self,
        mem: &DeviceMemory,
        chan: u32,
        n: usize,
        irqs: &mut Vec<u32>,
    ) -> Result<usize> {
        let ctxt_addr = self.chan_ctxt(chan);
        let ctxt: RingContext = mem.read_val(ctxt_addr)?;
        let mut done = 0;

        while done < n {
            let sc = self.chans.entry(chan).or_default();
            let Some((addr, tre)) = sc.pending.pop_front() else {
                break;
            };
            let mut data = vec![0u8; tre.xfer_len() as usize];
            mem.read(tre.ptr, &mut data)?;
            sc.partial.extend_from_slice(&data);
            if !tre.flags().contains(TreFlags::CHAIN) {
                let msg = std::mem::take(&mut sc.partial);
                sc.received.push_back(msg);
            }
            mem.store_release(
                ctxt_addr + RingContext::RP_OFFSET as u64,
                ring_next(&ctxt, addr),
            )?;

            let code = if tre.flags().contains(TreFlags::IEOT) {
                Some(CompletionCode::Eot)
            } else if tre.flags().contains(TreFlags::IEOB) {
                Some(CompletionCode::Eob)
            } else {
                None
            };
            if let Some(code) = code {
                let event = Event::Transfer {
                    chan: chan as u8,
                    ptr: addr,
                    len: tre.xfer_len(),
                    code,
                };
                self.post(mem, ctxt.index, &event, irqs)?;
            }
            done += 1;
        }
        Ok(done)
    }

    fn send_dl(
        &mut self,
        mem: &DeviceMemory,
        chan: u32,
        data: &[u8],
        irqs: &mut Vec<u32>,
    ) -> Result<()> {
        let ctxt_addr = self.chan_ctxt(chan);
        let ctxt: RingContext = mem.read_val(ctxt_addr)?;
        ensure!(
            ctxt.chstate() == CHAN_CTX_RUNNING,
            "channel {chan} is not running"
        );
        let wp = mem.load_acquire(ctxt_addr + RingContext::WP_OFFSET as u64)?;

        let rp = {
            let sc = self.chans.entry(chan).or_default();
            let rp = sc.rp.unwrap_or(ctxt.rp);
            ensure!(rp != wp, "channel {chan} has no receive buffer queued");
            sc.rp = Some(ring_next(&ctxt, rp));
            rp
        };
        let tre = Tre::read_from(mem, rp)?;
        mem.store_release(
            ctxt_addr + RingContext::RP_OFFSET as u64,
            ring_next(&ctxt, rp),
        )?;

        let event = if ctxt.kind == CHAN_TYPE_INBOUND_COALESCED {
            let cap = tre.rsc_len() as usize;
            let n = data.len().min(cap);
            mem.write(tre.rsc_addr(), &data[..n])?;
            Event::RscTransfer {
                chan: chan as u8,
                cookie: tre.dword[0],
                len: n as u16,
                code: if data.len() > cap {
                    CompletionCode::Overflow
                } else {
                    CompletionCode::Eot
                },
            }
        } else {
            let cap = tre.xfer_len() as usize;
            let n = data.len().min(cap);
            mem.write(tre.ptr, &data[..n])?;
            Event::Transfer {
                chan: chan as u8,
                ptr: rp,
                len: n as u16,
                code: if data.len() > cap {
                    CompletionCode::Overflow
                } else {
                    CompletionCode::Eot
                },
            }
        };
        self.post(mem, ctxt.index, &event, irqs)
    }

    fn dl_available(&self, mem: &DeviceMemory, chan: u32) -> Result<usize> {
        let ctxt_addr = self.chan_ctxt(chan);
        let ctxt: RingContext = mem.read_val(ctxt_addr)?;
        let wp = mem.load_acquire(ctxt_addr + RingContext::WP_OFFSET as u64)?;
        let mut rp = self
            .chans
            .get(&chan)
            .and_then(|sc| sc.rp)
            .unwrap_or(ctxt.rp);
        let mut n = 0;
        while rp != wp {
            n += 1;
            rp = ring_next(&ctxt, rp);
        }
        Ok(n)
    }
}

impl SimDevice {
    /// A device in mission mode, waiting for the host to reset it.
    pub fn new(mem: Arc<DeviceMemory>) -> Self {
        Self {
            mem,
            inner: Mutex::new(Inner {
                regs: HashMap::new(),
                state: MhiState::Reset,
                ee: 2,
                syserr: false,
                ready: false,
                link_down: false,
                dev_wake: false,
                chans: HashMap::new(),
                cmd_rp: None,
                script: VecDeque::new(),
                drop_commands: false,
                ctrl_er: 0,
                tsync_er: None,
                remote_time: 0,
                log: Vec::new(),
            }),
            irq: Mutex::new(None),
        }
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.mem
    }

    pub fn set_irq_handler<F: Fn(u32) + Send + Sync + 'static>(&self, f: F) {
        *self.irq.lock().unwrap() = Some(Arc::new(f));
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn raise(&self, irqs: Vec<u32>) {
        if irqs.is_empty() {
            return;
        }
        let handler = self.irq.lock().unwrap().clone();
        if let Some(handler) = handler {
            for vector in irqs {
                handler(vector);
            }
        }
    }

    /// Run `f` against the device state, then deliver whatever interrupts it raised.
    fn with_irqs<T>(&self, f: impl FnOnce(&mut Inner, &DeviceMemory, &mut Vec<u32>) -> T) -> T {
        let mut irqs = Vec::new();
        let ret = {
            let mut inner = self.lock();
            f(&mut inner, &self.mem, &mut irqs)
        };
        self.raise(irqs);
        ret
    }

    pub fn state(&self) -> MhiState {
        self.lock().state
    }

    /// Change the execution environment register without telling the host.
    pub fn set_ee(&self, ee: ExecEnv) {
        self.lock().ee = ee.to_device(&ExecEnv::DEFAULT_TABLE).unwrap_or(0xFF);
    }

    /// Event ring that receives state changes and command completions.
    pub fn set_ctrl_event_ring(&self, er: u32) {
        self.lock().ctrl_er = er;
    }

    /// Answer timesync doorbells on event ring `er`.
    pub fn set_tsync_responder(&self, er: Option<u32>) {
        self.lock().tsync_er = er;
    }

    pub fn set_link_down(&self, down: bool) {
        self.lock().link_down = down;
    }

    /// Complete the next command with `code` instead of success.
    pub fn script_command_code(&self, code: CompletionCode) {
        self.lock().script.push_back(code);
    }

    /// Consume commands without ever completing them.
    pub fn set_drop_commands(&self, drop: bool) {
        self.lock().drop_commands = drop;
    }

    /// Post an arbitrary event on event ring `er`.
    pub fn post_event(&self, er: u32, event: Event) -> Result<()> {
        self.with_irqs(|inner, mem, irqs| inner.post(mem, er, &event, irqs))
    }

    /// Post on the control event ring.
    pub fn post_ctrl_event(&self, event: Event) -> Result<()> {
        self.with_irqs(|inner, mem, irqs| {
            let er = inner.ctrl_er;
            inner.post(mem, er, &event, irqs)
        })
    }

    /// Announce a new execution environment through an EE event.
    pub fn post_ee_change(&self, ee: ExecEnv) -> Result<()> {
        let raw = ee
            .to_device(&ExecEnv::DEFAULT_TABLE)
            .ok_or_else(|| anyhow!("{ee} has no device encoding"))?;
        self.lock().ee = raw;
        self.post_ctrl_event(Event::ExecEnvChange(raw))
    }

    /// Ask the host for permission to enter low power.
    pub fn enter_m1(&self) -> Result<()> {
        self.with_irqs(|inner, mem, irqs| {
            inner.state = MhiState::M1;
            let er = inner.ctrl_er;
            inner.post(mem, er, &Event::StateChange(MhiState::M1), irqs)
        })
    }

    /// Report a fatal device error through MHISTATUS and the BHI interrupt.
    pub fn enter_sys_err(&self) {
        self.with_irqs(|inner, _, irqs| {
            inner.syserr = true;
            inner.state = MhiState::SysErr;
            irqs.push(INTVEC);
        })
    }

    /// Switch to the RAM dump environment and raise the BHI interrupt.
    pub fn enter_rddm(&self) {
        self.with_irqs(|inner, _, irqs| {
            inner.ee = ExecEnv::Rddm
                .to_device(&ExecEnv::DEFAULT_TABLE)
                .unwrap_or(3);
            irqs.push(INTVEC);
        })
    }

    /// Keep uplink elements of `chan` pending until [`complete_pending`](Self::complete_pending).
    pub fn set_hold(&self, chan: u32, hold: bool) {
        self.lock().chans.entry(chan).or_default().hold = hold;
    }

    pub fn pending_count(&self, chan: u32) -> usize {
        self.lock()
            .chans
            .get(&chan)
            .map_or(0, |sc| sc.pending.len())
    }

    /// Complete up to `n` held uplink elements of `chan`.
    pub fn complete_pending(&self, chan: u32, n: usize) -> Result<usize> {
        self.with_irqs(|inner, mem, irqs| inner.complete_ul(mem, chan, n, irqs))
    }

    /// Process uplink work without a doorbell, as a device polling in burst mode would.
    pub fn kick(&self, chan: u32) -> Result<()> {
        self.with_irqs(|inner, mem, irqs| inner.consume_ul(mem, chan, irqs))
    }

    /// Messages the device received on `chan`, chained elements joined.
    pub fn take_received(&self, chan: u32) -> Vec<Vec<u8>> {
        self.lock()
            .chans
            .get_mut(&chan)
            .map(|sc| sc.received.drain(..).collect())
            .unwrap_or_default()
    }

    /// Deliver `data` into the next receive buffer of `chan`.
    pub fn send_dl(&self, chan: u32, data: &[u8]) -> Result<()> {
        self.with_irqs(|inner, mem, irqs| inner.send_dl(mem, chan, data, irqs))
    }

    /// Receive buffers the host has queued on `chan` and the device has not used.
    pub fn dl_buffers_available(&self, chan: u32) -> Result<usize> {
        let inner = self.lock();
        inner.dl_available(&self.mem, chan)
    }

    /// Channel state byte of `chan`'s context.
    pub fn chan_state(&self, chan: u32) -> Result<u32> {
        let inner = self.lock();
        let ctxt: RingContext = self.mem.read_val(inner.chan_ctxt(chan))?;
        Ok(ctxt.chstate())
    }

    pub fn doorbell_count(&self, chan: u32) -> usize {
        self.lock().chans.get(&chan).map_or(0, |sc| sc.doorbells)
    }

    pub fn dev_wake(&self) -> bool {
        self.lock().dev_wake
    }

    pub fn log(&self) -> Vec<SimEvent> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Commands seen so far, in ring order.
    pub fn commands(&self) -> Vec<(CommandType, u32)> {
        self.lock()
            .log
            .iter()
            .filter_map(|e| match e {
                SimEvent::Command { cmd, chan } => Some((*cmd, *chan)),
                _ => None,
            })
            .collect()
    }
}

impl RegisterIo for SimDevice {
    fn read_u32(&self, addr: u64) -> u32 {
        let inner = self.lock();
        if inner.link_down {
            return INVALID_REG_VALUE;
        }
        match addr {
            MHISTATUS => inner.status(),
            CHDBOFF => CHDB_BASE as u32,
            ERDBOFF => ERDB_BASE as u32,
            BHIOFF => BHI_BASE as u32,
            a if a == BHI_BASE + BHI_EXECENV => inner.ee as u32,
            a => inner.regs.get(&a).copied().unwrap_or(0),
        }
    }

    fn write_u32(&self, addr: u64, val: u32) {
        self.with_irqs(|inner, mem, irqs| {
            if inner.link_down {
                return;
            }
            inner.regs.insert(addr, val);

            let chdb = CHDB_BASE..CHDB_BASE + MAX_CHANNELS * DOORBELL_STRIDE;
            let erdb = ERDB_BASE..ERDB_BASE + MAX_CHANNELS * DOORBELL_STRIDE;
            let res = match addr {
                MHICTRL => inner.mhictrl(mem, val, irqs),
                CRDB_LOWER => inner.command_doorbell(mem, irqs),
                TSYNC_DB => {
                    inner.log.push(SimEvent::TimeSync(val));
                    match inner.tsync_er {
                        Some(er) => {
                            inner.remote_time += 1_000;
                            let event = Event::TimeSync {
                                sequence: val,
                                remote_time: inner.remote_time,
                            };
                            inner.post(mem, er, &event, irqs)
                        }
                        None => Ok(()),
                    }
                }
                BW_SCALE_DB => {
                    inner.log.push(SimEvent::BwScaleResult(val));
                    Ok(())
                }
                a if chdb.contains(&a) && (a - CHDB_BASE) % DOORBELL_STRIDE == 0 => {
                    let chan = ((a - CHDB_BASE) / DOORBELL_STRIDE) as u32;
                    let wp = inner.reg64(a);
                    if chan as u64 == DEV_WAKE_DB {
                        inner.dev_wake = val != 0;
                        inner.log.push(SimEvent::DevWake(val != 0));
                        Ok(())
                    } else {
                        inner.log.push(SimEvent::ChannelDoorbell { chan, wp });
                        inner.chans.entry(chan).or_default().doorbells += 1;
                        let ctxt: Result<RingContext> = mem
                            .read_val(inner.chan_ctxt(chan))
                            .map_err(anyhow::Error::from);
                        match ctxt {
                            Ok(ctxt) if ctxt.kind == CHAN_TYPE_OUTBOUND => {
                                inner.consume_ul(mem, chan, irqs)
                            }
                            Ok(_) => Ok(()),
                            Err(e) => Err(e),
                        }
                    }
                }
                a if erdb.contains(&a) && (a - ERDB_BASE) % DOORBELL_STRIDE == 0 => {
                    let er = ((a - ERDB_BASE) / DOORBELL_STRIDE) as u32;
                    let wp = inner.reg64(a);
                    inner.log.push(SimEvent::EventDoorbell { er, wp });
                    Ok(())
                }
                _ => Ok(()),
            };
            if let Err(e) = res {
                log::error!("sim device: write of {val:#x} to {addr:#x} failed: {e:#}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use mhi_common::context::{CHAN_CTX_ENABLED, ER_TYPE_VALID};

    use super::*;
    use crate::{ARENA_BASE, ARENA_SIZE};

    struct Setup {
        mem: Arc<DeviceMemory>,
        dev: SimDevice,
        er_ring: u64,
    }

    /// Program one event ring and one outbound channel by hand, the way a host would.
    fn setup() -> Setup {
        let mem = Arc::new(DeviceMemory::new(ARENA_BASE, ARENA_SIZE));
        let dev = SimDevice::new(mem.clone());

        let chan_ctxt = mem.alloc(RingContext::SIZE * 4, 64).unwrap();
        let er_ctxt = mem.alloc(RingContext::SIZE, 64).unwrap();
        let er_ring = mem.alloc(Tre::SIZE * 8, 64).unwrap();
        let ch_ring = mem.alloc(Tre::SIZE * 8, 64).unwrap();

        let er = RingContext::new(0, ER_TYPE_VALID, 1, er_ring, (Tre::SIZE * 8) as u64);
        mem.write_val(er_ctxt, er).unwrap();
        // host hands all but one slot to the device
        mem.store_release(
            er_ctxt + RingContext::WP_OFFSET as u64,
            er_ring + (Tre::SIZE * 7) as u64,
        )
        .unwrap();

        let ch = RingContext::new(
            RingContext::chan_cfg(CHAN_CTX_ENABLED, 0),
            CHAN_TYPE_OUTBOUND,
            0,
            ch_ring,
            (Tre::SIZE * 8) as u64,
        );
        mem.write_val(chan_ctxt + 2 * RingContext::SIZE as u64, ch)
            .unwrap();

        dev.write_u32(CCABAP_LOWER, chan_ctxt as u32);
        dev.write_u32(CCABAP_HIGHER, (chan_ctxt >> 32) as u32);
        dev.write_u32(ECABAP_LOWER, er_ctxt as u32);
        dev.write_u32(ECABAP_HIGHER, (er_ctxt >> 32) as u32);

        Setup { mem, dev, er_ring }
    }

    #[test]
    fn test_register_discovery() {
        let s = setup();
        assert_eq!(s.dev.read_u32(CHDBOFF), CHDB_BASE as u32);
        assert_eq!(s.dev.read_u32(BHI_BASE + BHI_EXECENV), 2);
        s.dev.set_link_down(true);
        assert_eq!(s.dev.read_u32(MHISTATUS), INVALID_REG_VALUE);
    }

    #[test]
    fn test_state_request_posts_event() {
        let s = setup();
        let vectors = Arc::new(Mutex::new(Vec::new()));
        let seen = vectors.clone();
        s.dev.set_irq_handler(move |v| seen.lock().unwrap().push(v));

        s.dev
            .write_u32(MHICTRL, (MhiState::M0 as u32) << MHICTRL_MHISTATE_SHIFT);
        assert_eq!(s.dev.state(), MhiState::M0);
        assert_eq!(*vectors.lock().unwrap(), vec![1]);

        let tre = Tre::read_from(s.mem.as_ref(), s.er_ring).unwrap();
        assert_eq!(
            Event::decode(&tre).unwrap(),
            Event::StateChange(MhiState::M0)
        );
    }

    #[test]
    fn test_uplink_chain_is_one_message() {
        let s = setup();
        let chan = 2;
        let ctxt = s.dev.lock().chan_ctxt(chan);
        RingContext::write_chstate(s.mem.as_ref(), ctxt, CHAN_CTX_RUNNING).unwrap();
        let ring: RingContext = s.mem.read_val(ctxt).unwrap();

        let a = s.mem.alloc(3, 16).unwrap();
        let b = s.mem.alloc(2, 16).unwrap();
        s.mem.write(a, b"abc").unwrap();
        s.mem.write(b, b"de").unwrap();
        Tre::transfer(a, 3, TreFlags::CHAIN)
            .write_to(s.mem.as_ref(), ring.rbase)
            .unwrap();
        Tre::transfer(b, 2, TreFlags::IEOT)
            .write_to(s.mem.as_ref(), ring.rbase + 16)
            .unwrap();
        s.mem
            .store_release(ctxt + RingContext::WP_OFFSET as u64, ring.rbase + 32)
            .unwrap();
        s.dev.write_u32(CHDB_BASE + 8 * chan as u64, (ring.rbase + 32) as u32);

        assert_eq!(s.dev.take_received(chan), vec![b"abcde".to_vec()]);
        // a single event for the last element of the chain
        let tre = Tre::read_from(s.mem.as_ref(), s.er_ring).unwrap();
        assert_eq!(
            Event::decode(&tre).unwrap(),
            Event::Transfer {
                chan: 2,
                ptr: ring.rbase + 16,
                len: 2,
                code: CompletionCode::Eot
            }
        );
        let second = Tre::read_from(s.mem.as_ref(), s.er_ring + 16).unwrap();
        assert_eq!(second, Tre::default());
    }
}
