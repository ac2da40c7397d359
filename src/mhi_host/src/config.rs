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

use std::cmp::{max, min};
use std::collections::HashSet;
use std::time::Duration;

use mhi_common::regs::DEV_WAKE_DB;
use mhi_common::{DmaDirection, ExecEnv};
use tracing::{Span, instrument};

use crate::error::{MhiError, Result};

/// How a channel's elements are retired by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferType {
    /// One completion per transfer, strictly in ring order.
    Normal,
    /// Ring set credit streaming: completions carry a cookie.
    Rsc,
}

/// Doorbell policy of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DoorbellMode {
    /// Ring only after the device asks for it with an OOB/DB_MODE event.
    Burst,
    /// Ring on every queued element.
    Disable,
}

/// How client buffers are made visible to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MapPolicy {
    /// Map the client buffer itself.
    Direct,
    /// Copy through a coherent bounce buffer owned by the engine.
    Bounce,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventRingPurpose {
    /// State changes, EE changes and command completions.
    Control,
    /// Transfer completions.
    Data,
    /// Transfer completions including RSC cookies.
    RscData,
    TimeSync,
    BwScale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventRingPriority {
    High,
    Normal,
}

/// Static description of one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub(crate) num: u32,
    pub(crate) name: String,
    pub(crate) dir: DmaDirection,
    pub(crate) xfer_type: TransferType,
    pub(crate) elements: usize,
    pub(crate) er_index: usize,
    pub(crate) doorbell: DoorbellMode,
    pub(crate) ee_mask: u32,
    pub(crate) pre_alloc: bool,
    pub(crate) auto_start: bool,
    pub(crate) offload: bool,
    pub(crate) bei: bool,
    pub(crate) doorbell_mode_switch: bool,
}

impl ChannelConfig {
    /// The default ring size of a channel
    pub const DEFAULT_ELEMENTS: usize = 64;

    /// A normal channel available in mission mode, ringing on every element.
    pub fn new(num: u32, name: &str, dir: DmaDirection, er_index: usize) -> Self {
        Self {
            num,
            name: name.to_string(),
            dir,
            xfer_type: TransferType::Normal,
            elements: Self::DEFAULT_ELEMENTS,
            er_index,
            doorbell: DoorbellMode::Disable,
            ee_mask: ExecEnv::Amss.mask_bit() | ExecEnv::Wfw.mask_bit(),
            pre_alloc: false,
            auto_start: false,
            offload: false,
            bei: false,
            doorbell_mode_switch: false,
        }
    }

    pub fn with_elements(mut self, elements: usize) -> Self {
        self.elements = elements;
        self
    }

    pub fn with_transfer_type(mut self, xfer_type: TransferType) -> Self {
        self.xfer_type = xfer_type;
        self
    }

    pub fn with_doorbell_mode(mut self, doorbell: DoorbellMode) -> Self {
        self.doorbell = doorbell;
        self
    }

    /// Execution environments the channel may be started in.
    pub fn with_ee_mask(mut self, ees: &[ExecEnv]) -> Self {
        self.ee_mask = ees.iter().fold(0, |mask, ee| mask | ee.mask_bit());
        self
    }

    /// Keep the receive ring full of engine-owned buffers.
    pub fn with_pre_alloc(mut self, pre_alloc: bool) -> Self {
        self.pre_alloc = pre_alloc;
        self
    }

    /// Start the channel as soon as mission mode is reached.
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// The channel is driven by its client through a dedicated event ring.
    pub fn with_offload(mut self, offload: bool) -> Self {
        self.offload = offload;
        self
    }

    /// Suppress completion interrupts on queued elements.
    pub fn with_bei(mut self, bei: bool) -> Self {
        self.bei = bei;
        self
    }

    /// Return to doorbell mode after every M0 entry.
    pub fn with_doorbell_mode_switch(mut self, switch: bool) -> Self {
        self.doorbell_mode_switch = switch;
        self
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> DmaDirection {
        self.dir
    }
}

/// Static description of one event ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRingConfig {
    pub(crate) elements: usize,
    pub(crate) purpose: EventRingPurpose,
    pub(crate) irq: u32,
    pub(crate) priority: EventRingPriority,
    pub(crate) client_managed: bool,
    pub(crate) chan: Option<u32>,
}

impl EventRingConfig {
    pub const DEFAULT_ELEMENTS: usize = 64;

    pub fn new(purpose: EventRingPurpose, irq: u32) -> Self {
        Self {
            elements: Self::DEFAULT_ELEMENTS,
            purpose,
            irq,
            priority: EventRingPriority::Normal,
            client_managed: false,
            chan: None,
        }
    }

    pub fn with_elements(mut self, elements: usize) -> Self {
        self.elements = elements;
        self
    }

    pub fn with_priority(mut self, priority: EventRingPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Dedicate the ring to `chan`; its interrupts are forwarded to the client
    /// which drains the ring with [`crate::device::Device::poll`].
    pub fn client_managed(mut self, chan: u32) -> Self {
        self.client_managed = true;
        self.chan = Some(chan);
        self
    }
}

/// The complete set of configuration needed to create a controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Bound on command round trips and state waits, in milliseconds.
    timeout_ms: u32,
    /// Bound on waiting for register access while submitting a command.
    resume_timeout_ms: u32,
    event_quota: usize,
    rsc_min_credits: usize,
    reg_write_offload: bool,
    reg_write_queue_len: usize,
    map_policy: MapPolicy,
    rddm_supported: bool,
    tsync_db_offset: Option<u64>,
    bw_scale_db_offset: Option<u64>,
    remote_timer_freq: u64,
    local_timer_freq: u64,
    /// Size of engine-owned receive buffers on pre-allocating channels.
    buffer_len: usize,
    ee_table: [u8; 9],
    /// Vector of the BHI/state change interrupt.
    intvec: u32,
    pub(crate) channels: Vec<ChannelConfig>,
    pub(crate) event_rings: Vec<EventRingConfig>,
}

impl ControllerConfig {
    /// The default command timeout
    pub const DEFAULT_TIMEOUT: u32 = 10_000;
    /// The minimum command timeout
    pub const MIN_TIMEOUT: u32 = 1;
    /// The maximum command timeout
    pub const MAX_TIMEOUT: u32 = 60_000;
    /// The default wait for register access during command submission
    pub const DEFAULT_RESUME_TIMEOUT: u32 = 2_000;
    pub const MIN_RESUME_TIMEOUT: u32 = 1;
    pub const MAX_RESUME_TIMEOUT: u32 = 60_000;
    /// The default number of events processed per data ring invocation
    pub const DEFAULT_EVENT_QUOTA: usize = 64;
    pub const DEFAULT_RSC_MIN_CREDITS: usize = 8;
    pub const DEFAULT_REG_WRITE_QUEUE_LEN: usize = 1024;
    pub const DEFAULT_TIMER_FREQ: u64 = 19_200_000;
    pub const DEFAULT_BUFFER_LEN: usize = 0xFFFF;
    /// TREs carry a 16-bit length
    pub const MAX_BUFFER_LEN: usize = 0xFFFF;

    /// An empty configuration with every value at its default.
    pub fn new() -> Self {
        Self {
            timeout_ms: Self::DEFAULT_TIMEOUT,
            resume_timeout_ms: Self::DEFAULT_RESUME_TIMEOUT,
            event_quota: Self::DEFAULT_EVENT_QUOTA,
            rsc_min_credits: Self::DEFAULT_RSC_MIN_CREDITS,
            reg_write_offload: false,
            reg_write_queue_len: Self::DEFAULT_REG_WRITE_QUEUE_LEN,
            map_policy: MapPolicy::Direct,
            rddm_supported: false,
            tsync_db_offset: None,
            bw_scale_db_offset: None,
            remote_timer_freq: Self::DEFAULT_TIMER_FREQ,
            local_timer_freq: Self::DEFAULT_TIMER_FREQ,
            buffer_len: Self::DEFAULT_BUFFER_LEN,
            ee_table: ExecEnv::DEFAULT_TABLE,
            intvec: 0,
            channels: Vec::new(),
            event_rings: Vec::new(),
        }
    }

    /// Set the command and state wait timeout. If set to 0, the timeout will be
    /// set to the default value of `DEFAULT_TIMEOUT`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_timeout(&mut self, timeout: Duration) {
        match timeout.as_millis() {
            0 => self.timeout_ms = Self::DEFAULT_TIMEOUT,
            1.. => {
                self.timeout_ms = min(
                    Self::MAX_TIMEOUT.into(),
                    max(timeout.as_millis(), Self::MIN_TIMEOUT.into()),
                ) as u32
            }
        }
    }

    pub(crate) fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms as u64)
    }

    /// Set how long command submission waits for register access to come
    /// back. If set to 0, the default value of `DEFAULT_RESUME_TIMEOUT` is used.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_resume_timeout(&mut self, timeout: Duration) {
        match timeout.as_millis() {
            0 => self.resume_timeout_ms = Self::DEFAULT_RESUME_TIMEOUT,
            1.. => {
                self.resume_timeout_ms = min(
                    Self::MAX_RESUME_TIMEOUT.into(),
                    max(timeout.as_millis(), Self::MIN_RESUME_TIMEOUT.into()),
                ) as u32
            }
        }
    }

    pub(crate) fn get_resume_timeout(&self) -> Duration {
        Duration::from_millis(self.resume_timeout_ms as u64)
    }

    /// Events handled per data ring invocation before yielding. 0 selects the default.
    pub fn set_event_quota(&mut self, quota: usize) {
        self.event_quota = match quota {
            0 => Self::DEFAULT_EVENT_QUOTA,
            n => n,
        };
    }

    pub(crate) fn get_event_quota(&self) -> usize {
        self.event_quota
    }

    /// Outstanding RSC elements required before a burst mode doorbell is rung.
    pub fn set_rsc_min_credits(&mut self, credits: usize) {
        self.rsc_min_credits = credits;
    }

    pub(crate) fn get_rsc_min_credits(&self) -> usize {
        self.rsc_min_credits
    }

    /// Route doorbell writes through the offload queue of `queue_len` entries.
    pub fn set_reg_write_offload(&mut self, enabled: bool, queue_len: usize) {
        self.reg_write_offload = enabled;
        self.reg_write_queue_len = match queue_len {
            0 => Self::DEFAULT_REG_WRITE_QUEUE_LEN,
            n => n,
        };
    }

    pub(crate) fn get_reg_write_offload(&self) -> Option<usize> {
        self.reg_write_offload.then_some(self.reg_write_queue_len)
    }

    pub fn set_map_policy(&mut self, policy: MapPolicy) {
        self.map_policy = policy;
    }

    pub(crate) fn get_map_policy(&self) -> MapPolicy {
        self.map_policy
    }

    /// The device collects a RAM dump on fatal errors instead of the host
    /// running SYS_ERR recovery.
    pub fn set_rddm_supported(&mut self, supported: bool) {
        self.rddm_supported = supported;
    }

    pub(crate) fn get_rddm_supported(&self) -> bool {
        self.rddm_supported
    }

    pub fn set_tsync_db_offset(&mut self, offset: u64) {
        self.tsync_db_offset = Some(offset);
    }

    pub(crate) fn get_tsync_db_offset(&self) -> Option<u64> {
        self.tsync_db_offset
    }

    pub fn set_bw_scale_db_offset(&mut self, offset: u64) {
        self.bw_scale_db_offset = Some(offset);
    }

    pub(crate) fn get_bw_scale_db_offset(&self) -> Option<u64> {
        self.bw_scale_db_offset
    }

    /// Timer frequencies in Hz. A zero selects `DEFAULT_TIMER_FREQ`.
    pub fn set_timer_freqs(&mut self, local: u64, remote: u64) {
        self.local_timer_freq = if local == 0 {
            Self::DEFAULT_TIMER_FREQ
        } else {
            local
        };
        self.remote_timer_freq = if remote == 0 {
            Self::DEFAULT_TIMER_FREQ
        } else {
            remote
        };
    }

    pub(crate) fn get_timer_freqs(&self) -> (u64, u64) {
        (self.local_timer_freq, self.remote_timer_freq)
    }

    /// Size of engine-owned receive buffers. 0 selects the default; larger
    /// values are clamped to what a TRE can describe.
    pub fn set_buffer_len(&mut self, len: usize) {
        self.buffer_len = match len {
            0 => Self::DEFAULT_BUFFER_LEN,
            n => min(n, Self::MAX_BUFFER_LEN),
        };
    }

    pub(crate) fn get_buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Device values of PBL, SBL, AMSS, RDDM, WFW, PTHRU, EDL, FP and UEFI, in that order.
    pub fn set_ee_table(&mut self, table: [u8; 9]) {
        self.ee_table = table;
    }

    pub(crate) fn get_ee_table(&self) -> &[u8] {
        &self.ee_table
    }

    /// Interrupt vector the device raises for state and EE changes.
    pub fn set_intvec(&mut self, vector: u32) {
        self.intvec = vector;
    }

    pub(crate) fn get_intvec(&self) -> u32 {
        self.intvec
    }

    pub fn add_channel(&mut self, chan: ChannelConfig) -> &mut Self {
        self.channels.push(chan);
        self
    }

    pub fn add_event_ring(&mut self, er: EventRingConfig) -> &mut Self {
        self.event_rings.push(er);
        self
    }

    /// Index of the event ring receiving command completions and state changes.
    pub(crate) fn primary_event_ring(&self) -> Option<usize> {
        self.event_rings
            .iter()
            .position(|er| er.purpose == EventRingPurpose::Control)
    }

    /// Check the configuration for inconsistencies the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(MhiError::InvalidArgument(msg));

        if self.primary_event_ring().is_none() {
            return invalid("no control event ring configured".to_string());
        }
        if self.reg_write_offload && !self.reg_write_queue_len.is_power_of_two() {
            return invalid(format!(
                "register write queue length {} is not a power of two",
                self.reg_write_queue_len
            ));
        }

        for (i, er) in self.event_rings.iter().enumerate() {
            if er.elements < 2 {
                return invalid(format!("event ring {i} has fewer than 2 elements"));
            }
            if er.client_managed && er.chan.is_none() {
                return invalid(format!("client managed event ring {i} has no channel"));
            }
        }

        let mut seen = HashSet::new();
        for chan in &self.channels {
            if !seen.insert(chan.num) {
                return invalid(format!("duplicate channel number {}", chan.num));
            }
            if chan.num as u64 >= DEV_WAKE_DB {
                return invalid(format!("channel number {} is reserved", chan.num));
            }
            if chan.elements < 2 {
                return invalid(format!("channel {} has fewer than 2 elements", chan.num));
            }
            let Some(er) = self.event_rings.get(chan.er_index) else {
                return invalid(format!(
                    "channel {} uses unknown event ring {}",
                    chan.num, chan.er_index
                ));
            };
            if chan.xfer_type == TransferType::Rsc && er.purpose != EventRingPurpose::RscData {
                return invalid(format!(
                    "RSC channel {} needs an RSC capable event ring",
                    chan.num
                ));
            }
        }

        for (i, er) in self.event_rings.iter().enumerate() {
            if let Some(num) = er.chan {
                match self.channels.iter().find(|c| c.num == num) {
                    Some(c) if c.er_index == i => {}
                    _ => {
                        return invalid(format!(
                            "event ring {i} is dedicated to channel {num} which does not use it"
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn minimal() -> ControllerConfig {
        let mut cfg = ControllerConfig::default();
        cfg.add_event_ring(EventRingConfig::new(EventRingPurpose::Control, 1))
            .add_event_ring(EventRingConfig::new(EventRingPurpose::Data, 2))
            .add_channel(ChannelConfig::new(0, "LOOPBACK", DmaDirection::ToDevice, 1))
            .add_channel(ChannelConfig::new(1, "LOOPBACK", DmaDirection::FromDevice, 1));
        cfg
    }

    #[test]
    fn overrides() {
        const TIMEOUT_OVERRIDE: u32 = 1_500;
        let mut cfg = ControllerConfig::default();
        cfg.set_timeout(Duration::from_millis(TIMEOUT_OVERRIDE as u64));
        assert_eq!(cfg.get_timeout(), Duration::from_millis(1_500));

        cfg.set_timeout(Duration::ZERO);
        assert_eq!(
            cfg.get_timeout(),
            Duration::from_millis(ControllerConfig::DEFAULT_TIMEOUT as u64)
        );

        cfg.set_resume_timeout(Duration::from_secs(600));
        assert_eq!(
            cfg.get_resume_timeout(),
            Duration::from_millis(ControllerConfig::MAX_RESUME_TIMEOUT as u64)
        );

        cfg.set_buffer_len(0x10_0000);
        assert_eq!(cfg.get_buffer_len(), ControllerConfig::MAX_BUFFER_LEN);
        cfg.set_event_quota(0);
        assert_eq!(cfg.get_event_quota(), ControllerConfig::DEFAULT_EVENT_QUOTA);
    }

    #[test]
    fn test_validate_accepts_minimal() {
        minimal().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects() {
        let mut cfg = minimal();
        cfg.add_channel(ChannelConfig::new(0, "DUP", DmaDirection::ToDevice, 1));
        assert!(matches!(cfg.validate(), Err(MhiError::InvalidArgument(_))));

        let mut cfg = minimal();
        cfg.add_channel(ChannelConfig::new(4, "LOST", DmaDirection::ToDevice, 7));
        assert!(matches!(cfg.validate(), Err(MhiError::InvalidArgument(_))));

        let mut cfg = minimal();
        cfg.add_channel(ChannelConfig::new(4, "TINY", DmaDirection::ToDevice, 1).with_elements(1));
        assert!(matches!(cfg.validate(), Err(MhiError::InvalidArgument(_))));

        let mut cfg = minimal();
        cfg.set_reg_write_offload(true, 1000);
        assert!(matches!(cfg.validate(), Err(MhiError::InvalidArgument(_))));

        let mut cfg = ControllerConfig::default();
        cfg.add_event_ring(EventRingConfig::new(EventRingPurpose::Data, 1));
        assert!(matches!(cfg.validate(), Err(MhiError::InvalidArgument(_))));

        let mut cfg = minimal();
        cfg.add_channel(
            ChannelConfig::new(5, "RSC", DmaDirection::FromDevice, 1)
                .with_transfer_type(TransferType::Rsc),
        );
        assert!(matches!(cfg.validate(), Err(MhiError::InvalidArgument(_))));
    }

    #[test]
    fn test_ee_mask() {
        let chan = ChannelConfig::new(2, "SAHARA", DmaDirection::ToDevice, 1)
            .with_ee_mask(&[ExecEnv::Sbl, ExecEnv::Pbl]);
        assert_eq!(chan.ee_mask, 0b11);
    }
}
