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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

//! The host side of the Modem Host Interface.
//!
//! A [`Controller`] owns everything the host shares with one device: the
//! channel, event and command context arrays, the transfer rings behind them
//! and the power management state machine. Client drivers reach channels
//! through a [`Device`], which pairs the uplink and downlink channel of one
//! name, and receive completions through [`MhiClient`].
//!
//! The platform supplies memory access, registers and DMA mapping through the
//! traits in [`mhi_common`], plus a [`ControllerOps`] implementation for link
//! control, and forwards interrupts to [`Controller::handle_irq`].

/// Bandwidth scaling requests from the device.
pub mod bw_scale;
/// Channels and their transfer rings.
pub mod channel;
/// The command ring.
pub(crate) mod cmd;
/// One-shot completions and state change waits.
pub(crate) mod completion;
/// Controller, channel and event ring configuration.
pub mod config;
/// The controller and its platform hooks.
pub mod controller;
/// Client devices and transfer results.
pub mod device;
/// Buffer mapping for transfers.
pub(crate) mod dma;
/// Errors returned by the engine.
pub mod error;
/// Event ring processing.
pub(crate) mod event;
/// Interrupt handling and the worker threads.
pub(crate) mod irq;
/// Metric definitions.
pub(crate) mod metrics;
/// Deferred register writes.
pub(crate) mod offload;
/// Power management state machine.
pub mod pm;
/// Register and doorbell access.
pub(crate) mod regs;
/// Host/device time correlation.
pub mod timesync;
/// Blocking byte pipe client.
pub mod uci;

#[cfg(test)]
pub(crate) mod testing;

pub use bw_scale::LinkInfo;
pub use channel::{ChannelInfo, ChannelState};
pub use config::{
    ChannelConfig, ControllerConfig, DoorbellMode, EventRingConfig, EventRingPriority,
    EventRingPurpose, MapPolicy, TransferType,
};
pub use controller::{Controller, ControllerOps, HostMemory};
pub use device::{
    ClientBuffer, Device, MhiBuf, MhiClient, MhiFlags, StatusEvent, TransactionStatus,
    TransferResult,
};
pub use error::{MhiError, Result};
pub use pm::{PmState, Votes};
pub use timesync::TimeSyncResult;
pub use uci::UciPipe;
