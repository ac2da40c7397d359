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
// We use Arbitrary during fuzzing, which requires std
#![cfg_attr(not(any(test, feature = "fuzzing")), no_std)]

//! Pieces of the Modem Host Interface that both sides of the link agree on.
//!
//! The host and the device exchange work through rings of 16-byte transfer ring
//! elements ([`Tre`]) living in memory visible to both. Each ring is described to the
//! device by a 48-byte [`RingContext`]; doorbell registers tell the other side that a
//! ring has new elements. Nothing in this crate owns memory: every access goes through
//! the [`MemOps`], [`RegisterIo`] and [`DmaOps`] traits so the same code serves the
//! host engine and software device models.

/// Memory, register and DMA access traits.
pub mod access;
/// The ring context structure shared with the device.
pub mod context;
/// Typed view of the events a device posts to event rings.
pub mod event;
/// MMIO register offsets and field masks.
pub mod regs;
/// Ring cursor arithmetic and shared-memory publishing.
pub mod ring;
/// Device states and execution environments.
pub mod state;
/// Transfer ring element encoding.
pub mod tre;

pub use access::*;
pub use context::RingContext;
pub use event::{Event, EventError};
pub use ring::{Ring, RingError};
pub use state::{ExecEnv, MhiState};
pub use tre::{CommandType, CompletionCode, EventType, Tre, TreFlags};
