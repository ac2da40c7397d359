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

//! Test support for the MHI host engine.
//!
//! [`device::SimDevice`] plays the modem: it owns a register file, watches the
//! doorbells the host rings, consumes command and transfer rings out of a
//! [`mem::DeviceMemory`] arena and posts events back. [`dma::SimDma`] maps host
//! buffers into the same arena.

pub mod device;
pub mod dma;
pub mod mem;
pub mod simplelogger;

pub use device::{SimDevice, SimEvent};
pub use dma::SimDma;
pub use mem::{DeviceMemory, MemError};

/// Base device address of the default simulated arena.
pub const ARENA_BASE: u64 = 0x1000_0000;
/// Size of the default simulated arena.
pub const ARENA_SIZE: usize = 4 * 1024 * 1024;
