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

use std::error::Error;
use std::fmt::Debug;
use std::sync::{MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use mhi_common::{DmaError, EventError, RingError};
use thiserror::Error;

/// The error type for MHI host operations
#[derive(Error, Debug)]
pub enum MhiError {
    /// Anyhow error returned by a controller collaborator
    #[error("Anyhow Error was returned: {0}")]
    AnyhowError(#[from] anyhow::Error),

    /// DMA mapping or coherent allocation failed
    #[error("DMA error: {0}")]
    Dma(#[from] DmaError),

    /// A general error with a message
    #[error("{0}")]
    Error(String),

    /// An event ring element could not be decoded
    #[error("Malformed event: {0}")]
    Event(#[from] EventError),

    /// An argument or configuration value was rejected
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed in the current channel or device state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Register or ring access is not possible in the current power state
    #[error("I/O error: {0}")]
    IoError(String),

    /// A lock was poisoned
    #[error("Unable to lock resource: {0}")]
    LockAttemptFailed(String),

    /// The channel is not available in the current execution environment
    #[error("Channel is not connected")]
    NotConnected,

    /// A ring, the command ring or an allocation ran out of room
    #[error("Out of memory")]
    OutOfMemory,

    /// The device broke the ring protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Access to memory shared with the device failed
    #[error("Shared memory access failed at {0:#x}")]
    SharedMemoryAccess(u64),

    /// A completion was not observed in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl From<&str> for MhiError {
    fn from(s: &str) -> Self {
        MhiError::Error(s.to_string())
    }
}

impl From<RingError> for MhiError {
    fn from(e: RingError) -> Self {
        match e {
            RingError::Full => MhiError::OutOfMemory,
            RingError::OutOfRange(addr) => {
                MhiError::ProtocolViolation(format!("ring pointer {addr:#x} out of range"))
            }
        }
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for MhiError {
    // Implemented this way rather than passing the error as a source to LockAttemptFailed as that would require
    // Box<dyn Error + Send + Sync> which is not easy to implement for PoisonError<MutexGuard<'_, T>>
    // This is a good enough solution and allows use to use the ? operator on lock() calls
    fn from(e: PoisonError<MutexGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => String::from(""),
        };
        MhiError::LockAttemptFailed(source)
    }
}

impl<T> From<PoisonError<RwLockReadGuard<'_, T>>> for MhiError {
    fn from(e: PoisonError<RwLockReadGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => String::from(""),
        };
        MhiError::LockAttemptFailed(source)
    }
}

impl<T> From<PoisonError<RwLockWriteGuard<'_, T>>> for MhiError {
    fn from(e: PoisonError<RwLockWriteGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => String::from(""),
        };
        MhiError::LockAttemptFailed(source)
    }
}

pub(crate) const ENOMEM: i32 = 12;
pub(crate) const EIO: i32 = 5;
pub(crate) const EINVAL: i32 = 22;
pub(crate) const ENOTCONN: i32 = 107;
pub(crate) const ETIMEDOUT: i32 = 110;

impl MhiError {
    /// Whether this error is a breach of the device contract that must escalate
    /// to system error recovery.
    pub fn is_fatal(&self) -> bool {
        // wildcard _ or matches! not used here purposefully to ensure that new error variants
        // are explicitly considered for escalation.
        match self {
            MhiError::ProtocolViolation(_) => true,

            MhiError::AnyhowError(_)
            | MhiError::Dma(_)
            | MhiError::Error(_)
            | MhiError::Event(_)
            | MhiError::InvalidArgument(_)
            | MhiError::InvalidState(_)
            | MhiError::IoError(_)
            | MhiError::LockAttemptFailed(_)
            | MhiError::NotConnected
            | MhiError::OutOfMemory
            | MhiError::SharedMemoryAccess(_)
            | MhiError::Timeout(_) => false,
        }
    }

    /// The negative errno a C client would see for this error.
    pub fn errno(&self) -> i32 {
        let e = match self {
            MhiError::OutOfMemory | MhiError::Dma(DmaError::OutOfMemory) => ENOMEM,
            MhiError::Timeout(_) => ETIMEDOUT,
            MhiError::NotConnected => ENOTCONN,
            MhiError::InvalidArgument(_) => EINVAL,
            MhiError::AnyhowError(_)
            | MhiError::Dma(DmaError::MapFailed)
            | MhiError::Error(_)
            | MhiError::Event(_)
            | MhiError::InvalidState(_)
            | MhiError::IoError(_)
            | MhiError::LockAttemptFailed(_)
            | MhiError::ProtocolViolation(_)
            | MhiError::SharedMemoryAccess(_) => EIO,
        };
        -e
    }
}

/// Maps a backend memory error onto [`MhiError::SharedMemoryAccess`], keeping the
/// backend's own description in the log.
pub(crate) trait SharedMemResult<T> {
    fn shm(self, addr: u64) -> Result<T>;
}

impl<T, E: Debug> SharedMemResult<T> for core::result::Result<T, E> {
    fn shm(self, addr: u64) -> Result<T> {
        self.map_err(|e| {
            log::error!("shared memory access at {addr:#x} failed: {e:?}");
            MhiError::SharedMemoryAccess(addr)
        })
    }
}

/// The result type for MHI host operations
pub type Result<T> = core::result::Result<T, MhiError>;

/// Creates a `MhiError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::error::MhiError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::MhiError::Error(__err_msg)
    }};
}

/// Logs an error at error level, then returns it from the enclosing function.
///
/// Accepts an error value, or a literal/format string that is turned into a
/// `MhiError::Error` first.
#[macro_export]
macro_rules! log_then_return {
    ($msg:literal $(,)?) => {{
        let __err = $crate::new_error!($msg);
        log::error!("{}", __err);
        return Err(__err);
    }};
    ($err:expr $(,)?) => {{
        let __err = $err;
        log::error!("{}", __err);
        return Err(__err.into());
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
        let __err = $crate::new_error!($fmtstr, $($arg)*);
        log::error!("{}", __err);
        return Err(__err);
    }};
}
