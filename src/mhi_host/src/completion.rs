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

//! Blocking rendezvous points between callers and the event path.
//!
//! A [`Completion`] carries the code of one command round trip from the
//! control event ring back to the thread that submitted the command.
//! [`StateEvent`] is the broadcast wakeup behind every "wait until the power
//! state or execution environment changes" in the engine.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use mhi_common::CompletionCode;

use crate::error::{MhiError, Result};

fn poisoned<E>(_: E) -> MhiError {
    MhiError::LockAttemptFailed("condition variable mutex poisoned".to_string())
}

#[derive(Debug, Default)]
pub(crate) struct Completion {
    code: Mutex<Option<CompletionCode>>,
    cv: Condvar,
}

impl Completion {
    /// Forget any earlier result before a new command is submitted.
    pub(crate) fn reinit(&self) -> Result<()> {
        *self.code.lock()? = None;
        Ok(())
    }

    pub(crate) fn complete(&self, code: CompletionCode) {
        match self.code.lock() {
            Ok(mut slot) => {
                *slot = Some(code);
                self.cv.notify_all();
            }
            Err(e) => log::error!("dropping completion {code:?}: {e}"),
        }
    }

    /// Wait for [`complete`](Self::complete), at most `timeout`.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<CompletionCode> {
        let guard = self.code.lock()?;
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |code| code.is_none())
            .map_err(poisoned)?;
        (*guard).ok_or(MhiError::Timeout(timeout))
    }
}

/// A generation counter bumped on every power state or EE change.
#[derive(Debug, Default)]
pub(crate) struct StateEvent {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl StateEvent {
    pub(crate) fn notify_all(&self) {
        match self.generation.lock() {
            Ok(mut generation) => {
                *generation = generation.wrapping_add(1);
                self.cv.notify_all();
            }
            Err(e) => log::error!("state event lost: {e}"),
        }
    }

    /// Block until `cond` holds or `timeout` expires. `cond` is evaluated without
    /// the internal lock held, so it may take engine locks itself. Returns the
    /// final value of `cond`.
    pub(crate) fn wait_until<F: FnMut() -> bool>(
        &self,
        timeout: Duration,
        mut cond: F,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = *self.generation.lock()?;
            if cond() {
                return Ok(true);
            }

            let mut generation = self.generation.lock()?;
            while *generation == seen {
                let now = Instant::now();
                if now >= deadline {
                    drop(generation);
                    return Ok(cond());
                }
                let (g, _) = self
                    .cv
                    .wait_timeout(generation, deadline - now)
                    .map_err(poisoned)?;
                generation = g;
            }
        }
    }
}
