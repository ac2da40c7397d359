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

//! A blocking byte pipe over one [`Device`], in the manner of a user control
//! interface node.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mhi_common::DmaDirection;

use crate::controller::HostMemory;
use crate::device::{Device, MhiClient, MhiFlags, StatusEvent, TransactionStatus, TransferResult};
use crate::error::{MhiError, Result};

/// A completed receive buffer and how much of it was read.
#[derive(Debug)]
struct RxBuf {
    buf: BytesMut,
    len: usize,
    off: usize,
}

#[derive(Debug, Default)]
struct PipeState {
    rx: VecDeque<RxBuf>,
    /// Uplink completions so far; writers wait for it to move.
    ul_done: u64,
    fatal: bool,
}

#[derive(Debug, Default)]
struct PipeShared {
    state: Mutex<PipeState>,
    cond: Condvar,
}

impl PipeShared {
    fn lock(&self) -> Result<MutexGuard<'_, PipeState>> {
        Ok(self.state.lock()?)
    }

    /// Wait on the pipe until `deadline`. Returns the guard and whether time ran out.
    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, PipeState>,
        deadline: Instant,
    ) -> Result<(MutexGuard<'a, PipeState>, bool)> {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok((guard, true));
        }
        let (guard, res) = self
            .cond
            .wait_timeout(guard, left)
            .map_err(|e| MhiError::LockAttemptFailed(e.to_string()))?;
        Ok((guard, res.timed_out()))
    }
}

impl MhiClient for PipeShared {
    fn ul_xfer_cb(&self, _result: TransferResult) {
        if let Ok(mut st) = self.state.lock() {
            st.ul_done += 1;
        }
        self.cond.notify_all();
    }

    fn dl_xfer_cb(&self, result: TransferResult) {
        if result.transaction_status == TransactionStatus::NotConnected {
            return;
        }
        let Some(buf) = result.buf.into_bytes() else {
            log::warn!("pipe received a caller mapped buffer");
            return;
        };
        if let Ok(mut st) = self.state.lock() {
            st.rx.push_back(RxBuf {
                buf,
                len: result.bytes_xferd,
                off: 0,
            });
        }
        self.cond.notify_all();
    }

    fn status_cb(&self, event: StatusEvent) {
        if matches!(event, StatusEvent::FatalError | StatusEvent::SysError) {
            if let Ok(mut st) = self.state.lock() {
                st.fatal = true;
            }
            self.cond.notify_all();
        }
    }
}

/// Byte pipe over the uplink and downlink channel of a device.
pub struct UciPipe<M: HostMemory> {
    dev: Arc<Device<M>>,
    shared: Arc<PipeShared>,
    mtu: usize,
    open: bool,
}

impl<M: HostMemory> std::fmt::Debug for UciPipe<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UciPipe")
            .field("dev", &self.dev.name())
            .field("mtu", &self.mtu)
            .field("open", &self.open)
            .finish()
    }
}

impl<M: HostMemory> UciPipe<M> {
    /// Bind to `dev`, start its channels and fill the receive ring with
    /// `mtu` byte buffers.
    pub fn open(dev: Arc<Device<M>>, mtu: usize) -> Result<Self> {
        if mtu == 0 {
            return Err(MhiError::InvalidArgument("zero pipe mtu".to_string()));
        }
        let shared = Arc::new(PipeShared::default());
        dev.bind(shared.clone())?;
        if let Err(e) = dev.prepare_for_transfer() {
            dev.unbind()?;
            return Err(e);
        }
        let pipe = Self {
            dev,
            shared,
            mtu,
            open: true,
        };

        let free = pipe.dev.get_no_free_descriptors(DmaDirection::FromDevice)?;
        for _ in 0..free {
            pipe.dev.queue_transfer(
                DmaDirection::FromDevice,
                BytesMut::zeroed(mtu),
                MhiFlags::EOT,
            )?;
        }
        log::debug!("{}: pipe open, {free} receive buffers", pipe.dev.name());
        Ok(pipe)
    }

    /// Send `data`, waiting up to `timeout` for uplink descriptors. Returns
    /// the number of bytes queued, which is short only on timeout.
    pub fn write(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut sent = 0;
        for chunk in data.chunks(self.mtu) {
            let free = match self.wait_ul_descriptor(deadline)? {
                Some(free) => free,
                None if sent > 0 => return Ok(sent),
                None => return Err(MhiError::Timeout(timeout)),
            };
            let last = sent + chunk.len() == data.len();
            let mut flags = MhiFlags::EOT;
            if !last && free > 1 {
                flags |= MhiFlags::CHAIN;
            }
            self.dev
                .queue_transfer(DmaDirection::ToDevice, BytesMut::from(chunk), flags)?;
            sent += chunk.len();
        }
        Ok(sent)
    }

    fn wait_ul_descriptor(&self, deadline: Instant) -> Result<Option<usize>> {
        loop {
            let seen = {
                let st = self.shared.lock()?;
                if st.fatal {
                    return Err(MhiError::NotConnected);
                }
                st.ul_done
            };
            let free = self.dev.get_no_free_descriptors(DmaDirection::ToDevice)?;
            if free > 0 {
                return Ok(Some(free));
            }
            let st = self.shared.lock()?;
            if st.ul_done == seen {
                let (_st, timed_out) = self.shared.wait(st, deadline)?;
                if timed_out {
                    return Ok(None);
                }
            }
        }
    }

    /// Copy received bytes into `out`, waiting up to `timeout` for the first
    /// one. A buffer is handed back to the device once fully read.
    pub fn read(&self, out: &mut [u8], timeout: Duration) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock()?;
        while st.rx.is_empty() {
            if st.fatal {
                return Err(MhiError::NotConnected);
            }
            let (guard, timed_out) = self.shared.wait(st, deadline)?;
            st = guard;
            if timed_out && st.rx.is_empty() {
                return Err(MhiError::Timeout(timeout));
            }
        }

        let Some(front) = st.rx.front_mut() else {
            return Ok(0);
        };
        let n = out.len().min(front.len - front.off);
        out[..n].copy_from_slice(&front.buf[front.off..front.off + n]);
        front.off += n;
        if front.off < front.len {
            return Ok(n);
        }
        let done = st.rx.pop_front();
        drop(st);

        if let Some(RxBuf { mut buf, .. }) = done {
            buf.resize(self.mtu, 0);
            if let Err(e) = self
                .dev
                .queue_transfer(DmaDirection::FromDevice, buf, MhiFlags::EOT)
            {
                log::warn!("{}: cannot requeue receive buffer: {e}", self.dev.name());
            }
        }
        Ok(n)
    }

    /// Bytes received and not read yet.
    pub fn available(&self) -> usize {
        self.shared
            .lock()
            .map(|st| st.rx.iter().map(|b| b.len - b.off).sum())
            .unwrap_or(0)
    }

    /// Stop both channels and detach from the device.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.open) {
            return Ok(());
        }
        let res = self.dev.unprepare_from_transfer();
        self.dev.unbind()?;
        if let Ok(mut st) = self.shared.lock() {
            st.rx.clear();
        }
        res
    }
}

impl<M: HostMemory> Drop for UciPipe<M> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("{}: closing pipe failed: {e}", self.dev.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::ChannelState;
    use crate::testing::Harness;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_write_chains_mtu_chunks() {
        let h = Harness::powered();
        let pipe = UciPipe::open(h.loopback(), 16).unwrap();

        let data: Vec<u8> = (0..40).collect();
        assert_eq!(pipe.write(&data, WAIT).unwrap(), 40);
        // one message: the first two chunks are chained to the last
        assert!(h.wait_for(|| h.ctrl.pending_packets() == 0));
        assert_eq!(h.dev.take_received(Harness::UL_CHAN), vec![data]);
        pipe.close().unwrap();
    }

    #[test]
    fn test_read_in_pieces_and_requeue() {
        let h = Harness::powered();
        let pipe = UciPipe::open(h.loopback(), 32).unwrap();
        let filled = h.dev.dl_buffers_available(Harness::DL_CHAN).unwrap();
        assert!(filled > 0);

        h.dev.send_dl(Harness::DL_CHAN, b"modem says hi").unwrap();
        let mut out = [0u8; 5];
        assert_eq!(pipe.read(&mut out, WAIT).unwrap(), 5);
        assert_eq!(&out, b"modem");
        assert_eq!(pipe.available(), 8);

        let mut rest = [0u8; 64];
        assert_eq!(pipe.read(&mut rest, WAIT).unwrap(), 8);
        assert_eq!(&rest[..8], b" says hi");
        assert!(h.wait_for(|| h.dev.dl_buffers_available(Harness::DL_CHAN).unwrap() == filled));
    }

    #[test]
    fn test_read_times_out() {
        let h = Harness::powered();
        let pipe = UciPipe::open(h.loopback(), 32).unwrap();
        let mut out = [0u8; 4];
        assert!(matches!(
            pipe.read(&mut out, Duration::from_millis(20)),
            Err(MhiError::Timeout(_))
        ));
    }

    #[test]
    fn test_close_resets_channels() {
        let h = Harness::powered();
        let pipe = UciPipe::open(h.loopback(), 32).unwrap();
        pipe.close().unwrap();
        for num in [Harness::UL_CHAN, Harness::DL_CHAN] {
            assert_eq!(
                h.ctrl.channel_info(num).unwrap().state,
                ChannelState::Disabled
            );
        }
        // the device can be opened again
        let pipe = UciPipe::open(h.loopback(), 32).unwrap();
        drop(pipe);
    }
}
