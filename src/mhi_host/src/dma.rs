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

use mhi_common::{DmaDirection, DmaOps, MemOps};

use crate::config::MapPolicy;
use crate::device::ClientBuffer;
use crate::error::{Result, SharedMemResult};

/// Where the device sees one queued buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub(crate) dma_addr: u64,
    /// Coherent bounce memory owned by the engine.
    pub(crate) bounce: bool,
    /// The caller mapped the buffer and keeps ownership of the mapping.
    pub(crate) pre_mapped: bool,
}

/// Make the first `len` bytes of `buf` visible to the device.
pub(crate) fn map_buffer<M: MemOps<Error: std::fmt::Debug>>(
    dma: &dyn DmaOps,
    mem: &M,
    policy: MapPolicy,
    buf: &ClientBuffer,
    len: usize,
    dir: DmaDirection,
) -> Result<Mapping> {
    let bytes = match buf {
        ClientBuffer::Mapped(mapped) => {
            return Ok(Mapping {
                dma_addr: mapped.dma_addr,
                bounce: false,
                pre_mapped: true,
            });
        }
        ClientBuffer::Owned(bytes) => &bytes[..len],
    };

    match policy {
        MapPolicy::Direct => Ok(Mapping {
            dma_addr: dma.map_single(bytes, dir)?,
            bounce: false,
            pre_mapped: false,
        }),
        MapPolicy::Bounce => {
            let addr = dma.alloc_coherent(len)?;
            if dir != DmaDirection::FromDevice {
                if let Err(e) = mem.write(addr, bytes).shm(addr) {
                    dma.free_coherent(addr, len);
                    return Err(e);
                }
            }
            Ok(Mapping {
                dma_addr: addr,
                bounce: true,
                pre_mapped: false,
            })
        }
    }
}

/// Tear down a mapping made by [`map_buffer`], copying device writes of up to
/// `xferd` bytes back into the client buffer.
pub(crate) fn unmap_buffer<M: MemOps<Error: std::fmt::Debug>>(
    dma: &dyn DmaOps,
    mem: &M,
    mapping: Mapping,
    buf: &mut ClientBuffer,
    len: usize,
    xferd: usize,
    dir: DmaDirection,
) {
    if mapping.pre_mapped {
        return;
    }
    let ClientBuffer::Owned(bytes) = buf else {
        log::error!("engine mapping {:#x} on a caller mapped buffer", mapping.dma_addr);
        return;
    };

    if mapping.bounce {
        if dir.device_writes() {
            let n = xferd.min(len).min(bytes.len());
            if let Err(e) = mem.read(mapping.dma_addr, &mut bytes[..n]).shm(mapping.dma_addr) {
                log::error!("bounce copy back failed: {e}");
            }
        }
        dma.free_coherent(mapping.dma_addr, len);
    } else {
        let n = len.min(bytes.len());
        dma.unmap_single(mapping.dma_addr, &mut bytes[..n], dir);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::BytesMut;
    use mhi_testing::{ARENA_BASE, DeviceMemory, SimDma};

    use super::*;
    use crate::device::MhiBuf;

    fn setup() -> (Arc<DeviceMemory>, SimDma) {
        let mem = Arc::new(DeviceMemory::new(ARENA_BASE, 0x10000));
        let dma = SimDma::new(mem.clone());
        (mem, dma)
    }

    #[test]
    fn test_bounce_round_trip() {
        let (mem, dma) = setup();
        let mut buf = ClientBuffer::Owned(BytesMut::zeroed(8));
        let m = map_buffer(
            &dma,
            mem.as_ref(),
            MapPolicy::Bounce,
            &buf,
            8,
            DmaDirection::FromDevice,
        )
        .unwrap();
        assert!(m.bounce);
        assert_eq!(dma.coherent_count(), 1);

        mem.write(m.dma_addr, b"modem").unwrap();
        unmap_buffer(&dma, mem.as_ref(), m, &mut buf, 8, 5, DmaDirection::FromDevice);
        assert_eq!(dma.coherent_count(), 0);
        let ClientBuffer::Owned(bytes) = buf else {
            panic!("buffer changed kind");
        };
        assert_eq!(&bytes[..5], b"modem");
    }

    #[test]
    fn test_direct_mapping_is_released() {
        let (mem, dma) = setup();
        let mut buf = ClientBuffer::Owned(BytesMut::from(&b"uplink"[..]));
        let m = map_buffer(
            &dma,
            mem.as_ref(),
            MapPolicy::Direct,
            &buf,
            6,
            DmaDirection::ToDevice,
        )
        .unwrap();
        let mut seen = [0u8; 6];
        mem.read(m.dma_addr, &mut seen).unwrap();
        assert_eq!(&seen, b"uplink");

        unmap_buffer(&dma, mem.as_ref(), m, &mut buf, 6, 6, DmaDirection::ToDevice);
        assert_eq!(dma.mapped_count(), 0);
    }

    #[test]
    fn test_pre_mapped_is_untouched() {
        let (mem, dma) = setup();
        let buf = ClientBuffer::Mapped(MhiBuf {
            dma_addr: ARENA_BASE + 0x100,
            len: 32,
        });
        let m = map_buffer(
            &dma,
            mem.as_ref(),
            MapPolicy::Direct,
            &buf,
            32,
            DmaDirection::ToDevice,
        )
        .unwrap();
        assert!(m.pre_mapped);
        assert_eq!(m.dma_addr, ARENA_BASE + 0x100);
        assert_eq!(dma.mapped_count(), 0);
    }
}
