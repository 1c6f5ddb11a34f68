// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared memory buffer negotiation.
//!
//! A system endpoint asks for a buffer with a buffer request. The backend
//! chosen for the mailbox variant either allocates host memory (optionally
//! allow-listing it in the SART) or validates a coprocessor-owned range
//! against the I/O window. All reads go through [`ShmemNegotiator::read`]
//! so callers never care which kind of memory they are reading.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, error, warn};
use nexus_hal::{Bus, DmaAllocator, DmaBuffer, MmioWindow};
use parking_lot::Mutex;

use crate::msg::{BufferRequest, EndpointId};
use crate::sart::SartAllowList;
use crate::{Error, Result};

pub enum Storage {
    Host(Box<dyn DmaBuffer>),
    /// Offset of the buffer inside the I/O window.
    Io { window_offset: u64 },
}

pub struct SharedBuffer {
    pub iova: u64,
    pub size: usize,
    storage: Storage,
}

impl SharedBuffer {
    pub fn new(iova: u64, size: usize, storage: Storage) -> Self {
        Self { iova, size, storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfBounds { offset, len, size: self.size }),
        }
    }
}

pub trait ShmemBackend: Send + Sync {
    /// Produces the buffer for a request or explains why not.
    fn provide(&self, request: BufferRequest) -> Result<SharedBuffer>;

    /// Copies `out.len()` bytes at `offset` of `buffer` into `out`.
    fn read(&self, buffer: &SharedBuffer, offset: usize, out: &mut [u8]) -> Result<()>;
}

fn copy_from_host(buffer: &SharedBuffer, offset: usize, out: &mut [u8]) -> Result<()> {
    buffer.check(offset, out.len())?;
    match &buffer.storage {
        Storage::Host(mem) => {
            let src = mem.as_slice().get(offset..offset + out.len()).ok_or(Error::OutOfBounds {
                offset,
                len: out.len(),
                size: mem.len(),
            })?;
            out.copy_from_slice(src);
            Ok(())
        }
        Storage::Io { .. } => Err(Error::MissingResource("host memory")),
    }
}

/// Host-allocated coherent memory.
pub struct CoherentDma {
    dma: Arc<dyn DmaAllocator + Send + Sync>,
}

impl CoherentDma {
    pub fn new(dma: Arc<dyn DmaAllocator + Send + Sync>) -> Self {
        Self { dma }
    }
}

impl ShmemBackend for CoherentDma {
    fn provide(&self, request: BufferRequest) -> Result<SharedBuffer> {
        let mem = self.dma.alloc_coherent(request.size)?;
        Ok(SharedBuffer::new(mem.iova(), request.size, Storage::Host(mem)))
    }

    fn read(&self, buffer: &SharedBuffer, offset: usize, out: &mut [u8]) -> Result<()> {
        copy_from_host(buffer, offset, out)
    }
}

/// Coherent memory additionally opened up in the SART.
pub struct SartDma {
    dma: CoherentDma,
    sart: Mutex<SartAllowList>,
}

impl SartDma {
    pub fn new(dma: Arc<dyn DmaAllocator + Send + Sync>, sart: SartAllowList) -> Self {
        Self { dma: CoherentDma::new(dma), sart: Mutex::new(sart) }
    }

    pub fn allow_list(&self) -> Vec<(u64, usize)> {
        self.sart.lock().entries()
    }
}

impl ShmemBackend for SartDma {
    fn provide(&self, request: BufferRequest) -> Result<SharedBuffer> {
        let buffer = self.dma.provide(request)?;
        let paddr = match &buffer.storage {
            Storage::Host(mem) => mem.paddr(),
            Storage::Io { .. } => buffer.iova,
        };
        // The coprocessor still gets its buffer; its DMA will fault.
        if let Err(err) = self.sart.lock().allow(paddr, buffer.size) {
            warn!("asc-mailbox: SART rejected {paddr:#x}+{:#x}: {err}", buffer.size);
        }
        Ok(buffer)
    }

    fn read(&self, buffer: &SharedBuffer, offset: usize, out: &mut [u8]) -> Result<()> {
        copy_from_host(buffer, offset, out)
    }
}

/// Coprocessor-owned memory reached through an MMIO window.
pub struct IoMapped {
    window: MmioWindow,
    bus: Box<dyn Bus + Send + Sync>,
}

impl IoMapped {
    /// `bus` addresses the window; offset 0 is `window.base()`.
    pub fn new(window: MmioWindow, bus: Box<dyn Bus + Send + Sync>) -> Self {
        Self { window, bus }
    }
}

impl ShmemBackend for IoMapped {
    fn provide(&self, request: BufferRequest) -> Result<SharedBuffer> {
        let BufferRequest { size, iova } = request;
        if !self.window.contains_range(iova, size as u64) {
            return Err(Error::OutOfWindow { iova, size });
        }
        let window_offset = iova - self.window.base();
        Ok(SharedBuffer::new(iova, size, Storage::Io { window_offset }))
    }

    /// 32-bit accesses only; partial words at either end are masked out.
    fn read(&self, buffer: &SharedBuffer, offset: usize, out: &mut [u8]) -> Result<()> {
        buffer.check(offset, out.len())?;
        let Storage::Io { window_offset } = buffer.storage else {
            return Err(Error::MissingResource("I/O window"));
        };
        let start = window_offset as usize + offset;
        let end = start + out.len();
        let mut word_addr = start & !3;
        while word_addr < end {
            let word = self.bus.read(word_addr).to_le_bytes();
            for (i, byte) in word.iter().enumerate() {
                let addr = word_addr + i;
                if (start..end).contains(&addr) {
                    out[addr - start] = *byte;
                }
            }
            word_addr += 4;
        }
        Ok(())
    }
}

/// Owns every negotiated buffer, keyed by endpoint.
pub struct ShmemNegotiator {
    backend: Box<dyn ShmemBackend>,
    buffers: Mutex<BTreeMap<EndpointId, SharedBuffer>>,
}

impl ShmemNegotiator {
    pub fn new(backend: Box<dyn ShmemBackend>) -> Self {
        Self { backend, buffers: Mutex::new(BTreeMap::new()) }
    }

    /// Handles a raw buffer request from `endpoint` and returns the reply to send, if any.
    ///
    /// A repeated request returns the existing mapping. Allocation failures
    /// send nothing; out-of-window ranges get a zero-size, zero-address reply.
    pub fn handle_request(&self, endpoint: EndpointId, raw: u64) -> Option<u64> {
        let request = BufferRequest::decode(raw);
        let mut buffers = self.buffers.lock();
        if let Some(existing) = buffers.get(&endpoint) {
            debug!("asc-mailbox: endpoint {endpoint} already owns {:#x}+{:#x}", existing.iova, existing.size);
            return Some(BufferRequest { size: existing.size, iova: existing.iova }.encode());
        }
        match self.backend.provide(request) {
            Ok(buffer) => {
                debug!("asc-mailbox: endpoint {endpoint} buffer {:#x}+{:#x}", buffer.iova, buffer.size);
                let reply = BufferRequest { size: buffer.size, iova: buffer.iova }.encode();
                buffers.insert(endpoint, buffer);
                Some(reply)
            }
            Err(err @ Error::OutOfWindow { .. }) => {
                error!("asc-mailbox: endpoint {endpoint}: {err}; denying");
                Some(BufferRequest::denied())
            }
            Err(err) => {
                warn!("asc-mailbox: endpoint {endpoint} buffer request {raw:#018x} failed: {err}");
                None
            }
        }
    }

    pub fn has_buffer(&self, endpoint: EndpointId) -> bool {
        self.buffers.lock().contains_key(&endpoint)
    }

    pub fn buffer_size(&self, endpoint: EndpointId) -> Option<usize> {
        self.buffers.lock().get(&endpoint).map(|b| b.size)
    }

    pub fn read(&self, endpoint: EndpointId, offset: usize, out: &mut [u8]) -> Result<()> {
        let buffers = self.buffers.lock();
        let buffer = buffers.get(&endpoint).ok_or(Error::NoBuffer(endpoint))?;
        self.backend.read(buffer, offset, out)
    }

    /// Writes into a host-memory buffer. Test and diagnostics use only.
    pub fn write_host(&self, endpoint: EndpointId, offset: usize, data: &[u8]) -> Result<()> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.get_mut(&endpoint).ok_or(Error::NoBuffer(endpoint))?;
        buffer.check(offset, data.len())?;
        match &mut buffer.storage {
            Storage::Host(mem) => {
                mem.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
            Storage::Io { .. } => Err(Error::MissingResource("host memory")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{sart_config, SART_MAX_ENTRIES};
    use nexus_hal::mock::{MockBus, VecDmaAllocator};
    use proptest::prelude::*;

    const WINDOW: MmioWindow = MmioWindow::new(0x2_1000_0000, 0x8_0000);

    fn iomem() -> (ShmemNegotiator, Arc<MockBus>) {
        let bus = Arc::new(MockBus::new());
        let backend = IoMapped::new(WINDOW, Box::new(bus.clone()));
        (ShmemNegotiator::new(Box::new(backend)), bus)
    }

    #[test]
    fn coherent_request_is_idempotent() {
        let negotiator =
            ShmemNegotiator::new(Box::new(CoherentDma::new(Arc::new(VecDmaAllocator::new(0x9000_0000)))));
        let ep = EndpointId::SYSLOG;
        let raw = BufferRequest { size: 0x2000, iova: 0 }.encode();
        let reply = negotiator.handle_request(ep, raw).expect("reply");
        assert_eq!(BufferRequest::decode(reply), BufferRequest { size: 0x2000, iova: 0x9000_0000 });
        assert_eq!(negotiator.handle_request(ep, raw), Some(reply));
        assert_eq!(negotiator.buffer_size(ep), Some(0x2000));
    }

    #[test]
    fn allocation_failure_sends_nothing() {
        let negotiator =
            ShmemNegotiator::new(Box::new(CoherentDma::new(Arc::new(VecDmaAllocator::with_limit(0, 0)))));
        let raw = BufferRequest { size: 0x1000, iova: 0 }.encode();
        assert_eq!(negotiator.handle_request(EndpointId::IOREPORT, raw), None);
        assert!(!negotiator.has_buffer(EndpointId::IOREPORT));
    }

    #[test]
    fn host_reads_copy() {
        let negotiator =
            ShmemNegotiator::new(Box::new(CoherentDma::new(Arc::new(VecDmaAllocator::new(0x1000)))));
        let ep = EndpointId::CRASHLOG;
        negotiator.handle_request(ep, BufferRequest { size: 0x1000, iova: 0 }.encode());
        negotiator.write_host(ep, 0x10, b"rtkit").expect("write");
        let mut out = [0u8; 5];
        negotiator.read(ep, 0x10, &mut out).expect("read");
        assert_eq!(&out, b"rtkit");
        assert!(matches!(negotiator.read(ep, 0xffe, &mut out), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn sart_backend_allow_lists_buffers() {
        let sart_bus = Arc::new(MockBus::new());
        let backend = SartDma::new(
            Arc::new(VecDmaAllocator::new(0x8_0000_0000)),
            SartAllowList::new(Box::new(sart_bus.clone())),
        );
        let negotiator = ShmemNegotiator::new(Box::new(backend));
        let reply = negotiator
            .handle_request(EndpointId::SYSLOG, BufferRequest { size: 0x4000, iova: 0 }.encode())
            .expect("reply");
        assert_eq!(BufferRequest::decode(reply).iova, 0x8_0000_0000);
        assert_eq!(sart_bus.read(sart_config(0)), 0xff00_0004);
    }

    #[test]
    fn full_allow_list_still_replies() {
        let sart = SartAllowList::new(Box::new(MockBus::new()));
        for i in 0..SART_MAX_ENTRIES as u64 {
            sart.allow(0x10_0000 + i * 0x1000, 0x1000).expect("free entry");
        }
        let backend = SartDma::new(Arc::new(VecDmaAllocator::new(0x8_0000_0000)), sart);
        let negotiator = ShmemNegotiator::new(Box::new(backend));
        let reply = negotiator
            .handle_request(EndpointId::SYSLOG, BufferRequest { size: 0x4000, iova: 0 }.encode())
            .expect("reply despite a full allow-list");
        assert_eq!(
            BufferRequest::decode(reply),
            BufferRequest { size: 0x4000, iova: 0x8_0000_0000 }
        );
        assert!(negotiator.has_buffer(EndpointId::SYSLOG));
    }

    #[test]
    fn iomem_window_exact_and_outside() {
        let (negotiator, _bus) = iomem();
        let exact = BufferRequest { size: 0x8_0000, iova: WINDOW.base() }.encode();
        assert_eq!(negotiator.handle_request(EndpointId::IOREPORT, exact), Some(exact));

        let (negotiator, _bus) = iomem();
        let outside = BufferRequest { size: 0x2000, iova: WINDOW.end() - 0x1000 }.encode();
        assert_eq!(
            negotiator.handle_request(EndpointId::IOREPORT, outside),
            Some(BufferRequest::denied())
        );
        assert!(!negotiator.has_buffer(EndpointId::IOREPORT));
    }

    #[test]
    fn iomem_reads_are_word_granular() {
        let (negotiator, bus) = iomem();
        let ep = EndpointId::SYSLOG;
        negotiator.handle_request(ep, BufferRequest { size: 0x1000, iova: WINDOW.base() + 0x2000 }.encode());
        bus.write(0x2000, u32::from_le_bytes(*b"abcd"));
        bus.write(0x2004, u32::from_le_bytes(*b"efgh"));
        let mut out = [0u8; 5];
        negotiator.read(ep, 1, &mut out).expect("read");
        assert_eq!(&out, b"bcdef");
    }

    proptest! {
        #[test]
        fn iomem_accepts_only_contained_ranges(pages in 0u64..0x100, offset in 0u64..0x10_0000) {
            let (negotiator, _bus) = iomem();
            let iova = WINDOW.base() - 0x4_0000 + offset;
            let size = (pages as usize) << 12;
            let reply = negotiator
                .handle_request(EndpointId::IOREPORT, BufferRequest { size, iova }.encode())
                .expect("iomem always replies");
            let contained = iova >= WINDOW.base() && iova + size as u64 <= WINDOW.end();
            if contained {
                prop_assert_eq!(BufferRequest::decode(reply), BufferRequest { size, iova });
            } else {
                prop_assert_eq!(reply, BufferRequest::denied());
            }
        }
    }
}
