//! In-memory doubles for host tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::{Bus, DmaAllocator, DmaBuffer, DmaError, IovaMapper};

/// Register file backed by a map; unwritten registers read as zero.
#[derive(Default)]
pub struct MockBus {
    regs: Mutex<HashMap<usize, u32>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every register written so far, sorted by offset.
    pub fn snapshot(&self) -> Vec<(usize, u32)> {
        let regs = self.regs.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = regs.iter().map(|(k, v)| (*k, *v)).collect();
        out.sort_unstable();
        out
    }
}

impl Bus for MockBus {
    fn read(&self, offset: usize) -> u32 {
        let regs = self.regs.lock().unwrap_or_else(|e| e.into_inner());
        regs.get(&offset).copied().unwrap_or(0)
    }

    fn write(&self, offset: usize, value: u32) {
        let mut regs = self.regs.lock().unwrap_or_else(|e| e.into_inner());
        regs.insert(offset, value);
    }
}

/// Interrupt line that records how often it was switched.
pub struct MockIrq {
    enabled: AtomicBool,
    toggles: AtomicUsize,
}

impl MockIrq {
    pub fn new(enabled: bool) -> Self {
        Self { enabled: AtomicBool::new(enabled), toggles: AtomicUsize::new(0) }
    }

    /// Number of enable/disable transitions observed.
    pub fn toggles(&self) -> usize {
        self.toggles.load(Ordering::SeqCst)
    }
}

impl Default for MockIrq {
    fn default() -> Self {
        Self::new(true)
    }
}

impl crate::IrqLine for MockIrq {
    fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            self.toggles.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Heap-backed DMA buffer.
pub struct VecDmaBuffer {
    iova: u64,
    data: Vec<u8>,
}

impl VecDmaBuffer {
    /// Zero-filled buffer of `len` bytes at `iova`.
    pub fn new(iova: u64, len: usize) -> Self {
        Self { iova, data: vec![0; len] }
    }
}

impl DmaBuffer for VecDmaBuffer {
    fn iova(&self) -> u64 {
        self.iova
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Hands out page-aligned IOVAs from a bump pointer.
pub struct VecDmaAllocator {
    next_iova: AtomicU64,
    remaining: AtomicUsize,
}

impl VecDmaAllocator {
    pub fn new(first_iova: u64) -> Self {
        Self::with_limit(first_iova, usize::MAX)
    }

    /// Fails with `OutOfMemory` after `allocations` successful calls.
    pub fn with_limit(first_iova: u64, allocations: usize) -> Self {
        Self { next_iova: AtomicU64::new(first_iova), remaining: AtomicUsize::new(allocations) }
    }
}

impl DmaAllocator for VecDmaAllocator {
    fn alloc_coherent(&self, size: usize) -> Result<Box<dyn DmaBuffer>, DmaError> {
        if size == 0 {
            return Err(DmaError::ZeroSize);
        }
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| DmaError::OutOfMemory)?;
        let span = (size as u64 + 0xfff) & !0xfff;
        let iova = self.next_iova.fetch_add(span, Ordering::SeqCst);
        Ok(Box::new(VecDmaBuffer::new(iova, size)))
    }
}

/// Maps physical addresses at a fixed offset.
pub struct LinearIovaMapper {
    offset: u64,
}

impl LinearIovaMapper {
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }
}

impl IovaMapper for LinearIovaMapper {
    fn map(&self, paddr: u64, len: usize) -> Result<u64, DmaError> {
        if len == 0 {
            return Err(DmaError::ZeroSize);
        }
        paddr.checked_add(self.offset).ok_or(DmaError::NoIovaSpace)
    }
}
