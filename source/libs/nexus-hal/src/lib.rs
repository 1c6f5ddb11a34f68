#![cfg_attr(not(any(test, feature = "mock")), no_std)]

//! Hardware access traits shared by user drivers.
//!
//! Drivers are written against these traits so the same code runs on real
//! MMIO apertures and on the in-memory doubles in [`mock`].

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;

/// Register access for one MMIO aperture. Offsets are relative to its base.
pub trait Bus {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);

    /// 64-bit read. The default splits into two 32-bit accesses, low word first.
    fn read_u64(&self, offset: usize) -> u64 {
        let lo = self.read(offset) as u64;
        let hi = self.read(offset + 4) as u64;
        lo | (hi << 32)
    }

    /// 64-bit write. The default splits into two 32-bit accesses, low word first.
    fn write_u64(&self, offset: usize, value: u64) {
        self.write(offset, value as u32);
        self.write(offset + 4, (value >> 32) as u32);
    }
}

impl<T: Bus + ?Sized> Bus for Arc<T> {
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        (**self).read_u64(offset)
    }

    fn write_u64(&self, offset: usize, value: u64) {
        (**self).write_u64(offset, value)
    }
}

/// A maskable interrupt line.
pub trait IrqLine {
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
}

impl<T: IrqLine + ?Sized> IrqLine for Arc<T> {
    fn set_enabled(&self, enabled: bool) {
        (**self).set_enabled(enabled)
    }

    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }
}

/// Memory shared with a device, addressed by the device through `iova`.
pub trait DmaBuffer: Send {
    /// Address of the buffer in the device's IOVA space.
    fn iova(&self) -> u64;

    /// Physical address backing the buffer.
    fn paddr(&self) -> u64 {
        self.iova()
    }

    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of coherent DMA memory for one device.
pub trait DmaAllocator {
    fn alloc_coherent(&self, size: usize) -> Result<Box<dyn DmaBuffer>, DmaError>;
}

/// Maps physical ranges into a device's IOVA space.
pub trait IovaMapper {
    fn map(&self, paddr: u64, len: usize) -> Result<u64, DmaError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaError {
    /// Zero-length allocation or mapping.
    ZeroSize,
    OutOfMemory,
    /// The IOVA space cannot hold the requested range.
    NoIovaSpace,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "zero-sized DMA request"),
            Self::OutOfMemory => write!(f, "out of DMA memory"),
            Self::NoIovaSpace => write!(f, "IOVA space exhausted"),
        }
    }
}

/// A device-visible address window `[base, base + size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioWindow {
    base: u64,
    size: u64,
}

impl MmioWindow {
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    pub const fn base(&self) -> u64 {
        self.base
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    /// One past the last address, saturating at the top of the address space.
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    /// Returns true when `[addr, addr + len)` lies entirely inside the window.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.end(),
            None => false,
        }
    }

    /// Offset of `addr` from the window base, if `addr` lies inside.
    pub fn offset_of(&self, addr: u64) -> Option<u64> {
        if addr >= self.base && addr < self.end() {
            Some(addr - self.base)
        } else {
            None
        }
    }
}

#[cfg(any(test, feature = "mock"))]
pub mod mock;
