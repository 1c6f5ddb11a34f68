// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared memory arena. All packet placement goes through [`place`].

use core::ops::Range;

use nexus_hal::DmaBuffer;

use crate::context::TX_REGION_SIZE;
use crate::wire::{DCP_SHMEM_SIZE, PACKET_ALIGNMENT};
use crate::{Error, Result};

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Region-relative slot for a packet of `len` bytes placed after `prev_end`.
///
/// Slots start where the previous frame ended and end on the next 64-byte
/// boundary, so consecutive slots are aligned and strictly increasing.
pub fn place(prev_end: usize, len: usize) -> Result<Range<usize>> {
    let end = prev_end
        .checked_add(len)
        .map(|end| align_up(end, PACKET_ALIGNMENT))
        .filter(|end| *end <= TX_REGION_SIZE)
        .ok_or(Error::PacketTooLarge(len))?;
    Ok(prev_end..end)
}

/// The 1 MiB buffer shared with the coprocessor.
pub struct ShmemArena {
    buffer: Box<dyn DmaBuffer>,
}

impl ShmemArena {
    pub fn new(buffer: Box<dyn DmaBuffer>) -> Result<Self> {
        if buffer.len() < DCP_SHMEM_SIZE {
            return Err(Error::OutOfBounds { offset: 0, len: DCP_SHMEM_SIZE });
        }
        Ok(Self { buffer })
    }

    pub fn iova(&self) -> u64 {
        self.buffer.iova()
    }

    fn range(offset: usize, len: usize) -> Result<Range<usize>> {
        offset
            .checked_add(len)
            .filter(|end| *end <= DCP_SHMEM_SIZE)
            .map(|end| offset..end)
            .ok_or(Error::OutOfBounds { offset, len })
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let range = Self::range(offset, len)?;
        Ok(&self.buffer.as_slice()[range])
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let range = Self::range(offset, data.len())?;
        self.buffer.as_mut_slice()[range].copy_from_slice(data);
        Ok(())
    }

    pub fn zero(&mut self, offset: usize, len: usize) -> Result<()> {
        let range = Self::range(offset, len)?;
        self.buffer.as_mut_slice()[range].fill(0);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer.as_slice()[..DCP_SHMEM_SIZE]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut_slice()[..DCP_SHMEM_SIZE]
    }
}
