// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Memory descriptors handed to the coprocessor.

use core::fmt;
use core::num::NonZeroU32;

use nexus_hal::{DmaBuffer, IovaMapper};

use crate::{Error, Result};

/// Default number of memory descriptors.
pub const MAX_MAPPINGS: usize = 128;

/// Descriptor id as reported to the coprocessor. Zero means "none".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId(NonZeroU32);

impl MappingId {
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

/// What the coprocessor is told about a new mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingGrant {
    pub id: MappingId,
    pub iova: u64,
    /// Page-rounded size.
    pub size: u64,
}

pub enum Backing {
    /// Host memory allocated on the coprocessor's behalf.
    Dma(Box<dyn DmaBuffer>),
    /// Physical range owned elsewhere.
    Physical { paddr: u64 },
}

pub struct MemoryMapping {
    id: MappingId,
    iova: u64,
    len: usize,
    backing: Backing,
}

impl MemoryMapping {
    pub fn id(&self) -> MappingId {
        self.id
    }

    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn paddr(&self) -> u64 {
        match &self.backing {
            Backing::Dma(buffer) => buffer.paddr(),
            Backing::Physical { paddr } => *paddr,
        }
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }
}

impl fmt::Debug for MemoryMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMapping")
            .field("id", &self.id.get())
            .field("iova", &format_args!("{:#x}", self.iova))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

/// Fixed-capacity table; ids start at 1 and are never reused.
pub struct MappingTable {
    entries: Vec<MemoryMapping>,
    capacity: usize,
}

impl MappingTable {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Vec::new(), capacity }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn insert(&mut self, iova: u64, len: usize, backing: Backing) -> Result<MappingId> {
        if self.is_full() {
            return Err(Error::MappingTableExhausted);
        }
        let next = u32::try_from(self.entries.len() + 1).map_err(|_| Error::MappingTableExhausted)?;
        let id = MappingId(NonZeroU32::new(next).ok_or(Error::MappingTableExhausted)?);
        self.entries.push(MemoryMapping { id, iova, len, backing });
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<&MemoryMapping> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryMapping> {
        self.entries.iter()
    }

    /// Maps a recorded range into another consumer's address space.
    pub fn remap(&self, id: u32, mapper: &dyn IovaMapper) -> Result<u64> {
        let mapping = self.get(id).ok_or(Error::UnknownMapping(id))?;
        Ok(mapper.map(mapping.paddr(), mapping.len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_hal::mock::{LinearIovaMapper, VecDmaBuffer};

    #[test]
    fn ids_start_at_one_and_stop_at_capacity() {
        let mut table = MappingTable::new(2);
        let a = table.insert(0x1000, 0x1000, Backing::Physical { paddr: 0x8000 }).expect("a");
        let b = table
            .insert(0x2000, 0x2000, Backing::Dma(Box::new(VecDmaBuffer::new(0x2000, 0x2000))))
            .expect("b");
        assert_eq!((a.get(), b.get()), (1, 2));
        assert_eq!(
            table.insert(0x3000, 0x1000, Backing::Physical { paddr: 0 }),
            Err(Error::MappingTableExhausted)
        );
        assert_eq!(table.get(0).map(MemoryMapping::id), None);
        assert_eq!(table.get(2).map(MemoryMapping::iova), Some(0x2000));
        assert!(table.get(3).is_none());
    }

    #[test]
    fn remap_uses_the_backing_address() {
        let mut table = MappingTable::new(4);
        table.insert(0x1000, 0x4000, Backing::Physical { paddr: 0x9_0000 }).expect("insert");
        table
            .insert(0x5000, 0x1000, Backing::Dma(Box::new(VecDmaBuffer::new(0x5000, 0x1000))))
            .expect("insert");

        let mapper = LinearIovaMapper::new(0x100_0000);
        assert_eq!(table.remap(1, &mapper), Ok(0x109_0000));
        assert_eq!(table.remap(2, &mapper), Ok(0x100_5000));
        assert_eq!(table.remap(7, &mapper), Err(Error::UnknownMapping(7)));
    }
}
