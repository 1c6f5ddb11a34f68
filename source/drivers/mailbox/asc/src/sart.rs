// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! SART: the coprocessor's 16-entry DMA allow-list.

use log::debug;
use nexus_hal::Bus;

use crate::regs::{
    sart_config, sart_paddr, SART_FLAGS_ALLOW, SART_FLAGS_SHIFT, SART_GRANULE_SHIFT,
    SART_MAX_ENTRIES, SART_SIZE_MASK,
};
use crate::{Error, Result};

const GRANULE_MASK: u64 = (1 << SART_GRANULE_SHIFT) - 1;

pub struct SartAllowList {
    regs: Box<dyn Bus + Send + Sync>,
}

impl SartAllowList {
    pub fn new(regs: Box<dyn Bus + Send + Sync>) -> Self {
        Self { regs }
    }

    /// Allows coprocessor DMA to `[paddr, paddr + size)`. Returns the entry index used.
    pub fn allow(&self, paddr: u64, size: usize) -> Result<usize> {
        let granules = (size as u64) >> SART_GRANULE_SHIFT;
        if paddr & GRANULE_MASK != 0
            || size as u64 & GRANULE_MASK != 0
            || granules > SART_SIZE_MASK as u64
        {
            return Err(Error::Misaligned { iova: paddr, size });
        }

        for idx in 0..SART_MAX_ENTRIES {
            if self.regs.read(sart_config(idx)) >> SART_FLAGS_SHIFT != 0 {
                continue;
            }
            let config = (SART_FLAGS_ALLOW << SART_FLAGS_SHIFT) | granules as u32;
            self.regs.write(sart_paddr(idx), (paddr >> SART_GRANULE_SHIFT) as u32);
            self.regs.write(sart_config(idx), config);
            debug!("asc-mailbox: SART entry {idx} allows {paddr:#x}+{size:#x}");
            return Ok(idx);
        }
        Err(Error::AllowListExhausted)
    }

    /// Programmed entries as `(paddr, size)`.
    pub fn entries(&self) -> Vec<(u64, usize)> {
        (0..SART_MAX_ENTRIES)
            .filter_map(|idx| {
                let config = self.regs.read(sart_config(idx));
                if config >> SART_FLAGS_SHIFT == 0 {
                    return None;
                }
                let size = ((config & SART_SIZE_MASK) as usize) << SART_GRANULE_SHIFT;
                let paddr = (self.regs.read(sart_paddr(idx)) as u64) << SART_GRANULE_SHIFT;
                Some((paddr, size))
            })
            .collect()
    }
}
