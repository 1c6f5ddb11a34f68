// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! ASC mailbox and SART register layout.

use bitflags::bitflags;

// Mailbox register offsets (bytes).
pub const CPU_CONTROL: usize = 0x44;
pub const A2I_CONTROL: usize = 0x8110;
pub const I2A_CONTROL: usize = 0x8114;
pub const A2I_MBOX_DATA: usize = 0x8800;
pub const A2I_MBOX_INFO: usize = 0x8808;
pub const I2A_MBOX_DATA: usize = 0x8830;
pub const I2A_MBOX_INFO: usize = 0x8838;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CpuControl: u32 {
        const RUN = 1 << 4;
    }
}

bitflags! {
    /// Status bits shared by the A2I and I2A control registers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FifoControl: u32 {
        const FULL = 1 << 16;
        const EMPTY = 1 << 17;
    }
}

pub const SART_MAX_ENTRIES: usize = 16;
pub const SART_FLAGS_ALLOW: u32 = 0xff;
pub const SART_FLAGS_SHIFT: u32 = 24;
pub const SART_SIZE_MASK: u32 = 0x00ff_ffff;
/// Sizes and addresses are programmed in 4 KiB units.
pub const SART_GRANULE_SHIFT: u32 = 12;

pub const fn sart_config(idx: usize) -> usize {
    4 * idx
}

pub const fn sart_paddr(idx: usize) -> usize {
    0x40 + 4 * idx
}
