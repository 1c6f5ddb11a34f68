// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Packed little-endian payloads of the memory callbacks.

use static_assertions::const_assert_eq;

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.bytes.len() < N {
            return None;
        }
        let (head, rest) = self.bytes.split_at(N);
        self.bytes = rest;
        head.try_into().ok()
    }

    fn u32(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take().map(u64::from_le_bytes)
    }
}

/// D451 request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocateBufferRequest {
    pub unk0: u32,
    pub size: u64,
    pub unk2: u32,
    pub paddr_null: bool,
    pub dva_null: bool,
    pub dva_size_null: bool,
}

impl AllocateBufferRequest {
    pub const LEN: usize = 20;

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader { bytes };
        let unk0 = r.u32()?;
        let size = r.u64()?;
        let unk2 = r.u32()?;
        let [paddr_null, dva_null, dva_size_null, _pad] = r.take::<4>()?;
        Some(Self {
            unk0,
            size,
            unk2,
            paddr_null: paddr_null != 0,
            dva_null: dva_null != 0,
            dva_size_null: dva_size_null != 0,
        })
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.unk0.to_le_bytes());
        out[4..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..16].copy_from_slice(&self.unk2.to_le_bytes());
        out[16] = self.paddr_null.into();
        out[17] = self.dva_null.into();
        out[18] = self.dva_size_null.into();
        out
    }
}

/// D451 response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocateBufferResponse {
    pub paddr: u64,
    pub dva: u64,
    pub dva_size: u64,
    pub mem_desc_id: u32,
}

impl AllocateBufferResponse {
    pub const LEN: usize = 28;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..8].copy_from_slice(&self.paddr.to_le_bytes());
        out[8..16].copy_from_slice(&self.dva.to_le_bytes());
        out[16..24].copy_from_slice(&self.dva_size.to_le_bytes());
        out[24..28].copy_from_slice(&self.mem_desc_id.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader { bytes };
        Some(Self { paddr: r.u64()?, dva: r.u64()?, dva_size: r.u64()?, mem_desc_id: r.u32()? })
    }
}

/// D452 request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapPhysicalRequest {
    pub paddr: u64,
    pub size: u64,
    pub flags: u32,
    pub dva_null: bool,
    pub dva_size_null: bool,
}

impl MapPhysicalRequest {
    pub const LEN: usize = 24;

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader { bytes };
        let paddr = r.u64()?;
        let size = r.u64()?;
        let flags = r.u32()?;
        let [dva_null, dva_size_null, _, _] = r.take::<4>()?;
        Some(Self { paddr, size, flags, dva_null: dva_null != 0, dva_size_null: dva_size_null != 0 })
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..8].copy_from_slice(&self.paddr.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..20].copy_from_slice(&self.flags.to_le_bytes());
        out[20] = self.dva_null.into();
        out[21] = self.dva_size_null.into();
        out
    }
}

/// D452 response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapPhysicalResponse {
    pub dva: u64,
    pub dva_size: u64,
    pub mem_desc_id: u32,
}

impl MapPhysicalResponse {
    pub const LEN: usize = 20;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..8].copy_from_slice(&self.dva.to_le_bytes());
        out[8..16].copy_from_slice(&self.dva_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.mem_desc_id.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader { bytes };
        Some(Self { dva: r.u64()?, dva_size: r.u64()?, mem_desc_id: r.u32()? })
    }
}

const_assert_eq!(AllocateBufferRequest::LEN, 4 + 8 + 4 + 4);
const_assert_eq!(AllocateBufferResponse::LEN, 3 * 8 + 4);
const_assert_eq!(MapPhysicalRequest::LEN, 8 + 8 + 4 + 4);
const_assert_eq!(MapPhysicalResponse::LEN, 2 * 8 + 4);
