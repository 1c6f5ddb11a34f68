// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! DCP doorbell encodings and the packet header written to shared memory.

use core::fmt;

use mailbox_asc::msg::{bit, field_get, field_prep, genmask};
use mailbox_asc::EndpointId;
use static_assertions::const_assert_eq;

/// Endpoint the DCP firmware listens on.
pub const DCP_ENDPOINT: EndpointId = EndpointId(0x37);
/// Size of the shared memory region announced with set-shmem.
pub const DCP_SHMEM_SIZE: usize = 0x10_0000;
pub const PACKET_ALIGNMENT: usize = 0x40;
pub const PACKET_HEADER_LEN: usize = 12;

const_assert_eq!(PACKET_HEADER_LEN, 3 * core::mem::size_of::<u32>());
const_assert_eq!(DCP_SHMEM_SIZE % PACKET_ALIGNMENT, 0);

const TYPE: u64 = genmask(1, 0);
const ACK: u64 = bit(6);
const CONTEXT: u64 = genmask(11, 8);
const OFFSET: u64 = genmask(31, 16);
const LENGTH: u64 = genmask(63, 32);

const SET_SHMEM_FLAG: u64 = genmask(7, 4);
const SET_SHMEM_FLAG_VALUE: u64 = 4;
const DVA: u64 = genmask(63, 16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Host to coprocessor: shared memory address.
    SetShmem,
    /// Coprocessor to host: shared memory accepted.
    Initialized,
    /// Call, callback or ack.
    Message,
}

pub const fn message_type(raw: u64) -> Option<MessageType> {
    match field_get(TYPE, raw) {
        0 => Some(MessageType::SetShmem),
        1 => Some(MessageType::Initialized),
        2 => Some(MessageType::Message),
        _ => None,
    }
}

/// Announces the shared memory region at `dva`.
pub const fn set_shmem(dva: u64) -> u64 {
    field_prep(SET_SHMEM_FLAG, SET_SHMEM_FLAG_VALUE) | field_prep(DVA, dva)
}

pub const fn set_shmem_dva(raw: u64) -> u64 {
    field_get(DVA, raw)
}

pub const fn initialized() -> u64 {
    field_prep(TYPE, 1)
}

/// Call, callback or ack doorbell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Doorbell {
    pub context: u8,
    pub offset: u16,
    pub length: u32,
    pub ack: bool,
}

impl Doorbell {
    pub const fn ack(context: u8) -> Self {
        Self { context, offset: 0, length: 0, ack: true }
    }

    pub const fn encode(self) -> u64 {
        let ack = if self.ack { ACK } else { 0 };
        field_prep(TYPE, 2)
            | ack
            | field_prep(CONTEXT, self.context as u64)
            | field_prep(OFFSET, self.offset as u64)
            | field_prep(LENGTH, self.length as u64)
    }

    pub const fn decode(raw: u64) -> Self {
        Self {
            context: field_get(CONTEXT, raw) as u8,
            offset: field_get(OFFSET, raw) as u16,
            length: field_get(LENGTH, raw) as u32,
            ack: raw & ACK != 0,
        }
    }
}

/// Four-character method or callback tag, held in reading order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag([u8; 4]);

impl Tag {
    pub const fn new(name: &[u8; 4]) -> Self {
        Self(*name)
    }

    /// The tag as stored in a packet header.
    pub const fn to_wire(self) -> [u8; 4] {
        let [a, b, c, d] = self.0;
        [d, c, b, a]
    }

    pub const fn from_wire(raw: [u8; 4]) -> Self {
        let [a, b, c, d] = raw;
        Self([d, c, b, a])
    }

    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Callback number of a `D` + three decimal digits tag.
    pub fn callback_id(self) -> Option<u16> {
        let [prefix, digits @ ..] = self.0;
        if prefix != b'D' || !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        Some(digits.iter().fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({self})")
    }
}

/// Header preceding every packet: reversed tag, input length, output length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub tag: Tag,
    pub in_len: u32,
    pub out_len: u32,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut out = [0u8; PACKET_HEADER_LEN];
        out[0..4].copy_from_slice(&self.tag.to_wire());
        out[4..8].copy_from_slice(&self.in_len.to_le_bytes());
        out[8..12].copy_from_slice(&self.out_len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; PACKET_HEADER_LEN] = bytes.get(..PACKET_HEADER_LEN)?.try_into().ok()?;
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Some(Self {
            tag: Tag::from_wire([bytes[0], bytes[1], bytes[2], bytes[3]]),
            in_len: word(4),
            out_len: word(8),
        })
    }

    /// Header plus both payloads.
    pub const fn packet_len(&self) -> usize {
        PACKET_HEADER_LEN + self.in_len as usize + self.out_len as usize
    }
}
