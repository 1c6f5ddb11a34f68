// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Doorbell messages and the RTKit field encodings carried in them.

use core::fmt;

/// One 128-bit doorbell: payload word plus metadata whose low byte names the endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    pub msg: u64,
    pub info: u64,
}

impl Message {
    pub const fn new(endpoint: EndpointId, msg: u64) -> Self {
        Self { msg, info: endpoint.0 as u64 }
    }

    pub const fn endpoint(&self) -> EndpointId {
        EndpointId(self.info as u8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(pub u8);

impl EndpointId {
    pub const MGMT: Self = Self(0);
    pub const CRASHLOG: Self = Self(1);
    pub const SYSLOG: Self = Self(2);
    pub const DEBUG: Self = Self(3);
    pub const IOREPORT: Self = Self(4);
    /// First endpoint id available to clients.
    pub const FIRST_USER: Self = Self(0x20);

    pub const fn is_system(self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Contiguous bit mask covering bits `lo..=hi`.
pub const fn genmask(hi: u32, lo: u32) -> u64 {
    (u64::MAX >> (63 - hi)) & (u64::MAX << lo)
}

pub const fn bit(n: u32) -> u64 {
    1 << n
}

pub const fn field_get(mask: u64, value: u64) -> u64 {
    (value & mask) >> mask.trailing_zeros()
}

pub const fn field_prep(mask: u64, value: u64) -> u64 {
    (value << mask.trailing_zeros()) & mask
}

/// Message type field shared by every RTKit endpoint.
pub const MSG_TYPE: u64 = genmask(59, 52);

pub const fn msg_type(raw: u64) -> u8 {
    field_get(MSG_TYPE, raw) as u8
}

// Management endpoint.
pub const MGMT_HELLO: u8 = 1;
pub const MGMT_HELLO_REPLY: u8 = 2;
pub const MGMT_HELLO_TAG: u64 = genmask(31, 0);
pub const MGMT_STARTEP: u8 = 5;
pub const MGMT_STARTEP_EP: u64 = genmask(39, 32);
pub const MGMT_STARTEP_FLAG: u64 = bit(1);
pub const MGMT_BOOT_DONE: u8 = 7;
pub const MGMT_BOOT_DONE_UNK: u64 = genmask(15, 0);
pub const MGMT_EPMAP: u8 = 8;
pub const MGMT_EPMAP_LAST: u64 = bit(51);
pub const MGMT_EPMAP_BASE: u64 = genmask(34, 32);
pub const MGMT_EPMAP_BITMAP: u64 = genmask(31, 0);
pub const MGMT_EPMAP_REPLY_MORE: u64 = bit(0);
pub const MGMT_BOOT_DONE2: u8 = 0xb;

/// Wakes a coprocessor whose CPU is already running.
pub const MGMT_WAKEUP: u64 = 0x0060_0000_0000_0020;
/// Shutdown pair sent on the management endpoint, in order.
pub const MGMT_SHUTDOWN: [u64; 2] = [0x00b0_0000_0000_0010, 0x0060_0000_0000_0010];

// Shared memory and system endpoints.
pub const BUFFER_REQUEST: u8 = 1;
pub const BUFFER_REQUEST_SIZE: u64 = genmask(51, 44);
pub const BUFFER_REQUEST_IOVA: u64 = genmask(39, 0);
pub const SYSLOG_LOG: u8 = 5;
pub const SYSLOG_INIT: u8 = 8;
pub const SYSLOG_N_ENTRIES: u64 = genmask(7, 0);
pub const SYSLOG_MSG_SIZE: u64 = genmask(31, 24);
pub const SYSLOG_ENTRY_IDX: u64 = genmask(7, 0);

/// Management messages in decoded form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MgmtMsg {
    Hello { tag: u32 },
    HelloReply { tag: u32 },
    /// Inbound endpoint map fragment.
    EpMap { base: u8, bitmap: u32, last: bool },
    /// Host acknowledgement of an endpoint map fragment.
    EpMapReply { base: u8, last: bool },
    StartEp { endpoint: EndpointId },
    BootDone,
    /// Host acknowledgement of `BootDone`; shares its type with `BootDone2`.
    BootDoneAck,
    BootDone2,
    Unknown(u64),
}

impl MgmtMsg {
    /// Decodes a message received from the coprocessor.
    pub fn decode(raw: u64) -> Self {
        match msg_type(raw) {
            MGMT_HELLO => Self::Hello { tag: field_get(MGMT_HELLO_TAG, raw) as u32 },
            MGMT_EPMAP => Self::EpMap {
                base: field_get(MGMT_EPMAP_BASE, raw) as u8,
                bitmap: field_get(MGMT_EPMAP_BITMAP, raw) as u32,
                last: raw & MGMT_EPMAP_LAST != 0,
            },
            MGMT_BOOT_DONE => Self::BootDone,
            MGMT_BOOT_DONE2 => Self::BootDone2,
            _ => Self::Unknown(raw),
        }
    }

    pub fn encode(self) -> u64 {
        let ty = |t: u8| field_prep(MSG_TYPE, t as u64);
        match self {
            Self::Hello { tag } => ty(MGMT_HELLO) | field_prep(MGMT_HELLO_TAG, tag as u64),
            Self::HelloReply { tag } => {
                ty(MGMT_HELLO_REPLY) | field_prep(MGMT_HELLO_TAG, tag as u64)
            }
            Self::EpMap { base, bitmap, last } => {
                let mut raw = ty(MGMT_EPMAP)
                    | field_prep(MGMT_EPMAP_BASE, base as u64)
                    | field_prep(MGMT_EPMAP_BITMAP, bitmap as u64);
                if last {
                    raw |= MGMT_EPMAP_LAST;
                }
                raw
            }
            Self::EpMapReply { base, last } => {
                let flag = if last { MGMT_EPMAP_LAST } else { MGMT_EPMAP_REPLY_MORE };
                ty(MGMT_EPMAP) | field_prep(MGMT_EPMAP_BASE, base as u64) | flag
            }
            Self::StartEp { endpoint } => {
                ty(MGMT_STARTEP)
                    | field_prep(MGMT_STARTEP_EP, endpoint.0 as u64)
                    | MGMT_STARTEP_FLAG
            }
            Self::BootDone => ty(MGMT_BOOT_DONE),
            Self::BootDoneAck => ty(MGMT_BOOT_DONE2) | field_prep(MGMT_BOOT_DONE_UNK, 0x20),
            Self::BootDone2 => ty(MGMT_BOOT_DONE2),
            Self::Unknown(raw) => raw,
        }
    }
}

/// A coprocessor request for a shared memory buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRequest {
    pub size: usize,
    pub iova: u64,
}

impl BufferRequest {
    pub const fn decode(raw: u64) -> Self {
        Self {
            size: (field_get(BUFFER_REQUEST_SIZE, raw) as usize) << 12,
            iova: field_get(BUFFER_REQUEST_IOVA, raw),
        }
    }

    /// Reply carrying this buffer's size and address; also the request encoding.
    pub const fn encode(self) -> u64 {
        field_prep(MSG_TYPE, BUFFER_REQUEST as u64)
            | field_prep(BUFFER_REQUEST_SIZE, (self.size >> 12) as u64)
            | field_prep(BUFFER_REQUEST_IOVA, self.iova)
    }

    /// Reply that denies the request.
    pub const fn denied() -> u64 {
        Self { size: 0, iova: 0 }.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks() {
        assert_eq!(genmask(59, 52), 0x0ff0_0000_0000_0000);
        assert_eq!(genmask(7, 0), 0xff);
        assert_eq!(genmask(63, 0), u64::MAX);
        assert_eq!(field_get(genmask(34, 32), 0x0000_0005_0000_0000), 5);
    }

    #[test]
    fn hello_reply_echoes_tag() {
        let hello = MgmtMsg::Hello { tag: 0x1234 }.encode();
        assert_eq!(MgmtMsg::decode(hello), MgmtMsg::Hello { tag: 0x1234 });
        let reply = MgmtMsg::HelloReply { tag: 0x1234 }.encode();
        assert_eq!(msg_type(reply), MGMT_HELLO_REPLY);
        assert_eq!(reply & MGMT_HELLO_TAG, 0x1234);
    }

    #[test]
    fn start_endpoint_layout() {
        let raw = MgmtMsg::StartEp { endpoint: EndpointId(0x37) }.encode();
        assert_eq!(raw, 0x0050_0037_0000_0002);
    }

    #[test]
    fn boot_done_ack_layout() {
        assert_eq!(MgmtMsg::BootDoneAck.encode(), 0x00b0_0000_0000_0020);
    }

    #[test]
    fn epmap_reply_flags() {
        let more = MgmtMsg::EpMapReply { base: 2, last: false }.encode();
        assert_eq!(more, 0x0080_0002_0000_0001);
        let last = MgmtMsg::EpMapReply { base: 0, last: true }.encode();
        assert_eq!(last, 0x0088_0000_0000_0000);
    }

    #[test]
    fn buffer_request_fields() {
        let raw = BufferRequest { size: 0x4000, iova: 0x8_0000_1000 }.encode();
        assert_eq!(msg_type(raw), BUFFER_REQUEST);
        assert_eq!(BufferRequest::decode(raw), BufferRequest { size: 0x4000, iova: 0x8_0000_1000 });
        assert_eq!(BufferRequest::decode(BufferRequest::denied()), BufferRequest { size: 0, iova: 0 });
    }

    #[test]
    fn endpoint_classes() {
        assert!(EndpointId::IOREPORT.is_system());
        assert!(EndpointId(0x1f).is_system());
        assert!(!EndpointId(0x37).is_system());
        assert_eq!(Message::new(EndpointId(0x37), 5).endpoint(), EndpointId(0x37));
    }
}
