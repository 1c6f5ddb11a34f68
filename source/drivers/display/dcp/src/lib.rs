// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: DCP (display coprocessor) RPC layer over the ASC mailbox
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable (bring-up)
//! TEST_COVERAGE: Unit + property tests per module, tests/rpc.rs end-to-end
//!
//! Calls and callbacks travel as packets in a 1 MiB shared memory region;
//! the mailbox only carries doorbells naming a context, an offset and a
//! length. Each context pair keeps a LIFO stack of outstanding calls so the
//! coprocessor may call back into the host while a host call is pending.
//!
//! PUBLIC API:
//!   - Dcp: attach(), start(), push(), ack(), call_sync(), is_ready()
//!   - DcpCore: push(), call(), ack(), depths, mapping table
//!   - CallbackTable / CallbackHandler: tag to handler dispatch
//!   - BootStep: bootstrap state machine
//!   - wire: doorbell and packet header encodings
//!
//! DEPENDENCIES:
//!   - mailbox-asc: endpoint channel and readiness
//!   - nexus-hal::{DmaAllocator, IovaMapper}: shared memory and mappings
//!   - parking_lot / thiserror / log

#![deny(clippy::all)]

pub mod arena;
pub mod boot;
pub mod callbacks;
pub mod context;
mod dcp;
pub mod mapping;
pub mod methods;
pub mod payload;
pub mod stack;
pub mod wire;

pub use boot::BootStep;
pub use callbacks::{CallbackHandler, CallbackTable, Disposition};
pub use context::ContextId;
pub use dcp::{Dcp, DcpCore, DcpResources};
pub use mapping::{MappingGrant, MappingId, MappingTable};
pub use stack::{AckCallback, MAX_CALL_DEPTH};
pub use wire::{Tag, DCP_ENDPOINT};

use nexus_hal::DmaError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Mailbox(#[from] mailbox_asc::Error),
    #[error("DMA failure: {0}")]
    Dma(DmaError),
    #[error("coprocessor is not ready")]
    NotReady,
    #[error("call stack for {0:?} is full")]
    StackOverflow(ContextId),
    #[error("context {0:?} cannot carry this operation")]
    InvalidContext(ContextId),
    #[error("unknown context {0}")]
    UnknownContext(u8),
    #[error("ack on {0:?} with no call in flight")]
    UnexpectedAck(ContextId),
    #[error("no callback pending on {0:?}")]
    NoPendingCallback(ContextId),
    #[error("malformed callback tag {0}")]
    MalformedTag(Tag),
    #[error("no handler for callback D{0:03}")]
    UnknownCallback(u16),
    #[error("malformed packet at {0:#x}")]
    MalformedPacket(usize),
    #[error("packet of {0:#x} bytes does not fit its region")]
    PacketTooLarge(usize),
    #[error("access {offset:#x}+{len:#x} outside shared memory")]
    OutOfBounds { offset: usize, len: usize },
    #[error("memory mapping table exhausted")]
    MappingTableExhausted,
    #[error("unknown mapping {0}")]
    UnknownMapping(u32),
    #[error("coprocessor did not answer in time")]
    TimedOut,
    #[error("channel abandoned after an unanswered call")]
    ChannelDead,
}

impl From<DmaError> for Error {
    fn from(err: DmaError) -> Self {
        Self::Dma(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
