// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: ASC mailbox driver and RTKit management protocol for coprocessors
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable (bring-up)
//! TEST_COVERAGE: Unit + property tests per module, controller end-to-end tests
//!
//! PUBLIC API:
//!   - Mailbox: probe(), handle_recv_irq(), handle_send_irq(), run_deferred(),
//!     request_channel(), start_endpoint(), wait_ready(), shutdown()
//!   - Channel / EndpointClient: per-endpoint send and receive
//!   - HardwareTransport: FIFO register access
//!   - ReceiveQueue: recv_queue() producer/consumer halves
//!   - EndpointRouter: endpoint to client table
//!   - ManagementProtocol: hello / endpoint map / start / boot-done handshake
//!   - ShmemNegotiator: buffer requests over CoherentDma, SartDma or IoMapped
//!   - MailboxConfig: TOML configuration
//!
//! DEPENDENCIES:
//!   - nexus-hal::{Bus, IrqLine, DmaAllocator, MmioWindow}: hardware access
//!   - nexus-sync::SpinLock: interrupt-context critical sections
//!   - parking_lot: worker-context locks and the ready signal
//!   - thiserror / log / serde / toml: errors, logging, configuration

#![deny(clippy::all)]

pub mod config;
pub mod controller;
pub mod crashlog;
pub mod ioreport;
pub mod mgmt;
pub mod msg;
pub mod queue;
pub mod regs;
pub mod router;
pub mod sart;
pub mod shmem;
pub mod syslog;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{ConfigError, MailboxConfig, ShmemKind, Variant};
pub use controller::{DeferredWorker, Mailbox, MailboxResources};
pub use mgmt::{BootState, EndpointSet, ManagementProtocol, ReadySignal};
pub use msg::{EndpointId, Message};
pub use queue::{recv_queue, RecvConsumer, RecvProducer};
pub use router::{Channel, EndpointClient, EndpointRouter, Outbox};
pub use shmem::{ShmemBackend, ShmemNegotiator};
pub use transport::HardwareTransport;

use nexus_hal::DmaError;
use thiserror::Error;

/// Errors surfaced by the mailbox and its protocol layers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("mailbox FIFO full; retry after the can-send interrupt")]
    TransportBusy,
    #[error("timed out waiting for the coprocessor")]
    TimedOut,
    #[error("no channel registered for endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("endpoint {0} already has a channel")]
    EndpointBusy(EndpointId),
    #[error("no free channel slots")]
    NoFreeSlots,
    #[error("system endpoint {0} cannot be handed out")]
    ReservedEndpoint(EndpointId),
    #[error("endpoint {0} was not announced by the coprocessor")]
    EndpointNotPermitted(EndpointId),
    #[error("DMA allow-list is full")]
    AllowListExhausted,
    #[error("buffer {iova:#x}+{size:#x} is not 4 KiB aligned")]
    Misaligned { iova: u64, size: usize },
    #[error("buffer {iova:#x}+{size:#x} lies outside the shared memory window")]
    OutOfWindow { iova: u64, size: usize },
    #[error("read of {len:#x} bytes at {offset:#x} overruns a {size:#x} byte buffer")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("endpoint {0} has no shared memory buffer")]
    NoBuffer(EndpointId),
    #[error("DMA failure: {0}")]
    Dma(DmaError),
    #[error("mailbox variant needs a {0} resource")]
    MissingResource(&'static str),
    #[error("coprocessor is not ready")]
    NotReady,
}

impl From<DmaError> for Error {
    fn from(err: DmaError) -> Self {
        Self::Dma(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Outcome of an interrupt handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    /// Nothing left for the deferred worker.
    Handled,
    /// The deferred worker has messages to drain.
    WakeThread,
}
