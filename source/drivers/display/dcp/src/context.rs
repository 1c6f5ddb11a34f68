// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RPC contexts and the shared memory regions behind them.

use core::fmt;

/// Size of each host transmit region.
pub const TX_REGION_SIZE: usize = 0x8000;

const MAIN_TX_OFFSET: usize = 0;
const OOB_TX_OFFSET: usize = 0x8000;
const ASYNC_CHANNEL_OFFSET: usize = 0x40000;
const CB_CHANNEL_OFFSET: usize = 0x60000;
const OOBCB_CHANNEL_OFFSET: usize = 0x68000;

/// Logical channel named by the context field of a DCP doorbell.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContextId {
    /// Host calls made while answering a callback; coprocessor callbacks.
    Callback = 0,
    /// Host calls made outside any callback.
    Command = 2,
    /// Asynchronous notifications from the coprocessor.
    Async = 3,
    OobCallback = 4,
    OobCommand = 5,
}

/// The two call stacks; each is shared by a command/callback context pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStackId {
    Main,
    Oob,
}

impl CallStackId {
    pub const ALL: [Self; 2] = [Self::Main, Self::Oob];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Stacks of inbound callbacks awaiting the host's ack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackStackId {
    Callback,
    OobCallback,
    Async,
}

impl CallbackStackId {
    pub const ALL: [Self; 3] = [Self::Callback, Self::OobCallback, Self::Async];

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl ContextId {
    pub const ALL: [Self; 5] =
        [Self::Callback, Self::Command, Self::Async, Self::OobCallback, Self::OobCommand];

    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Callback),
            2 => Some(Self::Command),
            3 => Some(Self::Async),
            4 => Some(Self::OobCallback),
            5 => Some(Self::OobCommand),
            _ => None,
        }
    }

    pub const fn raw(self) -> u8 {
        self as u8
    }

    /// Stack holding host calls issued on this context. `Async` carries none.
    pub const fn call_stack(self) -> Option<CallStackId> {
        match self {
            Self::Callback | Self::Command => Some(CallStackId::Main),
            Self::OobCallback | Self::OobCommand => Some(CallStackId::Oob),
            Self::Async => None,
        }
    }

    /// Stack of pending coprocessor callbacks. Command contexts carry none.
    pub const fn callback_stack(self) -> Option<CallbackStackId> {
        match self {
            Self::Callback => Some(CallbackStackId::Callback),
            Self::OobCallback => Some(CallbackStackId::OobCallback),
            Self::Async => Some(CallbackStackId::Async),
            Self::Command | Self::OobCommand => None,
        }
    }

    /// Start of the region where the host writes call packets.
    pub const fn tx_offset(self) -> Option<usize> {
        match self.call_stack() {
            Some(CallStackId::Main) => Some(MAIN_TX_OFFSET),
            Some(CallStackId::Oob) => Some(OOB_TX_OFFSET),
            None => None,
        }
    }

    /// Start of the region where the coprocessor writes packets for this context.
    pub const fn channel_offset(self) -> usize {
        match self {
            Self::Callback => CB_CHANNEL_OFFSET,
            Self::OobCallback => OOBCB_CHANNEL_OFFSET,
            Self::Async => ASYNC_CHANNEL_OFFSET,
            Self::Command => MAIN_TX_OFFSET,
            Self::OobCommand => OOB_TX_OFFSET,
        }
    }

    /// Context for a host call: the callback context while a callback is
    /// being serviced, the command context otherwise.
    pub const fn for_call(oob: bool, in_callback: bool) -> Self {
        match (oob, in_callback) {
            (false, false) => Self::Command,
            (false, true) => Self::Callback,
            (true, false) => Self::OobCommand,
            (true, true) => Self::OobCallback,
        }
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Callback => "CB",
            Self::Command => "CMD",
            Self::Async => "ASYNC",
            Self::OobCallback => "OOBCB",
            Self::OobCommand => "OOBCMD",
        };
        f.write_str(name)
    }
}
