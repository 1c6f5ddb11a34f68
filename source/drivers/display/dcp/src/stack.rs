// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! LIFO stacks of outstanding calls and pending callbacks.

use core::fmt;
use core::ops::Range;

use crate::context::ContextId;
use crate::dcp::DcpCore;
use crate::{Error, Result};

/// Nesting limit for either kind of stack.
pub const MAX_CALL_DEPTH: usize = 8;

/// Completion of a host call: receives the coprocessor's output and the cookie.
pub type AckCallback = Box<dyn FnOnce(&mut DcpCore, &[u8], u64) + Send>;

/// One outstanding host call.
pub struct CallFrame {
    pub(crate) callback: Option<AckCallback>,
    pub cookie: u64,
    /// Slot within the context's transmit region.
    pub slot: Range<usize>,
    /// Absolute location of the output payload in shared memory.
    pub output: Range<usize>,
}

impl fmt::Debug for CallFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFrame")
            .field("cookie", &self.cookie)
            .field("slot", &self.slot)
            .field("output", &self.output)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<CallFrame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Region-relative offset for the next packet.
    pub fn next_offset(&self) -> usize {
        self.frames.last().map_or(0, |frame| frame.slot.end)
    }

    pub fn push(&mut self, context: ContextId, frame: CallFrame) -> Result<usize> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(Error::StackOverflow(context));
        }
        self.frames.push(frame);
        Ok(self.frames.len())
    }

    pub fn pop(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&CallFrame> {
        self.frames.last()
    }
}

/// Output ranges of callbacks the host has not acked yet.
#[derive(Debug, Default)]
pub struct CallbackStack {
    outputs: Vec<Range<usize>>,
}

impl CallbackStack {
    pub fn depth(&self) -> usize {
        self.outputs.len()
    }

    pub fn push(&mut self, context: ContextId, output: Range<usize>) -> Result<()> {
        if self.outputs.len() >= MAX_CALL_DEPTH {
            return Err(Error::StackOverflow(context));
        }
        self.outputs.push(output);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Range<usize>> {
        self.outputs.pop()
    }

    pub fn top(&self) -> Option<&Range<usize>> {
        self.outputs.last()
    }
}
