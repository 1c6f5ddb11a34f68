// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Endpoint id to client table.

use std::sync::Arc;

use log::{debug, error};

use crate::msg::{EndpointId, Message};
use crate::{Error, Result};

/// Default number of channel slots.
pub const MAX_CHANNELS: usize = 20;

/// Transmit side shared by every channel of a mailbox.
pub trait Outbox: Send + Sync {
    /// Queues `message` for the coprocessor.
    fn post(&self, message: Message) -> Result<()>;

    /// True once the management handshake completed.
    fn is_ready(&self) -> bool;
}

/// Receives the messages addressed to one endpoint. Runs on the deferred worker.
pub trait EndpointClient: Send {
    fn received(&mut self, channel: &Channel, msg: u64);
}

/// Sender bound to one endpoint.
#[derive(Clone)]
pub struct Channel {
    endpoint: EndpointId,
    outbox: Arc<dyn Outbox>,
}

impl Channel {
    pub fn new(endpoint: EndpointId, outbox: Arc<dyn Outbox>) -> Self {
        Self { endpoint, outbox }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn send(&self, msg: u64) -> Result<()> {
        self.outbox.post(Message::new(self.endpoint, msg))
    }

    pub fn is_ready(&self) -> bool {
        self.outbox.is_ready()
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel").field("endpoint", &self.endpoint).finish()
    }
}

struct Slot {
    channel: Channel,
    client: Box<dyn EndpointClient>,
}

pub struct EndpointRouter {
    slots: Vec<Option<Slot>>,
    outbox: Arc<dyn Outbox>,
}

impl EndpointRouter {
    pub fn new(capacity: usize, outbox: Arc<dyn Outbox>) -> Self {
        Self { slots: (0..capacity).map(|_| None).collect(), outbox }
    }

    fn find(&self, endpoint: EndpointId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| s.channel.endpoint == endpoint))
    }

    /// Binds `endpoint` to `client`. An existing binding is left untouched.
    pub fn register(
        &mut self,
        endpoint: EndpointId,
        client: Box<dyn EndpointClient>,
    ) -> Result<Channel> {
        if self.find(endpoint).is_some() {
            return Err(Error::EndpointBusy(endpoint));
        }
        let free = self.slots.iter().position(Option::is_none).ok_or(Error::NoFreeSlots)?;
        let channel = Channel::new(endpoint, Arc::clone(&self.outbox));
        self.slots[free] = Some(Slot { channel: channel.clone(), client });
        debug!("asc-mailbox: endpoint {endpoint} bound to slot {free}");
        Ok(channel)
    }

    /// Drops the binding for `endpoint`. Returns false if there was none.
    pub fn release(&mut self, endpoint: EndpointId) -> bool {
        match self.find(endpoint) {
            Some(idx) => {
                self.slots[idx] = None;
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, endpoint: EndpointId) -> bool {
        self.find(endpoint).is_some()
    }

    /// Hands `message` to its endpoint's client. Unknown endpoints are logged and dropped.
    pub fn dispatch(&mut self, message: Message) -> Result<()> {
        let endpoint = message.endpoint();
        let Some(idx) = self.find(endpoint) else {
            error!(
                "asc-mailbox: dropping message {:#018x} for unknown endpoint {endpoint}",
                message.msg
            );
            return Err(Error::UnknownEndpoint(endpoint));
        };
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.client.received(&slot.channel, message.msg);
        }
        Ok(())
    }
}
