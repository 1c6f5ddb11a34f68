// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RTKit management endpoint: hello, endpoint discovery, endpoint start, boot-done.
//!
//! [`ManagementProtocol`] is a pure state machine that turns one inbound
//! message into the replies to send; [`ManagementClient`] binds it to the
//! management channel.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::msg::{EndpointId, MgmtMsg};
use crate::router::{Channel, EndpointClient};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootState {
    Cold,
    HelloSent,
    EndpointsDiscovered,
    EndpointsStarting,
    Ready,
}

/// 256-bit set of endpoint ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointSet([u64; 4]);

impl EndpointSet {
    pub fn insert(&mut self, endpoint: EndpointId) {
        let ep = endpoint.0 as usize;
        self.0[ep / 64] |= 1 << (ep % 64);
    }

    pub fn contains(&self, endpoint: EndpointId) -> bool {
        let ep = endpoint.0 as usize;
        self.0[ep / 64] & (1 << (ep % 64)) != 0
    }

    /// Merges one endpoint map fragment: bit `i` of `bitmap` names endpoint `32 * base + i`.
    pub fn merge_fragment(&mut self, base: u8, bitmap: u32) {
        for i in 0..32u32 {
            if bitmap & (1 << i) == 0 {
                continue;
            }
            let ep = 32 * base as u32 + i;
            if let Ok(ep) = u8::try_from(ep) {
                self.insert(EndpointId(ep));
            }
        }
    }

    /// Ascending.
    pub fn iter(&self) -> impl Iterator<Item = EndpointId> + '_ {
        (0..=u8::MAX).map(EndpointId).filter(|ep| self.contains(*ep))
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }
}

/// One-shot readiness latch.
#[derive(Default)]
pub struct ReadySignal {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.cond.notify_all();
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock()
    }

    /// Blocks until ready or until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let mut ready = self.ready.lock();
        if !*ready {
            let _ = self.cond.wait_while_for(&mut ready, |ready| !*ready, timeout);
        }
        if *ready {
            Ok(())
        } else {
            Err(Error::TimedOut)
        }
    }
}

pub struct ManagementProtocol {
    state: BootState,
    discovered: EndpointSet,
    ready: Arc<ReadySignal>,
}

impl ManagementProtocol {
    pub fn new(ready: Arc<ReadySignal>) -> Self {
        Self { state: BootState::Cold, discovered: EndpointSet::default(), ready }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn discovered(&self) -> &EndpointSet {
        &self.discovered
    }

    /// Only endpoints announced in the endpoint map may be started.
    pub fn check_startable(&self, endpoint: EndpointId) -> Result<()> {
        if self.discovered.contains(endpoint) {
            Ok(())
        } else {
            Err(Error::EndpointNotPermitted(endpoint))
        }
    }

    /// Advances the handshake on one inbound message and returns the replies in send order.
    pub fn handle(&mut self, raw: u64) -> Vec<u64> {
        match MgmtMsg::decode(raw) {
            MgmtMsg::Hello { tag } => {
                debug!("asc-mailbox: hello {tag:#x}");
                self.state = BootState::HelloSent;
                vec![MgmtMsg::HelloReply { tag }.encode()]
            }
            MgmtMsg::EpMap { base, bitmap, last } => {
                self.discovered.merge_fragment(base, bitmap);
                let mut replies = vec![MgmtMsg::EpMapReply { base, last }.encode()];
                if last {
                    replies.extend(
                        self.discovered
                            .iter()
                            .filter(|ep| *ep != EndpointId::MGMT)
                            .map(|endpoint| MgmtMsg::StartEp { endpoint }.encode()),
                    );
                    self.state = BootState::EndpointsStarting;
                    debug!("asc-mailbox: starting {} endpoints", replies.len() - 1);
                } else {
                    self.state = BootState::EndpointsDiscovered;
                }
                replies
            }
            MgmtMsg::BootDone => vec![MgmtMsg::BootDoneAck.encode()],
            MgmtMsg::BootDone2 => {
                self.state = BootState::Ready;
                self.ready.complete();
                info!("asc-mailbox: coprocessor ready");
                Vec::new()
            }
            other => {
                warn!("asc-mailbox: unknown management message {:#018x}", other.encode());
                Vec::new()
            }
        }
    }
}

/// Management endpoint client.
pub struct ManagementClient {
    protocol: Arc<Mutex<ManagementProtocol>>,
}

impl ManagementClient {
    pub fn new(protocol: Arc<Mutex<ManagementProtocol>>) -> Self {
        Self { protocol }
    }
}

impl EndpointClient for ManagementClient {
    fn received(&mut self, channel: &Channel, msg: u64) {
        let replies = self.protocol.lock().handle(msg);
        for reply in replies {
            if let Err(err) = channel.send(reply) {
                warn!("asc-mailbox: management reply {reply:#018x} lost: {err}");
            }
        }
    }
}
