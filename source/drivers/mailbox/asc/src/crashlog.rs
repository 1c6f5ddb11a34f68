// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Coprocessor crash log endpoint.
//!
//! The first buffer request sets up the crash log buffer. Any later request
//! means the coprocessor crashed and the buffer now holds a dump.

use std::sync::Arc;

use log::{error, warn};
use parking_lot::Mutex;

use crate::msg::{msg_type, BUFFER_REQUEST};
use crate::router::{Channel, EndpointClient};
use crate::shmem::ShmemNegotiator;

pub const CRASHLOG_MAGIC: u32 = 0x434C_4845;
/// magic, unknown, size, flags, 16 bytes padding.
pub const CRASHLOG_HEADER_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Crashlog {
    /// `crashlog.N`, in capture order.
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct CrashlogStore(Arc<Mutex<Vec<Crashlog>>>);

impl CrashlogStore {
    pub fn snapshot(&self) -> Vec<Crashlog> {
        self.0.lock().clone()
    }

    fn push(&self, data: Vec<u8>) -> String {
        let mut logs = self.0.lock();
        let name = format!("crashlog.{}", logs.len());
        logs.push(Crashlog { name: name.clone(), data });
        name
    }
}

pub struct CrashlogClient {
    shmem: Option<Arc<ShmemNegotiator>>,
    store: CrashlogStore,
}

impl CrashlogClient {
    pub fn new(shmem: Option<Arc<ShmemNegotiator>>, store: CrashlogStore) -> Self {
        Self { shmem, store }
    }

    fn capture(&self, shmem: &ShmemNegotiator, channel: &Channel) {
        let endpoint = channel.endpoint();
        let Some(capacity) = shmem.buffer_size(endpoint) else {
            return;
        };
        let mut header = [0u8; CRASHLOG_HEADER_LEN];
        if let Err(err) = shmem.read(endpoint, 0, &mut header) {
            warn!("asc-mailbox: crash log header unreadable: {err}");
            return;
        }
        let word = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
        let len = if word(0) == CRASHLOG_MAGIC {
            (word(8) as usize).max(CRASHLOG_HEADER_LEN).min(capacity)
        } else {
            warn!("asc-mailbox: crash log magic {:#x} invalid; capturing whole buffer", word(0));
            capacity
        };
        let mut data = vec![0u8; len];
        match shmem.read(endpoint, 0, &mut data) {
            Ok(()) => {
                let name = self.store.push(data);
                error!("asc-mailbox: coprocessor crashed; dump saved as {name} ({len} bytes)");
            }
            Err(err) => warn!("asc-mailbox: crash log unreadable: {err}"),
        }
    }
}

impl EndpointClient for CrashlogClient {
    fn received(&mut self, channel: &Channel, msg: u64) {
        if msg_type(msg) != BUFFER_REQUEST {
            warn!("asc-mailbox: unknown crash log message {msg:#018x}");
            return;
        }
        let Some(shmem) = self.shmem.clone() else {
            warn!("asc-mailbox: crash log buffer requested without shared memory");
            return;
        };
        if shmem.has_buffer(channel.endpoint()) {
            self.capture(&shmem, channel);
            return;
        }
        if let Some(reply) = shmem.handle_request(channel.endpoint(), msg) {
            if let Err(err) = channel.send(reply) {
                warn!("asc-mailbox: crash log buffer reply lost: {err}");
            }
        }
    }
}
