// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! I/O report endpoint: owns a buffer and acknowledges report notifications.

use std::sync::Arc;

use log::warn;

use crate::msg::{msg_type, BUFFER_REQUEST};
use crate::router::{Channel, EndpointClient};
use crate::shmem::ShmemNegotiator;

/// Notification types that are acknowledged by echoing them.
const IOREPORT_ECHO: [u8; 2] = [0x8, 0xc];

pub struct IoReportClient {
    shmem: Option<Arc<ShmemNegotiator>>,
}

impl IoReportClient {
    pub fn new(shmem: Option<Arc<ShmemNegotiator>>) -> Self {
        Self { shmem }
    }
}

impl EndpointClient for IoReportClient {
    fn received(&mut self, channel: &Channel, msg: u64) {
        let ty = msg_type(msg);
        let reply = if ty == BUFFER_REQUEST {
            match &self.shmem {
                Some(shmem) => shmem.handle_request(channel.endpoint(), msg),
                None => {
                    warn!("asc-mailbox: ioreport buffer requested without shared memory");
                    None
                }
            }
        } else if IOREPORT_ECHO.contains(&ty) {
            Some(msg)
        } else {
            warn!("asc-mailbox: unknown ioreport message {msg:#018x}");
            None
        };
        if let Some(reply) = reply {
            if let Err(err) = channel.send(reply) {
                warn!("asc-mailbox: ioreport reply lost: {err}");
            }
        }
    }
}
