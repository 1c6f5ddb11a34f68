// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Coprocessor syslog endpoint.
//!
//! Entries live in the negotiated shared buffer; each log message names the
//! slot to read and is echoed back to release it.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::msg::{
    field_get, msg_type, BUFFER_REQUEST, SYSLOG_ENTRY_IDX, SYSLOG_INIT, SYSLOG_LOG,
    SYSLOG_MSG_SIZE, SYSLOG_N_ENTRIES,
};
use crate::router::{Channel, EndpointClient};
use crate::shmem::ShmemNegotiator;

/// Fixed part of an entry: header, unknown word, 24-byte context.
const ENTRY_PREFIX: usize = 0x20;
const CONTEXT_OFFSET: usize = 8;
const CONTEXT_LEN: usize = 24;
/// Records kept for inspection.
pub const SYSLOG_HISTORY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyslogRecord {
    pub context: String,
    pub message: String,
}

/// Bounded history of decoded records, oldest first.
#[derive(Clone, Default)]
pub struct SyslogHistory(Arc<Mutex<VecDeque<SyslogRecord>>>);

impl SyslogHistory {
    fn push(&self, record: SyslogRecord) {
        let mut ring = self.0.lock();
        if ring.len() == SYSLOG_HISTORY {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    pub fn snapshot(&self) -> Vec<SyslogRecord> {
        self.0.lock().iter().cloned().collect()
    }
}

/// Text up to the first NUL, lossily decoded.
fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}

pub struct SyslogClient {
    shmem: Option<Arc<ShmemNegotiator>>,
    history: SyslogHistory,
    n_entries: usize,
    msg_size: usize,
}

impl SyslogClient {
    pub fn new(shmem: Option<Arc<ShmemNegotiator>>, history: SyslogHistory) -> Self {
        Self { shmem, history, n_entries: 0, msg_size: 0 }
    }

    fn read_entry(&self, channel: &Channel, idx: usize) -> Option<SyslogRecord> {
        let shmem = self.shmem.as_ref()?;
        let entry_size = ENTRY_PREFIX + self.msg_size;
        if idx >= self.n_entries {
            warn!("asc-mailbox: syslog index {idx} outside {} entries", self.n_entries);
            return None;
        }
        let mut entry = vec![0u8; entry_size];
        if let Err(err) = shmem.read(channel.endpoint(), idx * entry_size, &mut entry) {
            warn!("asc-mailbox: syslog entry {idx} unreadable: {err}");
            return None;
        }
        Some(SyslogRecord {
            context: c_str(&entry[CONTEXT_OFFSET..CONTEXT_OFFSET + CONTEXT_LEN]),
            message: c_str(&entry[ENTRY_PREFIX..]),
        })
    }
}

impl EndpointClient for SyslogClient {
    fn received(&mut self, channel: &Channel, msg: u64) {
        match msg_type(msg) {
            BUFFER_REQUEST => {
                let Some(shmem) = &self.shmem else {
                    warn!("asc-mailbox: syslog buffer requested without shared memory");
                    return;
                };
                if let Some(reply) = shmem.handle_request(channel.endpoint(), msg) {
                    if let Err(err) = channel.send(reply) {
                        warn!("asc-mailbox: syslog buffer reply lost: {err}");
                    }
                }
            }
            SYSLOG_INIT => {
                self.n_entries = field_get(SYSLOG_N_ENTRIES, msg) as usize;
                self.msg_size = field_get(SYSLOG_MSG_SIZE, msg) as usize;
            }
            SYSLOG_LOG => {
                let idx = field_get(SYSLOG_ENTRY_IDX, msg) as usize;
                if let Some(record) = self.read_entry(channel, idx) {
                    info!("asc-mailbox: syslog {}: {}", record.context, record.message);
                    self.history.push(record);
                }
                // Echo releases the slot even when it could not be read.
                if let Err(err) = channel.send(msg) {
                    warn!("asc-mailbox: syslog ack lost: {err}");
                }
            }
            other => warn!("asc-mailbox: unknown syslog message type {other:#x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_strings_stop_at_nul() {
        assert_eq!(c_str(b"hello\0junk"), "hello");
        assert_eq!(c_str(b"line\n"), "line");
        assert_eq!(c_str(b""), "");
    }

    #[test]
    fn history_is_bounded() {
        let history = SyslogHistory::default();
        for i in 0..SYSLOG_HISTORY + 3 {
            history.push(SyslogRecord { context: "ctx".into(), message: i.to_string() });
        }
        let records = history.snapshot();
        assert_eq!(records.len(), SYSLOG_HISTORY);
        assert_eq!(records[0].message, "3");
    }
}
