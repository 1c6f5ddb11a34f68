// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Callback dispatch table and the built-in callbacks.

use log::{debug, warn};

use crate::context::ContextId;
use crate::dcp::DcpCore;
use crate::payload::{
    AllocateBufferRequest, AllocateBufferResponse, MapPhysicalRequest, MapPhysicalResponse,
};
use crate::{Error, Result};

/// Number of callback slots (`D000` to `D999`).
pub const CALLBACK_SLOTS: usize = 1000;

pub const CB_DID_BOOT: u16 = 0;
pub const CB_DID_POWER_ON: u16 = 1;
pub const CB_WILL_POWER_OFF: u16 = 2;
pub const CB_BOOT: u16 = 116;
pub const CB_IS_DARK_BOOT: u16 = 117;
pub const CB_IS_WAKING_FROM_HIBERNATE: u16 = 118;
pub const CB_ALLOCATE_BUFFER: u16 = 451;
pub const CB_MAP_PHYSICAL: u16 = 452;

/// Whether the callback is acked when the handler returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// The handler acks later, typically from an ack callback.
    Defer,
}

pub trait CallbackHandler: Send + Sync {
    /// `output` is zeroed and sized to the packet's output length.
    fn handle(
        &self,
        dcp: &mut DcpCore,
        context: ContextId,
        input: &[u8],
        output: &mut [u8],
    ) -> Disposition;
}

impl<F> CallbackHandler for F
where
    F: Fn(&mut DcpCore, ContextId, &[u8], &mut [u8]) -> Disposition + Send + Sync,
{
    fn handle(
        &self,
        dcp: &mut DcpCore,
        context: ContextId,
        input: &[u8],
        output: &mut [u8],
    ) -> Disposition {
        self(dcp, context, input, output)
    }
}

/// Callback id to handler.
pub struct CallbackTable {
    slots: Vec<Option<Box<dyn CallbackHandler>>>,
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl CallbackTable {
    pub fn empty() -> Self {
        Self { slots: (0..CALLBACK_SLOTS).map(|_| None).collect() }
    }

    /// Table with the built-in callbacks installed.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.install(CB_DID_BOOT, reply_true);
        table.install(CB_DID_POWER_ON, reply_true);
        table.install(CB_WILL_POWER_OFF, nop);
        table.install(CB_BOOT, boot);
        table.install(CB_IS_DARK_BOOT, reply_false);
        table.install(CB_IS_WAKING_FROM_HIBERNATE, reply_false);
        table.install(CB_ALLOCATE_BUFFER, allocate_buffer);
        table.install(CB_MAP_PHYSICAL, map_physical);
        table
    }

    fn install(&mut self, id: u16, handler: impl CallbackHandler + 'static) {
        self.slots[usize::from(id)] = Some(Box::new(handler));
    }

    /// Installs or replaces the handler for `id`.
    pub fn register(&mut self, id: u16, handler: impl CallbackHandler + 'static) -> Result<()> {
        let slot = self.slots.get_mut(usize::from(id)).ok_or(Error::UnknownCallback(id))?;
        *slot = Some(Box::new(handler));
        Ok(())
    }

    pub fn get(&self, id: u16) -> Option<&dyn CallbackHandler> {
        self.slots.get(usize::from(id))?.as_deref()
    }

    pub fn is_registered(&self, id: u16) -> bool {
        self.get(id).is_some()
    }
}

fn write_bool(output: &mut [u8], value: bool) {
    if let Some(first) = output.first_mut() {
        *first = value.into();
    }
}

fn reply_true(_: &mut DcpCore, _: ContextId, _: &[u8], output: &mut [u8]) -> Disposition {
    write_bool(output, true);
    Disposition::Ack
}

fn reply_false(_: &mut DcpCore, _: ContextId, _: &[u8], output: &mut [u8]) -> Disposition {
    write_bool(output, false);
    Disposition::Ack
}

fn nop(_: &mut DcpCore, _: ContextId, _: &[u8], _: &mut [u8]) -> Disposition {
    Disposition::Ack
}

fn boot(dcp: &mut DcpCore, context: ContextId, _: &[u8], _: &mut [u8]) -> Disposition {
    dcp.start_boot(context);
    Disposition::Defer
}

fn write_response(output: &mut [u8], bytes: &[u8]) {
    let len = output.len().min(bytes.len());
    output[..len].copy_from_slice(&bytes[..len]);
}

fn allocate_buffer(
    dcp: &mut DcpCore,
    _: ContextId,
    input: &[u8],
    output: &mut [u8],
) -> Disposition {
    let Some(req) = AllocateBufferRequest::decode(input) else {
        warn!("dcp: short allocate_buffer request ({} bytes)", input.len());
        return Disposition::Ack;
    };
    match dcp.allocate_buffer(req.size) {
        Ok(grant) => {
            debug!("dcp: allocated {:#x} bytes at {:#x} as #{}", grant.size, grant.iova, grant.id.get());
            let resp = AllocateBufferResponse {
                paddr: 0,
                dva: grant.iova,
                dva_size: grant.size,
                mem_desc_id: grant.id.get(),
            };
            write_response(output, &resp.encode());
        }
        Err(err) => warn!("dcp: allocate_buffer({:#x}) failed: {err}", req.size),
    }
    Disposition::Ack
}

fn map_physical(dcp: &mut DcpCore, _: ContextId, input: &[u8], output: &mut [u8]) -> Disposition {
    let Some(req) = MapPhysicalRequest::decode(input) else {
        warn!("dcp: short map_physical request ({} bytes)", input.len());
        return Disposition::Ack;
    };
    match dcp.map_physical(req.paddr, req.size) {
        Ok(grant) => {
            let resp = MapPhysicalResponse {
                dva: grant.iova,
                dva_size: grant.size,
                mem_desc_id: grant.id.get(),
            };
            write_response(output, &resp.encode());
        }
        Err(err) => warn!("dcp: map_physical({:#x}, {:#x}) failed: {err}", req.paddr, req.size),
    }
    Disposition::Ack
}
