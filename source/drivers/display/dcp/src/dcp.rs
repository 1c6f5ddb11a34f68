// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! DCP endpoint state and the handle drivers hold.

use core::ops::Range;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use mailbox_asc::{Channel, EndpointClient, Mailbox};
use nexus_hal::{DmaAllocator, DmaError, IovaMapper};
use parking_lot::Mutex;

use crate::arena::{self, ShmemArena};
use crate::boot::{BootSequence, BootStep};
use crate::callbacks::{CallbackTable, Disposition};
use crate::context::{CallStackId, CallbackStackId, ContextId};
use crate::mapping::{Backing, MappingGrant, MappingTable, MAX_MAPPINGS};
use crate::stack::{AckCallback, CallFrame, CallStack, CallbackStack};
use crate::wire::{
    self, Doorbell, MessageType, PacketHeader, Tag, DCP_ENDPOINT, DCP_SHMEM_SIZE,
    PACKET_HEADER_LEN,
};
use crate::{Error, Result};

const PAGE_MASK: u64 = 0xfff;

fn page_align(size: u64) -> Result<u64> {
    size.checked_add(PAGE_MASK).map(|s| s & !PAGE_MASK).ok_or(Error::Dma(DmaError::OutOfMemory))
}

/// Memory services used by the DCP endpoint.
pub struct DcpResources {
    pub dma: Arc<dyn DmaAllocator + Send + Sync>,
    pub iommu: Arc<dyn IovaMapper + Send + Sync>,
    pub max_mappings: usize,
}

impl DcpResources {
    pub fn new(
        dma: Arc<dyn DmaAllocator + Send + Sync>,
        iommu: Arc<dyn IovaMapper + Send + Sync>,
    ) -> Self {
        Self { dma, iommu, max_mappings: MAX_MAPPINGS }
    }

    pub fn with_max_mappings(mut self, max: usize) -> Self {
        self.max_mappings = max;
        self
    }
}

/// Everything the RPC layer mutates. Only touched under the [`Dcp`] lock.
pub struct DcpCore {
    channel: Option<Channel>,
    arena: ShmemArena,
    calls: [CallStack; 2],
    callbacks: [CallbackStack; 3],
    mappings: MappingTable,
    dma: Arc<dyn DmaAllocator + Send + Sync>,
    iommu: Arc<dyn IovaMapper + Send + Sync>,
    boot: BootSequence,
    initialized: bool,
    dead: bool,
}

impl DcpCore {
    fn new(arena: ShmemArena, resources: DcpResources) -> Self {
        Self {
            channel: None,
            arena,
            calls: Default::default(),
            callbacks: Default::default(),
            mappings: MappingTable::new(resources.max_mappings),
            dma: resources.dma,
            iommu: resources.iommu,
            boot: BootSequence::default(),
            initialized: false,
            dead: false,
        }
    }

    fn channel(&self) -> Result<Channel> {
        self.channel.clone().ok_or(Error::NotReady)
    }

    fn call_stack(&self, context: ContextId) -> Result<CallStackId> {
        context.call_stack().ok_or(Error::InvalidContext(context))
    }

    fn callback_stack(&self, context: ContextId) -> Result<CallbackStackId> {
        context.callback_stack().ok_or(Error::InvalidContext(context))
    }

    /// Writes a call packet for `tag` and rings the coprocessor.
    ///
    /// `on_ack` runs with the coprocessor's output once the matching ack
    /// arrives. Calls on one context stack complete in LIFO order.
    pub fn push(
        &mut self,
        context: ContextId,
        tag: Tag,
        input: &[u8],
        out_len: u32,
        on_ack: Option<AckCallback>,
        cookie: u64,
    ) -> Result<()> {
        if self.dead {
            return Err(Error::ChannelDead);
        }
        let channel = self.channel()?;
        if !channel.is_ready() {
            return Err(Error::NotReady);
        }
        let stack = self.call_stack(context)?;
        let region = context.tx_offset().ok_or(Error::InvalidContext(context))?;
        let in_len = u32::try_from(input.len()).map_err(|_| Error::PacketTooLarge(input.len()))?;
        let header = PacketHeader { tag, in_len, out_len };
        let len = header.packet_len();
        let slot = arena::place(self.calls[stack.index()].next_offset(), len)?;
        let offset = u16::try_from(slot.start).map_err(|_| Error::PacketTooLarge(len))?;
        let length = u32::try_from(len).map_err(|_| Error::PacketTooLarge(len))?;

        let at = region + slot.start;
        let output_at = at + PACKET_HEADER_LEN + input.len();
        let output = output_at..output_at + out_len as usize;
        let frame = CallFrame { callback: on_ack, cookie, slot, output: output.clone() };
        if let Err(err) = self.calls[stack.index()].push(context, frame) {
            error!("dcp: {tag} dropped: {err}");
            return Err(err);
        }
        self.arena.write(at, &header.encode())?;
        self.arena.write(at + PACKET_HEADER_LEN, input)?;
        self.arena.zero(output.start, output.len())?;

        trace!("dcp: {context:?} call {tag} at {at:#x} len {len:#x}");
        let doorbell = Doorbell { context: context.raw(), offset, length, ack: false };
        if let Err(err) = channel.send(doorbell.encode()) {
            self.calls[stack.index()].pop();
            return Err(err.into());
        }
        Ok(())
    }

    /// Like [`push`](Self::push), picking the callback context while a
    /// callback is being serviced and the command context otherwise.
    pub fn call(
        &mut self,
        oob: bool,
        tag: Tag,
        input: &[u8],
        out_len: u32,
        on_ack: Option<AckCallback>,
        cookie: u64,
    ) -> Result<()> {
        let pending = if oob { CallbackStackId::OobCallback } else { CallbackStackId::Callback };
        let context = ContextId::for_call(oob, self.callbacks[pending.index()].depth() > 0);
        self.push(context, tag, input, out_len, on_ack, cookie)
    }

    /// Acks the innermost callback pending on `context`.
    pub fn ack(&mut self, context: ContextId) -> Result<()> {
        self.ack_with(context, &[])
    }

    /// Acks the innermost callback after writing `output` into its output area.
    pub fn ack_with(&mut self, context: ContextId, output: &[u8]) -> Result<()> {
        let stack = self.callback_stack(context)?;
        let range = self.callbacks[stack.index()].pop().ok_or(Error::NoPendingCallback(context))?;
        let len = output.len().min(range.len());
        self.arena.write(range.start, &output[..len])?;
        self.channel()?.send(Doorbell::ack(context.raw()).encode())?;
        Ok(())
    }

    pub fn call_depth(&self, context: ContextId) -> usize {
        context.call_stack().map_or(0, |stack| self.calls[stack.index()].depth())
    }

    pub fn callback_depth(&self, context: ContextId) -> usize {
        context.callback_stack().map_or(0, |stack| self.callbacks[stack.index()].depth())
    }

    /// Region-relative offset the next call on `context` would use.
    pub fn next_offset(&self, context: ContextId) -> Option<usize> {
        context.call_stack().map(|stack| self.calls[stack.index()].next_offset())
    }

    /// Where the coprocessor writes the output of the innermost call on `context`.
    pub fn call_output(&self, context: ContextId) -> Option<Range<usize>> {
        let stack = context.call_stack()?;
        self.calls[stack.index()].top().map(|frame| frame.output.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn boot_step(&self) -> BootStep {
        self.boot.step
    }

    pub fn shmem_iova(&self) -> u64 {
        self.arena.iova()
    }

    pub fn shmem(&self) -> &[u8] {
        self.arena.as_slice()
    }

    /// Coprocessor-visible memory.
    pub fn shmem_mut(&mut self) -> &mut [u8] {
        self.arena.as_mut_slice()
    }

    pub fn mappings(&self) -> &MappingTable {
        &self.mappings
    }

    /// Allocates host memory on the coprocessor's behalf.
    pub fn allocate_buffer(&mut self, size: u64) -> Result<MappingGrant> {
        if self.mappings.is_full() {
            return Err(Error::MappingTableExhausted);
        }
        let aligned = page_align(size)?;
        let len = usize::try_from(aligned).map_err(|_| Error::Dma(DmaError::OutOfMemory))?;
        let buffer = self.dma.alloc_coherent(len)?;
        let iova = buffer.iova();
        let id = self.mappings.insert(iova, len, Backing::Dma(buffer))?;
        Ok(MappingGrant { id, iova, size: aligned })
    }

    /// Maps a physical range the host does not own into the coprocessor.
    pub fn map_physical(&mut self, paddr: u64, size: u64) -> Result<MappingGrant> {
        if self.mappings.is_full() {
            return Err(Error::MappingTableExhausted);
        }
        let aligned = page_align(size)?;
        let len = usize::try_from(aligned).map_err(|_| Error::Dma(DmaError::NoIovaSpace))?;
        let iova = self.iommu.map(paddr, len)?;
        let id = self.mappings.insert(iova, len, Backing::Physical { paddr })?;
        Ok(MappingGrant { id, iova, size: aligned })
    }

    /// Maps descriptor `id` for a second consumer, such as a display plane.
    pub fn remap(&self, id: u32, mapper: &dyn IovaMapper) -> Result<u64> {
        self.mappings.remap(id, mapper)
    }

    pub(crate) fn start_boot(&mut self, context: ContextId) {
        if self.boot.pending.is_some() {
            warn!("dcp: boot requested while boot step {:?} is pending", self.boot.step);
        }
        self.boot = BootSequence { step: BootStep::Idle, pending: Some(context) };
        self.advance_boot();
    }

    fn advance_boot(&mut self) {
        let step = self.boot.step.advance();
        self.boot.step = step;
        let Some(method) = step.method() else {
            info!("dcp: boot sequence complete");
            if let Some(context) = self.boot.pending.take() {
                if let Err(err) = self.ack(context) {
                    error!("dcp: failed to ack boot: {err}");
                }
            }
            return;
        };
        debug!("dcp: boot step {step:?} ({})", method.tag());
        let oob = self.boot.pending == Some(ContextId::OobCallback);
        let next: AckCallback = Box::new(|dcp, _, _| dcp.advance_boot());
        if let Err(err) = self.call(oob, method.tag(), &step.input(), method.out_len(), Some(next), 0)
        {
            error!("dcp: boot step {step:?} failed: {err}");
            self.abort_boot();
        }
    }

    /// Answers the D116 callback so the coprocessor does not stall.
    fn abort_boot(&mut self) {
        self.boot.step = BootStep::Idle;
        if let Some(context) = self.boot.pending.take() {
            if let Err(err) = self.ack(context) {
                error!("dcp: failed to ack aborted boot: {err}");
            }
        }
    }

    /// Handles one inbound doorbell.
    pub(crate) fn handle_message(&mut self, table: &CallbackTable, raw: u64) -> Result<()> {
        match wire::message_type(raw) {
            Some(MessageType::Initialized) => {
                info!("dcp: coprocessor initialized");
                self.initialized = true;
                Ok(())
            }
            Some(MessageType::Message) => {
                let doorbell = Doorbell::decode(raw);
                let context = ContextId::from_raw(doorbell.context)
                    .ok_or(Error::UnknownContext(doorbell.context))?;
                if doorbell.ack {
                    self.complete_call(context)
                } else {
                    self.dispatch_callback(
                        table,
                        context,
                        usize::from(doorbell.offset),
                        doorbell.length as usize,
                    )
                }
            }
            _ => {
                warn!("dcp: ignoring message {raw:#018x}");
                Ok(())
            }
        }
    }

    fn complete_call(&mut self, context: ContextId) -> Result<()> {
        if self.dead {
            return Err(Error::ChannelDead);
        }
        let stack = self.call_stack(context)?;
        let frame = self.calls[stack.index()].pop().ok_or(Error::UnexpectedAck(context))?;
        let output = self.arena.read(frame.output.start, frame.output.len())?.to_vec();
        trace!("dcp: {context:?} ack, {} output bytes", output.len());
        if let Some(callback) = frame.callback {
            callback(self, &output, frame.cookie);
        }
        Ok(())
    }

    /// Records a pending callback. On overflow the coprocessor is acked
    /// without a frame so it does not stall.
    fn enter_callback(&mut self, context: ContextId, output: Range<usize>) -> Result<()> {
        let stack = self.callback_stack(context)?;
        if let Err(err) = self.callbacks[stack.index()].push(context, output) {
            error!("dcp: {err}");
            self.channel()?.send(Doorbell::ack(context.raw()).encode())?;
            return Err(err);
        }
        Ok(())
    }

    fn dispatch_callback(
        &mut self,
        table: &CallbackTable,
        context: ContextId,
        offset: usize,
        length: usize,
    ) -> Result<()> {
        if let Err(err) = self.callback_stack(context) {
            self.channel()?.send(Doorbell::ack(context.raw()).encode())?;
            return Err(err);
        }
        let base = context.channel_offset() + offset;
        let header = self
            .arena
            .read(base, PACKET_HEADER_LEN)
            .ok()
            .and_then(PacketHeader::decode)
            .filter(|h| h.packet_len() <= length && base + h.packet_len() <= DCP_SHMEM_SIZE);
        let Some(header) = header else {
            self.enter_callback(context, base..base)?;
            self.ack(context)?;
            return Err(Error::MalformedPacket(base));
        };

        let input_at = base + PACKET_HEADER_LEN;
        let output_at = input_at + header.in_len as usize;
        let output = output_at..output_at + header.out_len as usize;
        self.enter_callback(context, output.clone())?;
        self.arena.zero(output.start, output.len())?;

        let id = match header.tag.callback_id() {
            Some(id) => id,
            None => {
                self.ack(context)?;
                return Err(Error::MalformedTag(header.tag));
            }
        };
        let Some(handler) = table.get(id) else {
            self.ack(context)?;
            return Err(Error::UnknownCallback(id));
        };

        trace!("dcp: {context:?} callback {}", header.tag);
        let input = self.arena.read(input_at, header.in_len as usize)?.to_vec();
        let mut out = vec![0u8; output.len()];
        let disposition = handler.handle(self, context, &input, &mut out);
        self.arena.write(output.start, &out)?;
        if disposition == Disposition::Ack {
            self.ack(context)?;
        }
        Ok(())
    }

    /// Drops every pending frame; their callbacks never run.
    fn abandon(&mut self) {
        self.dead = true;
        self.calls = Default::default();
        self.callbacks = Default::default();
        self.boot.pending = None;
    }
}

/// Mailbox client feeding the core.
struct DcpEndpoint {
    core: Arc<Mutex<DcpCore>>,
    table: Arc<CallbackTable>,
}

impl EndpointClient for DcpEndpoint {
    fn received(&mut self, _channel: &Channel, msg: u64) {
        if let Err(err) = self.core.lock().handle_message(&self.table, msg) {
            warn!("dcp: {err}");
        }
    }
}

/// Handle to a DCP instance.
#[derive(Clone)]
pub struct Dcp {
    core: Arc<Mutex<DcpCore>>,
}

impl Dcp {
    /// Allocates shared memory and binds the DCP endpoint on `mailbox`.
    pub fn attach(mailbox: &Mailbox, resources: DcpResources, table: CallbackTable) -> Result<Self> {
        let arena = ShmemArena::new(resources.dma.alloc_coherent(DCP_SHMEM_SIZE)?)?;
        let core = Arc::new(Mutex::new(DcpCore::new(arena, resources)));
        let client = DcpEndpoint { core: Arc::clone(&core), table: Arc::new(table) };
        let channel = mailbox.request_channel(DCP_ENDPOINT, Box::new(client))?;
        core.lock().channel = Some(channel);
        Ok(Self { core })
    }

    /// Announces shared memory. The coprocessor answers with "initialized".
    pub fn start(&self) -> Result<()> {
        let core = self.core.lock();
        let channel = core.channel()?;
        if !channel.is_ready() {
            return Err(Error::NotReady);
        }
        info!("dcp: shared memory at {:#x}", core.arena.iova());
        channel.send(wire::set_shmem(core.arena.iova()))?;
        Ok(())
    }

    /// Releases the endpoint. Pending calls are abandoned.
    pub fn detach(&self, mailbox: &Mailbox) {
        mailbox.release_channel(DCP_ENDPOINT);
        self.core.lock().abandon();
    }

    /// Mailbox ready, shared memory accepted, and no call ever timed out.
    pub fn is_ready(&self) -> bool {
        let core = self.core.lock();
        core.initialized
            && !core.dead
            && core.channel.as_ref().is_some_and(Channel::is_ready)
    }

    pub fn push(
        &self,
        context: ContextId,
        tag: Tag,
        input: &[u8],
        out_len: u32,
        on_ack: Option<AckCallback>,
        cookie: u64,
    ) -> Result<()> {
        self.core.lock().push(context, tag, input, out_len, on_ack, cookie)
    }

    pub fn ack(&self, context: ContextId) -> Result<()> {
        self.core.lock().ack(context)
    }

    /// Issues a call and blocks until its ack or `timeout`.
    ///
    /// A timeout leaves the frame stuck at its depth; the channel is then
    /// considered dead: late acks are dropped and pushes fail with
    /// [`Error::ChannelDead`].
    pub fn call_sync(
        &self,
        context: ContextId,
        tag: Tag,
        input: &[u8],
        out_len: u32,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (tx, rx) = mpsc::sync_channel(1);
        let on_ack: AckCallback = Box::new(move |_, output, _| {
            let _ = tx.send(output.to_vec());
        });
        self.push(context, tag, input, out_len, Some(on_ack), 0)?;
        match rx.recv_timeout(timeout) {
            Ok(output) => Ok(output),
            Err(_) => {
                let mut core = self.core.lock();
                // The ack may have landed between the timeout and taking the lock.
                if let Ok(output) = rx.try_recv() {
                    return Ok(output);
                }
                error!("dcp: {tag} on {context:?} unanswered after {timeout:?}");
                core.dead = true;
                Err(Error::TimedOut)
            }
        }
    }

    pub fn with_core<R>(&self, f: impl FnOnce(&mut DcpCore) -> R) -> R {
        f(&mut self.core.lock())
    }
}
