// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host test doubles: a fake ASC register block and a probed mailbox around it.

use std::collections::VecDeque;
use std::sync::Arc;

use nexus_hal::mock::{MockBus, MockIrq, VecDmaAllocator};
use nexus_hal::{Bus, IrqLine, MmioWindow};
use parking_lot::Mutex;

use crate::config::MailboxConfig;
use crate::controller::{Mailbox, MailboxResources};
use crate::msg::{EndpointId, Message, MgmtMsg};
use crate::regs::{
    CpuControl, FifoControl, A2I_CONTROL, A2I_MBOX_DATA, A2I_MBOX_INFO, CPU_CONTROL, I2A_CONTROL,
    I2A_MBOX_DATA, I2A_MBOX_INFO,
};
use crate::Result;

struct FakeState {
    cpu_control: u32,
    tx_latch: u64,
    sent: Vec<Message>,
    tx_capacity: usize,
    inbound: VecDeque<Message>,
}

/// ASC mailbox registers with FIFO semantics. Clones share state.
#[derive(Clone)]
pub struct FakeAsc {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeAsc {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAsc {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                cpu_control: 0,
                tx_latch: 0,
                sent: Vec::new(),
                tx_capacity: usize::MAX,
                inbound: VecDeque::new(),
            })),
        }
    }

    /// Queues a message from the coprocessor.
    pub fn inject(&self, message: Message) {
        self.state.lock().inbound.push_back(message);
    }

    /// Takes everything the host sent, freeing the A2I FIFO.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut self.state.lock().sent)
    }

    pub fn pending_inbound(&self) -> usize {
        self.state.lock().inbound.len()
    }

    /// A2I FIFO slots; the FIFO reports full once this many messages are untaken.
    pub fn set_tx_capacity(&self, capacity: usize) {
        self.state.lock().tx_capacity = capacity;
    }

    pub fn cpu_running(&self) -> bool {
        CpuControl::from_bits_retain(self.state.lock().cpu_control).contains(CpuControl::RUN)
    }

    pub fn set_cpu_running(&self, running: bool) {
        let mut state = self.state.lock();
        let mut ctrl = CpuControl::from_bits_retain(state.cpu_control);
        ctrl.set(CpuControl::RUN, running);
        state.cpu_control = ctrl.bits();
    }
}

impl Bus for FakeAsc {
    fn read(&self, offset: usize) -> u32 {
        let state = self.state.lock();
        match offset {
            CPU_CONTROL => state.cpu_control,
            A2I_CONTROL => {
                let mut status = FifoControl::empty();
                status.set(FifoControl::FULL, state.sent.len() >= state.tx_capacity);
                status.set(FifoControl::EMPTY, state.sent.is_empty());
                status.bits()
            }
            I2A_CONTROL => {
                if state.inbound.is_empty() {
                    FifoControl::EMPTY.bits()
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn write(&self, offset: usize, value: u32) {
        if offset == CPU_CONTROL {
            self.state.lock().cpu_control = value;
        }
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut state = self.state.lock();
        match offset {
            I2A_MBOX_DATA => state.inbound.front().map_or(0, |m| m.msg),
            I2A_MBOX_INFO => state.inbound.pop_front().map_or(0, |m| m.info),
            _ => 0,
        }
    }

    fn write_u64(&self, offset: usize, value: u64) {
        let mut state = self.state.lock();
        match offset {
            A2I_MBOX_DATA => state.tx_latch = value,
            A2I_MBOX_INFO => {
                let msg = state.tx_latch;
                state.sent.push(Message { msg, info: value });
            }
            _ => {}
        }
    }
}

/// Knobs for [`Rig::probe`].
#[derive(Clone, Debug)]
pub struct RigOptions {
    pub cpu_running: bool,
    pub tx_backlog_depth: Option<usize>,
    pub shmem_window: MmioWindow,
    pub without_sart: bool,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            cpu_running: false,
            tx_backlog_depth: None,
            shmem_window: MmioWindow::new(0x2_1000_0000, 0x4000),
            without_sart: false,
        }
    }
}

/// A mailbox probed on fake hardware, with every resource variant supplied.
pub struct Rig {
    pub mailbox: Mailbox,
    pub fake: FakeAsc,
    pub send_irq: Arc<MockIrq>,
    pub recv_irq: Arc<MockIrq>,
    pub sart: Arc<MockBus>,
    pub shmem_bus: Arc<MockBus>,
}

impl Rig {
    pub fn probe(compatible: &str, options: RigOptions) -> Result<Self> {
        let mut config = MailboxConfig::for_compatible(compatible)
            .map_err(|_| crate::Error::MissingResource("known compatible"))?
            .with_shmem_window(options.shmem_window);
        if let Some(depth) = options.tx_backlog_depth {
            config.tx_backlog_depth = depth;
        }

        let fake = FakeAsc::new();
        fake.set_cpu_running(options.cpu_running);
        let send_irq = Arc::new(MockIrq::new(false));
        let recv_irq = Arc::new(MockIrq::new(false));
        let sart = Arc::new(MockBus::new());
        let shmem_bus = Arc::new(MockBus::new());

        let mut resources = MailboxResources::new(
            Box::new(fake.clone()),
            Box::new(Arc::clone(&send_irq)),
            Box::new(Arc::clone(&recv_irq)),
        )
        .with_dma(Arc::new(VecDmaAllocator::new(0x8_0000_0000)))
        .with_shmem_bus(Box::new(Arc::clone(&shmem_bus)));
        if !options.without_sart {
            resources = resources.with_sart(Box::new(Arc::clone(&sart)));
        }

        let mailbox = Mailbox::probe(config, resources)?;
        Ok(Self { mailbox, fake, send_irq, recv_irq, sart, shmem_bus })
    }

    /// Services interrupts and the deferred worker until inbound traffic settles.
    pub fn pump(&self) {
        for _ in 0..4096 {
            if self.send_irq.is_enabled() {
                self.mailbox.handle_send_irq();
            }
            if self.recv_irq.is_enabled() {
                self.mailbox.handle_recv_irq();
            }
            let delivered = self.mailbox.run_deferred();
            if delivered == 0 && self.fake.pending_inbound() == 0 {
                return;
            }
        }
    }

    /// Injects one message and pumps.
    pub fn deliver(&self, endpoint: EndpointId, msg: u64) {
        self.fake.inject(Message::new(endpoint, msg));
        self.pump();
    }

    /// Plays the coprocessor's side of the management handshake announcing
    /// `endpoints`, and returns everything the host sent meanwhile.
    pub fn boot(&self, endpoints: &[u8]) -> Vec<Message> {
        let mgmt = |raw: u64| self.fake.inject(Message::new(EndpointId::MGMT, raw));
        mgmt(MgmtMsg::Hello { tag: 0x1234 }.encode());

        let mut bitmaps = [0u32; 8];
        for ep in endpoints {
            bitmaps[(*ep / 32) as usize] |= 1 << (ep % 32);
        }
        let mut bases: Vec<u8> = (0..8u8).filter(|b| bitmaps[*b as usize] != 0).collect();
        if bases.is_empty() {
            bases.push(0);
        }
        for (i, base) in bases.iter().enumerate() {
            mgmt(
                MgmtMsg::EpMap {
                    base: *base,
                    bitmap: bitmaps[*base as usize],
                    last: i + 1 == bases.len(),
                }
                .encode(),
            );
        }
        mgmt(MgmtMsg::BootDone.encode());
        mgmt(MgmtMsg::BootDone2.encode());
        self.pump();
        self.fake.take_sent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_fifo_is_destructive_on_info_read() {
        let fake = FakeAsc::new();
        fake.inject(Message::new(EndpointId(0x20), 0xabc));
        assert_eq!(fake.read_u64(I2A_MBOX_DATA), 0xabc);
        assert_eq!(fake.pending_inbound(), 1);
        assert_eq!(fake.read_u64(I2A_MBOX_INFO), 0x20);
        assert_eq!(fake.pending_inbound(), 0);
        assert_eq!(fake.read(I2A_CONTROL), FifoControl::EMPTY.bits());
    }
}
