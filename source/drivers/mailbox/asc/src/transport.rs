// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! FIFO registers, CPU run bit and the two level-triggered interrupt lines.
//!
//! No protocol knowledge lives here. Callers serialise access; see
//! `controller` for the locks that wrap each direction.

use log::{error, trace};
use nexus_hal::{Bus, IrqLine};

use crate::msg::Message;
use crate::regs::{
    CpuControl, FifoControl, A2I_CONTROL, A2I_MBOX_DATA, A2I_MBOX_INFO, CPU_CONTROL, I2A_CONTROL,
    I2A_MBOX_DATA, I2A_MBOX_INFO,
};

pub type RegisterBlock = Box<dyn Bus + Send + Sync>;
pub type Irq = Box<dyn IrqLine + Send + Sync>;

pub struct HardwareTransport {
    regs: RegisterBlock,
    can_send_irq: Irq,
    can_recv_irq: Irq,
}

impl HardwareTransport {
    pub fn new(regs: RegisterBlock, can_send_irq: Irq, can_recv_irq: Irq) -> Self {
        Self { regs, can_send_irq, can_recv_irq }
    }

    fn status(&self, reg: usize) -> FifoControl {
        FifoControl::from_bits_retain(self.regs.read(reg))
    }

    pub fn can_send(&self) -> bool {
        !self.status(A2I_CONTROL).contains(FifoControl::FULL)
    }

    pub fn can_recv(&self) -> bool {
        !self.status(I2A_CONTROL).contains(FifoControl::EMPTY)
    }

    /// Writes one message. Only valid while [`can_send`](Self::can_send) holds.
    pub fn send(&self, message: Message) {
        if !self.can_send() {
            error!("asc-mailbox: send while A2I FIFO is full: {message:x?}");
        }
        trace!("asc-mailbox: tx ep {} msg {:#018x}", message.endpoint(), message.msg);
        self.regs.write_u64(A2I_MBOX_DATA, message.msg);
        self.regs.write_u64(A2I_MBOX_INFO, message.info);
    }

    /// Pops one message. Only valid while [`can_recv`](Self::can_recv) holds;
    /// the info read dequeues.
    pub fn recv(&self) -> Message {
        let msg = self.regs.read_u64(I2A_MBOX_DATA);
        let info = self.regs.read_u64(I2A_MBOX_INFO);
        let message = Message { msg, info };
        trace!("asc-mailbox: rx ep {} msg {:#018x}", message.endpoint(), msg);
        message
    }

    pub fn set_send_irq(&self, enabled: bool) {
        self.can_send_irq.set_enabled(enabled);
    }

    pub fn set_recv_irq(&self, enabled: bool) {
        self.can_recv_irq.set_enabled(enabled);
    }

    pub fn send_irq_enabled(&self) -> bool {
        self.can_send_irq.is_enabled()
    }

    pub fn recv_irq_enabled(&self) -> bool {
        self.can_recv_irq.is_enabled()
    }

    pub fn cpu_is_enabled(&self) -> bool {
        CpuControl::from_bits_retain(self.regs.read(CPU_CONTROL)).contains(CpuControl::RUN)
    }

    pub fn cpu_enable(&self) {
        let ctrl = CpuControl::from_bits_retain(self.regs.read(CPU_CONTROL)) | CpuControl::RUN;
        self.regs.write(CPU_CONTROL, ctrl.bits());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::EndpointId;
    use crate::testing::FakeAsc;
    use nexus_hal::mock::MockIrq;
    use std::sync::Arc;

    fn transport(fake: &FakeAsc) -> HardwareTransport {
        HardwareTransport::new(
            Box::new(fake.clone()),
            Box::new(Arc::new(MockIrq::new(false))),
            Box::new(Arc::new(MockIrq::new(true))),
        )
    }

    #[test]
    fn status_bits_follow_fifo_state() {
        let fake = FakeAsc::new();
        let transport = transport(&fake);
        assert!(transport.can_send());
        assert!(!transport.can_recv());

        fake.inject(Message::new(EndpointId(0x20), 7));
        assert!(transport.can_recv());
        assert_eq!(transport.recv(), Message::new(EndpointId(0x20), 7));
        assert!(!transport.can_recv());

        fake.set_tx_capacity(1);
        transport.send(Message::new(EndpointId::MGMT, 1));
        assert!(!transport.can_send());
        assert_eq!(fake.take_sent(), vec![Message::new(EndpointId::MGMT, 1)]);
        assert!(transport.can_send());
    }

    #[test]
    fn cpu_enable_sets_run_bit_only() {
        let fake = FakeAsc::new();
        let transport = transport(&fake);
        assert!(!transport.cpu_is_enabled());
        transport.cpu_enable();
        assert!(transport.cpu_is_enabled());
        assert!(fake.cpu_running());
    }
}
