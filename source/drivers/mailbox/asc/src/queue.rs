// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded receive queue between the interrupt half and the deferred worker.
//!
//! The producer drains the hardware FIFO under a spin lock and never blocks.
//! When the queue is full it masks the can-recv interrupt and leaves the
//! rest of the messages in hardware; the consumer unmasks it again as soon
//! as it has made room. Arrival order is preserved end to end.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use nexus_sync::SpinLock;

use crate::msg::Message;
use crate::transport::HardwareTransport;
use crate::IrqReturn;

/// Default queue depth.
pub const RECV_QUEUE_DEPTH: usize = 16;

struct QueueState {
    fifo: VecDeque<Message>,
    capacity: usize,
    /// The can-recv interrupt is masked because the queue filled up.
    recv_full: bool,
    overflows: u64,
}

/// Creates the two halves of a receive queue holding at most `capacity` messages.
pub fn recv_queue(capacity: usize) -> (RecvProducer, RecvConsumer) {
    let capacity = capacity.max(1);
    let shared = Arc::new(SpinLock::new(QueueState {
        fifo: VecDeque::with_capacity(capacity),
        capacity,
        recv_full: false,
        overflows: 0,
    }));
    (RecvProducer { shared: Arc::clone(&shared) }, RecvConsumer { shared })
}

/// Interrupt half.
pub struct RecvProducer {
    shared: Arc<SpinLock<QueueState>>,
}

impl RecvProducer {
    /// Moves messages from hardware into the queue until either runs out.
    pub fn fill_from(&self, transport: &HardwareTransport) -> IrqReturn {
        let mut queued = false;
        while transport.can_recv() {
            let mut state = self.shared.lock();
            if state.fifo.len() >= state.capacity {
                transport.set_recv_irq(false);
                state.recv_full = true;
                state.overflows += 1;
                return IrqReturn::WakeThread;
            }
            state.fifo.push_back(transport.recv());
            queued = true;
        }
        if queued {
            IrqReturn::WakeThread
        } else {
            IrqReturn::Handled
        }
    }
}

/// Deferred-worker half.
pub struct RecvConsumer {
    shared: Arc<SpinLock<QueueState>>,
}

impl RecvConsumer {
    pub fn pop(&self) -> Option<Message> {
        self.shared.lock().fifo.pop_front()
    }

    /// Unmasks the can-recv interrupt if it was masked for overflow and
    /// the queue has room again.
    pub fn release_backpressure(&self, transport: &HardwareTransport) {
        let mut state = self.shared.lock();
        if state.recv_full && state.fifo.len() < state.capacity {
            state.recv_full = false;
            transport.set_recv_irq(true);
            debug!("asc-mailbox: receive queue has room, can-recv unmasked");
        }
    }

    /// Delivers every queued message in order, releasing back-pressure after
    /// each one. Returns the number delivered.
    pub fn drain(&self, transport: &HardwareTransport, mut deliver: impl FnMut(Message)) -> usize {
        let mut delivered = 0;
        while let Some(message) = self.pop() {
            deliver(message);
            delivered += 1;
            self.release_backpressure(transport);
        }
        delivered
    }

    /// Drops everything queued without delivering it.
    pub fn discard(&self, transport: &HardwareTransport) -> usize {
        let dropped = {
            let mut state = self.shared.lock();
            let n = state.fifo.len();
            state.fifo.clear();
            n
        };
        self.release_backpressure(transport);
        dropped
    }

    pub fn len(&self) -> usize {
        self.shared.lock().fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_backpressured(&self) -> bool {
        self.shared.lock().recv_full
    }

    /// How many times the queue filled up.
    pub fn overflows(&self) -> u64 {
        self.shared.lock().overflows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::EndpointId;
    use crate::testing::FakeAsc;
    use nexus_hal::mock::MockIrq;
    use nexus_hal::IrqLine;

    fn setup() -> (FakeAsc, Arc<MockIrq>, HardwareTransport) {
        let fake = FakeAsc::new();
        let recv_irq = Arc::new(MockIrq::new(true));
        let transport = HardwareTransport::new(
            Box::new(fake.clone()),
            Box::new(Arc::new(MockIrq::new(false))),
            Box::new(Arc::clone(&recv_irq)),
        );
        (fake, recv_irq, transport)
    }

    #[test]
    fn empty_fifo_is_handled_without_wake() {
        let (_fake, _irq, transport) = setup();
        let (producer, consumer) = recv_queue(RECV_QUEUE_DEPTH);
        assert_eq!(producer.fill_from(&transport), IrqReturn::Handled);
        assert!(consumer.is_empty());
    }

    #[test]
    fn overflow_masks_interrupt_and_loses_nothing() {
        let (fake, irq, transport) = setup();
        let (producer, consumer) = recv_queue(RECV_QUEUE_DEPTH);
        for i in 0..20 {
            fake.inject(Message::new(EndpointId(0x20), i));
        }

        assert_eq!(producer.fill_from(&transport), IrqReturn::WakeThread);
        assert_eq!(consumer.len(), 16);
        assert!(!irq.is_enabled());
        assert!(consumer.is_backpressured());
        assert_eq!(fake.pending_inbound(), 4);

        let mut seen = Vec::new();
        loop {
            // Level-triggered: the line fires whenever it is unmasked and data waits.
            if irq.is_enabled() {
                producer.fill_from(&transport);
            }
            if consumer.len() == RECV_QUEUE_DEPTH && fake.pending_inbound() > 0 {
                assert!(!irq.is_enabled());
            }
            match consumer.pop() {
                Some(message) => {
                    seen.push(message.msg);
                    consumer.release_backpressure(&transport);
                    assert!(irq.is_enabled());
                }
                None => break,
            }
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        assert_eq!(fake.pending_inbound(), 0);
        assert!(consumer.overflows() >= 1);
    }

    #[test]
    fn interrupt_stays_masked_while_full() {
        let (fake, irq, transport) = setup();
        let (producer, consumer) = recv_queue(2);
        for i in 0..3 {
            fake.inject(Message::new(EndpointId(0x20), i));
        }
        producer.fill_from(&transport);
        consumer.release_backpressure(&transport);
        assert!(!irq.is_enabled());
        assert_eq!(consumer.len(), 2);
    }

    #[test]
    fn discard_unmasks() {
        let (fake, irq, transport) = setup();
        let (producer, consumer) = recv_queue(1);
        fake.inject(Message::new(EndpointId(0x20), 1));
        fake.inject(Message::new(EndpointId(0x20), 2));
        producer.fill_from(&transport);
        assert!(!irq.is_enabled());
        assert_eq!(consumer.discard(&transport), 1);
        assert!(irq.is_enabled());
    }
}
