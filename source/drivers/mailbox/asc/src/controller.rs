// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mailbox controller: wires the transport, queues, router and system
//! endpoint clients together and drives boot and shutdown.
//!
//! Interrupt entry points ([`Mailbox::handle_recv_irq`],
//! [`Mailbox::handle_send_irq`]) only touch spin-locked state. Everything
//! else, including every client callback, runs from
//! [`Mailbox::run_deferred`], which admits one caller at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use nexus_hal::{Bus, DmaAllocator};
use nexus_sync::SpinLock;
use parking_lot::{Condvar, Mutex};

use crate::config::{MailboxConfig, ShmemKind};
use crate::crashlog::{Crashlog, CrashlogClient, CrashlogStore};
use crate::ioreport::IoReportClient;
use crate::mgmt::{BootState, EndpointSet, ManagementClient, ManagementProtocol, ReadySignal};
use crate::msg::{EndpointId, Message, MgmtMsg, MGMT_SHUTDOWN, MGMT_WAKEUP};
use crate::queue::{recv_queue, RecvConsumer, RecvProducer};
use crate::router::{Channel, EndpointClient, EndpointRouter, Outbox};
use crate::sart::SartAllowList;
use crate::shmem::{CoherentDma, IoMapped, SartDma, ShmemBackend, ShmemNegotiator};
use crate::syslog::{SyslogClient, SyslogHistory, SyslogRecord};
use crate::transport::{HardwareTransport, Irq, RegisterBlock};
use crate::{Error, IrqReturn, Result};

/// Hardware handed to [`Mailbox::probe`].
pub struct MailboxResources {
    pub regs: RegisterBlock,
    pub can_send_irq: Irq,
    pub can_recv_irq: Irq,
    /// Needed by the coherent and SART DMA variants.
    pub dma: Option<Arc<dyn DmaAllocator + Send + Sync>>,
    /// SART register block; needed by the SART DMA variant.
    pub sart: Option<Box<dyn Bus + Send + Sync>>,
    /// Aperture over the shared memory window; needed by the I/O-mapped variant.
    pub shmem_bus: Option<Box<dyn Bus + Send + Sync>>,
}

impl MailboxResources {
    pub fn new(regs: RegisterBlock, can_send_irq: Irq, can_recv_irq: Irq) -> Self {
        Self { regs, can_send_irq, can_recv_irq, dma: None, sart: None, shmem_bus: None }
    }

    pub fn with_dma(mut self, dma: Arc<dyn DmaAllocator + Send + Sync>) -> Self {
        self.dma = Some(dma);
        self
    }

    pub fn with_sart(mut self, sart: Box<dyn Bus + Send + Sync>) -> Self {
        self.sart = Some(sart);
        self
    }

    pub fn with_shmem_bus(mut self, bus: Box<dyn Bus + Send + Sync>) -> Self {
        self.shmem_bus = Some(bus);
        self
    }
}

/// Transmit path: direct FIFO writes, or a bounded backlog flushed from the
/// can-send interrupt while the FIFO is full.
struct TxPath {
    transport: Arc<HardwareTransport>,
    backlog: SpinLock<VecDeque<Message>>,
    depth: usize,
    ready: Arc<ReadySignal>,
}

impl TxPath {
    fn flush(&self) {
        let mut backlog = self.backlog.lock();
        while self.transport.can_send() {
            match backlog.pop_front() {
                Some(message) => self.transport.send(message),
                None => break,
            }
        }
        self.transport.set_send_irq(!backlog.is_empty());
    }

    fn pending(&self) -> usize {
        self.backlog.lock().len()
    }
}

impl Outbox for TxPath {
    fn post(&self, message: Message) -> Result<()> {
        let mut backlog = self.backlog.lock();
        if backlog.is_empty() && self.transport.can_send() {
            self.transport.send(message);
            return Ok(());
        }
        if backlog.len() >= self.depth {
            return Err(Error::TransportBusy);
        }
        backlog.push_back(message);
        self.transport.set_send_irq(true);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }
}

/// Wakes the deferred worker thread.
#[derive(Default)]
struct Doorbell {
    rung: Mutex<bool>,
    cond: Condvar,
}

impl Doorbell {
    fn ring(&self) {
        *self.rung.lock() = true;
        self.cond.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut rung = self.rung.lock();
        if !*rung {
            let _ = self.cond.wait_for(&mut rung, timeout);
        }
        *rung = false;
    }
}

struct Shared {
    config: MailboxConfig,
    transport: Arc<HardwareTransport>,
    tx: Arc<TxPath>,
    producer: RecvProducer,
    consumer: RecvConsumer,
    router: Mutex<EndpointRouter>,
    worker: Mutex<()>,
    mgmt: Option<Arc<Mutex<ManagementProtocol>>>,
    ready: Arc<ReadySignal>,
    shmem: Option<Arc<ShmemNegotiator>>,
    syslog: SyslogHistory,
    crashlogs: CrashlogStore,
    doorbell: Doorbell,
}

#[derive(Clone)]
pub struct Mailbox {
    shared: Arc<Shared>,
}

fn build_backend(
    config: &MailboxConfig,
    resources: &mut MailboxResources,
) -> Result<Option<Box<dyn ShmemBackend>>> {
    let backend: Box<dyn ShmemBackend> = match config.variant.shmem {
        ShmemKind::None => return Ok(None),
        ShmemKind::CoherentDma => {
            let dma = resources.dma.clone().ok_or(Error::MissingResource("DMA allocator"))?;
            Box::new(CoherentDma::new(dma))
        }
        ShmemKind::SartDma => {
            let dma = resources.dma.clone().ok_or(Error::MissingResource("DMA allocator"))?;
            let sart = resources.sart.take().ok_or(Error::MissingResource("SART"))?;
            Box::new(SartDma::new(dma, SartAllowList::new(sart)))
        }
        ShmemKind::IoMapped => {
            let window = config.shmem_window.ok_or(Error::MissingResource("shared memory window"))?;
            let bus = resources.shmem_bus.take().ok_or(Error::MissingResource("shared memory bus"))?;
            Box::new(IoMapped::new(window, bus))
        }
    };
    Ok(Some(backend))
}

impl Mailbox {
    /// Builds the controller and starts the coprocessor.
    pub fn probe(config: MailboxConfig, mut resources: MailboxResources) -> Result<Self> {
        let backend = build_backend(&config, &mut resources)?;
        let shmem = backend.map(|b| Arc::new(ShmemNegotiator::new(b)));
        let MailboxResources { regs, can_send_irq, can_recv_irq, .. } = resources;

        let transport = Arc::new(HardwareTransport::new(regs, can_send_irq, can_recv_irq));
        transport.set_send_irq(false);
        let ready = Arc::new(ReadySignal::new());
        let tx = Arc::new(TxPath {
            transport: Arc::clone(&transport),
            backlog: SpinLock::new(VecDeque::with_capacity(config.tx_backlog_depth)),
            depth: config.tx_backlog_depth,
            ready: Arc::clone(&ready),
        });
        let (producer, consumer) = recv_queue(config.recv_queue_depth);
        let mut router = EndpointRouter::new(config.max_channels, tx.clone());

        let syslog = SyslogHistory::default();
        let crashlogs = CrashlogStore::default();
        let mgmt = if config.variant.rtkit {
            let protocol = Arc::new(Mutex::new(ManagementProtocol::new(Arc::clone(&ready))));
            router.register(EndpointId::MGMT, Box::new(ManagementClient::new(protocol.clone())))?;
            router.register(
                EndpointId::CRASHLOG,
                Box::new(CrashlogClient::new(shmem.clone(), crashlogs.clone())),
            )?;
            router.register(
                EndpointId::SYSLOG,
                Box::new(SyslogClient::new(shmem.clone(), syslog.clone())),
            )?;
            router.register(EndpointId::IOREPORT, Box::new(IoReportClient::new(shmem.clone())))?;
            Some(protocol)
        } else {
            None
        };

        let mailbox = Self {
            shared: Arc::new(Shared {
                config,
                transport,
                tx,
                producer,
                consumer,
                router: Mutex::new(router),
                worker: Mutex::new(()),
                mgmt,
                ready,
                shmem,
                syslog,
                crashlogs,
                doorbell: Doorbell::default(),
            }),
        };
        mailbox.boot()?;
        Ok(mailbox)
    }

    fn boot(&self) -> Result<()> {
        let shared = &self.shared;
        shared.transport.set_recv_irq(true);
        if !shared.config.variant.rtkit {
            shared.transport.cpu_enable();
            shared.ready.complete();
            info!("asc-mailbox: coprocessor started without management protocol");
            return Ok(());
        }
        if shared.transport.cpu_is_enabled() {
            info!("asc-mailbox: coprocessor already running, sending wakeup");
            shared.tx.post(Message::new(EndpointId::MGMT, MGMT_WAKEUP))
        } else {
            debug!("asc-mailbox: starting coprocessor CPU");
            shared.transport.cpu_enable();
            Ok(())
        }
    }

    /// Can-recv interrupt handler. Never blocks.
    pub fn handle_recv_irq(&self) -> IrqReturn {
        let ret = self.shared.producer.fill_from(&self.shared.transport);
        if ret == IrqReturn::WakeThread {
            self.shared.doorbell.ring();
        }
        ret
    }

    /// Can-send interrupt handler. Never blocks.
    pub fn handle_send_irq(&self) {
        self.shared.tx.flush();
    }

    /// Delivers queued messages to their endpoints. Returns how many were
    /// delivered; returns 0 at once if another caller is already draining.
    pub fn run_deferred(&self) -> usize {
        let shared = &self.shared;
        let Some(_worker) = shared.worker.try_lock() else {
            return 0;
        };
        shared.consumer.drain(&shared.transport, |message| {
            // Unknown endpoints are logged by the router.
            let _ = shared.router.lock().dispatch(message);
        })
    }

    /// Runs [`run_deferred`](Self::run_deferred) on a thread woken by the receive interrupt.
    pub fn spawn_worker(&self) -> DeferredWorker {
        let stop = Arc::new(AtomicBool::new(false));
        let mailbox = self.clone();
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !thread_stop.load(Ordering::Acquire) {
                mailbox.shared.doorbell.wait(Duration::from_millis(50));
                mailbox.run_deferred();
            }
        });
        DeferredWorker { mailbox: self.clone(), stop, handle: Some(handle) }
    }

    /// Binds a client endpoint. System endpoints are reserved under RTKit.
    pub fn request_channel(
        &self,
        endpoint: EndpointId,
        client: Box<dyn EndpointClient>,
    ) -> Result<Channel> {
        if self.shared.config.variant.rtkit && endpoint.is_system() {
            return Err(Error::ReservedEndpoint(endpoint));
        }
        self.shared.router.lock().register(endpoint, client)
    }

    /// Abandons a channel. Messages for it are dropped from now on.
    pub fn release_channel(&self, endpoint: EndpointId) -> bool {
        self.shared.router.lock().release(endpoint)
    }

    /// Asks the coprocessor to start an endpoint it announced.
    pub fn start_endpoint(&self, endpoint: EndpointId) -> Result<()> {
        let mgmt = self.shared.mgmt.as_ref().ok_or(Error::NotReady)?;
        mgmt.lock().check_startable(endpoint)?;
        self.shared.tx.post(Message::new(EndpointId::MGMT, MgmtMsg::StartEp { endpoint }.encode()))
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.is_ready()
    }

    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        self.shared.ready.wait_timeout(timeout)
    }

    /// Ready timeout from the configuration.
    pub fn ready_timeout(&self) -> Duration {
        self.shared.config.ready_timeout
    }

    pub fn boot_state(&self) -> BootState {
        match &self.shared.mgmt {
            Some(mgmt) => mgmt.lock().state(),
            None if self.is_ready() => BootState::Ready,
            None => BootState::Cold,
        }
    }

    pub fn discovered_endpoints(&self) -> EndpointSet {
        self.shared.mgmt.as_ref().map(|m| m.lock().discovered().clone()).unwrap_or_default()
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.shared.config
    }

    pub fn shared_memory(&self) -> Option<Arc<ShmemNegotiator>> {
        self.shared.shmem.clone()
    }

    pub fn syslog_records(&self) -> Vec<SyslogRecord> {
        self.shared.syslog.snapshot()
    }

    pub fn crashlogs(&self) -> Vec<Crashlog> {
        self.shared.crashlogs.snapshot()
    }

    /// Messages parked until the FIFO drains.
    pub fn tx_backlog(&self) -> usize {
        self.shared.tx.pending()
    }

    /// Discards inbound traffic, sends the shutdown pair and masks both interrupts.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let transport = &shared.transport;
        let dropped = shared.consumer.discard(transport);
        while transport.can_recv() {
            transport.recv();
        }
        if shared.config.variant.rtkit {
            for msg in MGMT_SHUTDOWN {
                if transport.can_send() {
                    transport.send(Message::new(EndpointId::MGMT, msg));
                } else {
                    warn!("asc-mailbox: FIFO full, shutdown message {msg:#018x} not sent");
                }
            }
        }
        while transport.can_recv() {
            transport.recv();
        }
        transport.set_recv_irq(false);
        transport.set_send_irq(false);
        debug!("asc-mailbox: shut down, {dropped} queued messages dropped");
    }
}

/// Handle for the thread started by [`Mailbox::spawn_worker`]. Stops it on drop.
pub struct DeferredWorker {
    mailbox: Mailbox,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeferredWorker {
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.mailbox.shared.doorbell.ring();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("asc-mailbox: deferred worker panicked");
            }
        }
    }
}

impl Drop for DeferredWorker {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{BufferRequest, MGMT_STARTEP};
    use crate::testing::{Rig, RigOptions};
    use nexus_hal::IrqLine;
    use std::time::Instant;

    const DCP: EndpointId = EndpointId(0x37);

    struct Collect(Arc<Mutex<Vec<u64>>>);

    impl EndpointClient for Collect {
        fn received(&mut self, _channel: &Channel, msg: u64) {
            self.0.lock().push(msg);
        }
    }

    fn rtkit() -> Rig {
        Rig::probe("apple,t8103-rtkit-mailbox", RigOptions::default()).expect("probe")
    }

    #[test]
    fn cold_probe_starts_cpu_without_traffic() {
        let rig = rtkit();
        assert!(rig.fake.cpu_running());
        assert!(rig.fake.take_sent().is_empty());
        assert_eq!(rig.mailbox.boot_state(), BootState::Cold);
        assert!(!rig.mailbox.is_ready());
    }

    #[test]
    fn running_cpu_gets_wakeup() {
        let rig = Rig::probe(
            "apple,t8103-rtkit-mailbox",
            RigOptions { cpu_running: true, ..RigOptions::default() },
        )
        .expect("probe");
        assert_eq!(rig.fake.take_sent(), vec![Message::new(EndpointId::MGMT, MGMT_WAKEUP)]);
    }

    #[test]
    fn handshake_reaches_ready() {
        let rig = rtkit();
        let sent = rig.boot(&[0, 1, 2, 3, 4, 0x37, 0x41]);
        let mgmt: Vec<u64> = sent.iter().filter(|m| m.endpoint() == EndpointId::MGMT).map(|m| m.msg).collect();
        let starts: Vec<u64> = mgmt
            .iter()
            .filter(|raw| crate::msg::msg_type(**raw) == MGMT_STARTEP)
            .copied()
            .collect();
        assert_eq!(
            starts,
            [1u8, 2, 3, 4, 0x37, 0x41]
                .map(|ep| MgmtMsg::StartEp { endpoint: EndpointId(ep) }.encode())
                .to_vec()
        );
        assert_eq!(mgmt[0], MgmtMsg::HelloReply { tag: 0x1234 }.encode());
        assert_eq!(*mgmt.last().expect("boot-done ack"), MgmtMsg::BootDoneAck.encode());
        assert!(rig.mailbox.is_ready());
        assert_eq!(rig.mailbox.boot_state(), BootState::Ready);
        assert_eq!(rig.mailbox.wait_ready(Duration::from_millis(1)), Ok(()));
        assert!(rig.mailbox.discovered_endpoints().contains(DCP));
    }

    #[test]
    fn wait_ready_times_out_before_handshake() {
        let rig = rtkit();
        assert_eq!(rig.mailbox.wait_ready(Duration::from_millis(5)), Err(Error::TimedOut));
    }

    #[test]
    fn base_variant_is_ready_after_cpu_start() {
        let rig = Rig::probe("apple,t8103-sepos-mailbox", RigOptions::default()).expect("probe");
        assert!(rig.fake.cpu_running());
        assert!(rig.mailbox.is_ready());
        assert_eq!(rig.mailbox.boot_state(), BootState::Ready);
        let log = Arc::new(Mutex::new(Vec::new()));
        rig.mailbox
            .request_channel(EndpointId(3), Box::new(Collect(log.clone())))
            .expect("low endpoints are free without RTKit");
        rig.deliver(EndpointId(3), 9);
        assert_eq!(*log.lock(), vec![9]);
    }

    #[test]
    fn system_endpoints_are_reserved() {
        let rig = rtkit();
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = rig
            .mailbox
            .request_channel(EndpointId::SYSLOG, Box::new(Collect(log.clone())))
            .expect_err("reserved");
        assert_eq!(err, Error::ReservedEndpoint(EndpointId::SYSLOG));
        rig.mailbox.request_channel(DCP, Box::new(Collect(log.clone()))).expect("user endpoint");
        assert_eq!(
            rig.mailbox.request_channel(DCP, Box::new(Collect(log))).expect_err("busy"),
            Error::EndpointBusy(DCP)
        );
    }

    #[test]
    fn unknown_endpoint_does_not_disturb_others() {
        let rig = rtkit();
        let log = Arc::new(Mutex::new(Vec::new()));
        rig.mailbox.request_channel(DCP, Box::new(Collect(log.clone()))).expect("channel");
        rig.fake.inject(Message::new(EndpointId(0x50), 1));
        rig.fake.inject(Message::new(DCP, 2));
        rig.pump();
        assert_eq!(*log.lock(), vec![2]);
    }

    #[test]
    fn released_channel_drops_traffic() {
        let rig = rtkit();
        let log = Arc::new(Mutex::new(Vec::new()));
        rig.mailbox.request_channel(DCP, Box::new(Collect(log.clone()))).expect("channel");
        assert!(rig.mailbox.release_channel(DCP));
        rig.deliver(DCP, 1);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn backlog_flushes_from_send_interrupt() {
        let rig = rtkit();
        let channel = rig
            .mailbox
            .request_channel(DCP, Box::new(Collect(Arc::new(Mutex::new(Vec::new())))))
            .expect("channel");
        rig.fake.set_tx_capacity(1);
        channel.send(1).expect("direct");
        channel.send(2).expect("parked");
        channel.send(3).expect("parked");
        assert_eq!(rig.mailbox.tx_backlog(), 2);
        assert!(rig.send_irq.is_enabled());

        assert_eq!(rig.fake.take_sent(), vec![Message::new(DCP, 1)]);
        rig.mailbox.handle_send_irq();
        assert_eq!(rig.fake.take_sent(), vec![Message::new(DCP, 2)]);
        rig.mailbox.handle_send_irq();
        assert_eq!(rig.fake.take_sent(), vec![Message::new(DCP, 3)]);
        rig.mailbox.handle_send_irq();
        assert!(!rig.send_irq.is_enabled());
        assert_eq!(rig.mailbox.tx_backlog(), 0);
    }

    #[test]
    fn full_backlog_reports_busy() {
        let rig = Rig::probe(
            "apple,t8103-rtkit-mailbox",
            RigOptions { tx_backlog_depth: Some(1), ..RigOptions::default() },
        )
        .expect("probe");
        let channel = rig
            .mailbox
            .request_channel(DCP, Box::new(Collect(Arc::new(Mutex::new(Vec::new())))))
            .expect("channel");
        rig.fake.set_tx_capacity(0);
        channel.send(1).expect("parked");
        assert_eq!(channel.send(2), Err(Error::TransportBusy));
    }

    #[test]
    fn start_endpoint_requires_discovery() {
        let rig = rtkit();
        rig.boot(&[0x37]);
        rig.mailbox.start_endpoint(DCP).expect("announced");
        assert_eq!(
            rig.fake.take_sent(),
            vec![Message::new(EndpointId::MGMT, MgmtMsg::StartEp { endpoint: DCP }.encode())]
        );
        assert_eq!(
            rig.mailbox.start_endpoint(EndpointId(0x38)),
            Err(Error::EndpointNotPermitted(EndpointId(0x38)))
        );
    }

    #[test]
    fn syslog_entries_are_read_and_echoed() {
        let rig = rtkit();
        rig.deliver(EndpointId::SYSLOG, BufferRequest { size: 0x1000, iova: 0 }.encode());
        let reply = rig.fake.take_sent();
        assert_eq!(reply.len(), 1);
        assert_eq!(BufferRequest::decode(reply[0].msg).size, 0x1000);

        // 4 entries of 0x20 + 0x40 bytes.
        rig.deliver(EndpointId::SYSLOG, 0x0080_0000_4000_0004);
        let shmem = rig.mailbox.shared_memory().expect("shared memory");
        let entry = 2 * 0x60;
        shmem.write_host(EndpointId::SYSLOG, entry + 8, b"dcpexp\0").expect("context");
        shmem.write_host(EndpointId::SYSLOG, entry + 0x20, b"swap complete\n\0").expect("message");

        let log_msg = 0x0050_0000_0000_0002;
        rig.deliver(EndpointId::SYSLOG, log_msg);
        assert_eq!(rig.fake.take_sent(), vec![Message::new(EndpointId::SYSLOG, log_msg)]);
        assert_eq!(
            rig.mailbox.syslog_records(),
            vec![SyslogRecord { context: "dcpexp".into(), message: "swap complete".into() }]
        );

        // Out-of-range slots are still released.
        rig.deliver(EndpointId::SYSLOG, 0x0050_0000_0000_0009);
        assert_eq!(rig.fake.take_sent().len(), 1);
        assert_eq!(rig.mailbox.syslog_records().len(), 1);
    }

    #[test]
    fn second_crashlog_request_captures_dump() {
        let rig = rtkit();
        let request = BufferRequest { size: 0x1000, iova: 0 }.encode();
        rig.deliver(EndpointId::CRASHLOG, request);
        assert_eq!(rig.fake.take_sent().len(), 1);

        let shmem = rig.mailbox.shared_memory().expect("shared memory");
        let mut header = [0u8; 32];
        header[0..4].copy_from_slice(&crate::crashlog::CRASHLOG_MAGIC.to_le_bytes());
        header[8..12].copy_from_slice(&0x40u32.to_le_bytes());
        shmem.write_host(EndpointId::CRASHLOG, 0, &header).expect("header");

        rig.deliver(EndpointId::CRASHLOG, request);
        assert!(rig.fake.take_sent().is_empty());
        let logs = rig.mailbox.crashlogs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].name, "crashlog.0");
        assert_eq!(logs[0].data.len(), 0x40);
    }

    #[test]
    fn bad_crashlog_header_captures_whole_buffer() {
        let rig = rtkit();
        let request = BufferRequest { size: 0x1000, iova: 0 }.encode();
        rig.deliver(EndpointId::CRASHLOG, request);
        rig.fake.take_sent();
        let shmem = rig.mailbox.shared_memory().expect("shared memory");

        shmem.write_host(EndpointId::CRASHLOG, 0, &[0xde, 0xad, 0xbe, 0xef]).expect("magic");
        rig.deliver(EndpointId::CRASHLOG, request);

        let mut header = [0u8; 32];
        header[0..4].copy_from_slice(&crate::crashlog::CRASHLOG_MAGIC.to_le_bytes());
        header[8..12].copy_from_slice(&0x10_0000u32.to_le_bytes());
        shmem.write_host(EndpointId::CRASHLOG, 0, &header).expect("header");
        rig.deliver(EndpointId::CRASHLOG, request);

        let logs = rig.mailbox.crashlogs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].data.len(), 0x1000);
        assert_eq!(&logs[0].data[..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(logs[1].name, "crashlog.1");
        assert_eq!(logs[1].data.len(), 0x1000);
    }

    #[test]
    fn receive_irq_returns_after_overflow() {
        let rig = rtkit();
        let log = Arc::new(Mutex::new(Vec::new()));
        rig.mailbox.request_channel(DCP, Box::new(Collect(log.clone()))).expect("channel");
        for i in 0..20 {
            rig.fake.inject(Message::new(DCP, i));
        }

        assert_eq!(rig.mailbox.handle_recv_irq(), IrqReturn::WakeThread);
        assert!(!rig.recv_irq.is_enabled());
        assert_eq!(rig.fake.pending_inbound(), 4);

        assert_eq!(rig.mailbox.run_deferred(), 16);
        assert!(rig.recv_irq.is_enabled());
        assert_eq!(rig.fake.pending_inbound(), 4);

        rig.pump();
        assert_eq!(*log.lock(), (0..20).collect::<Vec<u64>>());
    }

    #[test]
    fn ioreport_echoes_notifications() {
        let rig = rtkit();
        rig.deliver(EndpointId::IOREPORT, 0x0080_0000_0000_0001);
        rig.deliver(EndpointId::IOREPORT, 0x00c0_0000_0000_0002);
        rig.deliver(EndpointId::IOREPORT, 0x0030_0000_0000_0000);
        assert_eq!(
            rig.fake.take_sent(),
            vec![
                Message::new(EndpointId::IOREPORT, 0x0080_0000_0000_0001),
                Message::new(EndpointId::IOREPORT, 0x00c0_0000_0000_0002),
            ]
        );
    }

    #[test]
    fn iomem_variant_denies_out_of_window_buffers() {
        let rig = Rig::probe("apple,t8103-smc-mailbox", RigOptions::default()).expect("probe");
        let window = rig.mailbox.config().shmem_window.expect("window");
        rig.deliver(
            EndpointId::IOREPORT,
            BufferRequest { size: 0x1000, iova: window.end() }.encode(),
        );
        assert_eq!(rig.fake.take_sent(), vec![Message::new(EndpointId::IOREPORT, BufferRequest::denied())]);

        let exact = BufferRequest { size: window.size() as usize, iova: window.base() }.encode();
        rig.deliver(EndpointId::SYSLOG, exact);
        assert_eq!(rig.fake.take_sent(), vec![Message::new(EndpointId::SYSLOG, exact)]);
    }

    #[test]
    fn sart_variant_requires_sart_resource() {
        let err = Rig::probe(
            "apple,t8103-ans-mailbox",
            RigOptions { without_sart: true, ..RigOptions::default() },
        )
        .err();
        assert_eq!(err, Some(Error::MissingResource("SART")));
    }

    #[test]
    fn shutdown_sends_pair_and_masks() {
        let rig = rtkit();
        rig.fake.inject(Message::new(EndpointId::MGMT, 0));
        rig.mailbox.shutdown();
        assert_eq!(
            rig.fake.take_sent(),
            MGMT_SHUTDOWN.map(|msg| Message::new(EndpointId::MGMT, msg)).to_vec()
        );
        assert_eq!(rig.fake.pending_inbound(), 0);
        assert!(!rig.recv_irq.is_enabled());
    }

    #[test]
    fn worker_thread_drains_on_interrupt() {
        let rig = rtkit();
        let log = Arc::new(Mutex::new(Vec::new()));
        rig.mailbox.request_channel(DCP, Box::new(Collect(log.clone()))).expect("channel");
        let worker = rig.mailbox.spawn_worker();
        rig.fake.inject(Message::new(DCP, 7));
        assert_eq!(rig.mailbox.handle_recv_irq(), IrqReturn::WakeThread);

        let deadline = Instant::now() + Duration::from_secs(5);
        while log.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        worker.stop();
        assert_eq!(*log.lock(), vec![7]);
    }
}
