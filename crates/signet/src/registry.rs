use std::{
    io,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use mio::{Events, Poll};
use signet_transport::{
    Backend, Link, RdmaConfig, RdmaTransporter, ShmConfig, ShmTransporter, TcpConfig,
    TcpTransporter, TransporterCallback, TransporterKind,
};
use signet_utils::{ThreadPriority, safe_panic, thread_boot};
use signet_wire::{
    IoState, MAX_MESSAGE_SIZE, NodeId, Packer, QMGR_BLOCK, SectionSource, SignalHeader,
    SignalSink, TransporterError, unpack,
};
use tracing::{debug, info, warn};

/// Outcome of `prepare_send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    /// No transporter configured for that node id.
    UnknownNode,
    /// Output is halted for the peer and the signal is not for the
    /// management block.
    Blocked,
    Disconnected,
    MessageTooBig,
    /// Retries exhausted; the signal was dropped.
    SendBufferFull,
}

/// Registry-side connection lifecycle of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PerformPhase {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl PerformPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

fn io_state_from_u8(v: u8) -> IoState {
    match v {
        1 => IoState::HaltInput,
        2 => IoState::HaltOutput,
        3 => IoState::HaltIO,
        _ => IoState::NoHalt,
    }
}

pub(crate) struct PeerSlot {
    pub(crate) node: NodeId,
    pub(crate) kind: TransporterKind,
    phase: AtomicU8,
    io_state: AtomicU8,
    bad_data: AtomicBool,
    pub(crate) link: Mutex<Backend>,
}

impl PeerSlot {
    #[inline]
    pub(crate) fn phase(&self) -> PerformPhase {
        PerformPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    #[inline]
    fn set_phase(&self, phase: PerformPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    #[inline]
    fn io_state(&self) -> IoState {
        io_state_from_u8(self.io_state.load(Ordering::Acquire))
    }
}

pub(crate) struct Shared {
    pub(crate) local_node_id: NodeId,
    pub(crate) callback: Arc<dyn TransporterCallback>,
    pub(crate) peers: RwLock<Vec<Option<Arc<PeerSlot>>>>,
    run_clients: AtomicBool,
    pub(crate) run_service: AtomicBool,
    n_ring_backed: AtomicUsize,
    pub(crate) authenticator: Mutex<Option<Arc<dyn signet_transport::Authenticator>>>,
}

impl Shared {
    pub(crate) fn slot(&self, node: NodeId) -> Option<Arc<PeerSlot>> {
        self.peers.read().expect("peer table poisoned").get(usize::from(node))?.clone()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<PeerSlot>> {
        self.peers.read().expect("peer table poisoned").iter().flatten().cloned().collect()
    }
}

/// Owns every peer transporter and drives the cooperative I/O loop:
/// `external_io` polls receive readiness, unpacks and delivers inbound
/// signals, then pushes pending outbound data, while a background worker
/// drives client-side connects.
///
/// All of `prepare_send` / `external_io` and friends belong to one I/O
/// thread. `deliver_signal` runs inside `perform_receive`; a sink must not
/// call back into the registry for the peer it is currently receiving from.
pub struct TransporterRegistry {
    shared: Arc<Shared>,
    poll: Poll,
    events: Events,
    ready: Vec<NodeId>,
    pending: Vec<NodeId>,
    send_cursor: usize,
    spintime: Duration,
    clients_thread: Option<JoinHandle<()>>,
    service_thread: Option<JoinHandle<()>>,
}

impl TransporterRegistry {
    pub fn new(
        local_node_id: NodeId,
        callback: Arc<dyn TransporterCallback>,
    ) -> io::Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                local_node_id,
                callback,
                peers: RwLock::new(Vec::new()),
                run_clients: AtomicBool::new(false),
                run_service: AtomicBool::new(false),
                n_ring_backed: AtomicUsize::new(0),
                authenticator: Mutex::new(None),
            }),
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            ready: Vec::new(),
            pending: Vec::new(),
            send_cursor: 0,
            spintime: Duration::ZERO,
            clients_thread: None,
            service_thread: None,
        })
    }

    #[inline]
    pub fn local_node_id(&self) -> NodeId {
        self.shared.local_node_id
    }

    /// Install control-socket authentication. Applies to transporters
    /// created afterwards and to the server-side accept loop.
    pub fn set_authenticator(&self, auth: Arc<dyn signet_transport::Authenticator>) {
        *self.shared.authenticator.lock().expect("authenticator poisoned") = Some(auth);
    }

    fn insert(&mut self, node: NodeId, mut backend: Backend) -> io::Result<()> {
        if backend.init().is_err() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "transporter config invalid"));
        }
        backend.set_poller(self.poll.registry().try_clone()?);
        backend.core_mut().authenticator =
            self.shared.authenticator.lock().expect("authenticator poisoned").clone();

        let kind = backend.kind();
        let mut peers = self.shared.peers.write().expect("peer table poisoned");
        if peers.len() <= usize::from(node) {
            peers.resize_with(usize::from(node) + 1, || None);
        }
        if peers[usize::from(node)].is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "peer already configured"));
        }
        peers[usize::from(node)] = Some(Arc::new(PeerSlot {
            node,
            kind,
            phase: AtomicU8::new(PerformPhase::Disconnected as u8),
            io_state: AtomicU8::new(0),
            bad_data: AtomicBool::new(false),
            link: Mutex::new(backend),
        }));
        if matches!(kind, TransporterKind::Shm | TransporterKind::Rdma) {
            self.shared.n_ring_backed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn create_tcp_transporter(
        &mut self,
        remote: NodeId,
        remote_addr: std::net::SocketAddr,
        cfg: TcpConfig,
    ) -> io::Result<()> {
        let t = TcpTransporter::new(
            self.shared.local_node_id,
            remote,
            remote_addr,
            cfg,
            self.shared.callback.clone(),
        );
        self.insert(remote, Backend::Tcp(t))
    }

    pub fn create_shm_transporter(
        &mut self,
        remote: NodeId,
        remote_addr: std::net::SocketAddr,
        cfg: ShmConfig,
    ) -> io::Result<()> {
        self.spintime = self.spintime.max(Duration::from_micros(u64::from(cfg.spintime_us)));
        let t = ShmTransporter::new(
            self.shared.local_node_id,
            remote,
            remote_addr,
            cfg,
            self.shared.callback.clone(),
        );
        self.insert(remote, Backend::Shm(t))
    }

    pub fn create_rdma_transporter(
        &mut self,
        remote: NodeId,
        remote_addr: std::net::SocketAddr,
        cfg: RdmaConfig,
        adapters: Vec<Box<dyn signet_transport::DmaAdapter>>,
    ) -> io::Result<()> {
        let t = RdmaTransporter::new(
            self.shared.local_node_id,
            remote,
            remote_addr,
            cfg,
            adapters,
            self.shared.callback.clone(),
        );
        self.insert(remote, Backend::Rdma(t))
    }

    /// Nudge a peer towards connecting. Idempotent on every non-disconnected
    /// phase; the background worker picks it up from there.
    pub fn do_connect(&self, node: NodeId) {
        let Some(slot) = self.shared.slot(node) else { return };
        match slot.phase() {
            PerformPhase::Connected | PerformPhase::Connecting => {}
            PerformPhase::Disconnected | PerformPhase::Disconnecting => {
                slot.set_phase(PerformPhase::Connecting);
            }
        }
    }

    /// Nudge a peer towards teardown.
    pub fn do_disconnect(&self, node: NodeId) {
        let Some(slot) = self.shared.slot(node) else { return };
        match slot.phase() {
            PerformPhase::Disconnected | PerformPhase::Disconnecting => {}
            PerformPhase::Connected | PerformPhase::Connecting => {
                slot.set_phase(PerformPhase::Disconnecting);
            }
        }
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.shared.slot(node).is_some_and(|s| s.phase() == PerformPhase::Connected)
    }

    pub fn set_io_state(&self, node: NodeId, state: IoState) {
        if let Some(slot) = self.shared.slot(node) {
            slot.io_state.store(state as u8, Ordering::Release);
        }
    }

    pub fn io_state(&self, node: NodeId) -> IoState {
        self.shared.slot(node).map_or(IoState::NoHalt, |s| s.io_state())
    }

    /// Pack one signal into the peer's outgoing buffer.
    ///
    /// On a full buffer the insert is retried for up to 50 bounded waits
    /// before the signal is dropped with `SendBufferFull`.
    pub fn prepare_send<S: SectionSource>(
        &self,
        header: &SignalHeader,
        prio: u8,
        data: &[u32],
        node: NodeId,
        sections: &mut S,
    ) -> SendStatus {
        let Some(slot) = self.shared.slot(node) else { return SendStatus::UnknownNode };

        if slot.io_state().output_halted() && header.receiver_block != QMGR_BLOCK {
            debug!(node, block = header.receiver_block, "discarding signal, output halted");
            return SendStatus::Blocked;
        }
        if slot.phase() != PerformPhase::Connected {
            return SendStatus::Disconnected;
        }

        let mut link = slot.link.lock().expect("link poisoned");
        if !link.core().connected {
            return SendStatus::Disconnected;
        }

        let packer: Packer = link.core().packer;
        let len_bytes = packer.message_len_bytes(header, sections);
        if len_bytes > MAX_MESSAGE_SIZE {
            return SendStatus::MessageTooBig;
        }

        if let Some(region) = link.get_write_ptr(len_bytes, prio) {
            packer.pack(region, prio, header, data, sections);
            link.update_write_ptr(len_bytes, prio);
            return SendStatus::Ok;
        }

        // ring-backed peers are drained by a polling reader, so sleeping
        // here would only add latency; with pure TCP a short sleep lets the
        // kernel drain the socket
        let sleep = self.shared.n_ring_backed.load(Ordering::Relaxed) == 0;
        for _ in 0..50 {
            if sleep {
                std::thread::sleep(Duration::from_millis(2));
            }
            if let Some(region) = link.get_write_ptr(len_bytes, prio) {
                packer.pack(region, prio, header, data, sections);
                link.update_write_ptr(len_bytes, prio);
                // delivered late: let the embedder know the buffer is tight
                self.shared.callback.report_error(node, TransporterError::SendBufferFull);
                return SendStatus::Ok;
            }
            if !link.core().connected {
                return SendStatus::Disconnected;
            }
        }

        warn!(node, "signal lost, send buffer full");
        self.shared.callback.report_error(node, TransporterError::SignalLostSendBufferFull);
        SendStatus::SendBufferFull
    }

    /// One cooperative I/O cycle: wait up to `timeout` for inbound data,
    /// deliver it, then flush outbound buffers.
    pub fn external_io(&mut self, timeout: Duration) {
        if self.poll_receive(timeout) != 0 {
            self.perform_receive();
        }
        self.perform_send();
    }

    /// Readiness mask: bit 0 stream sockets, bit 1 shared memory, bit 2
    /// remote DMA. Peers left over from a backpressure stop count as ready.
    pub fn poll_receive(&mut self, timeout: Duration) -> u32 {
        self.ready.clear();
        let mut mask = 0u32;
        let slots = self.shared.snapshot();
        let has_rings = self.shared.n_ring_backed.load(Ordering::Relaxed) > 0;

        // ring-backed peers first: poll, optionally spinning for latency
        if has_rings {
            let spin_until = std::time::Instant::now() + self.spintime;
            loop {
                for slot in &slots {
                    if !matches!(slot.kind, TransporterKind::Shm | TransporterKind::Rdma)
                        || slot.phase() != PerformPhase::Connected
                        || self.ready.contains(&slot.node)
                    {
                        continue;
                    }
                    let Ok(link) = slot.link.try_lock() else { continue };
                    if link.has_data_to_read() {
                        mask |= kind_bit(slot.kind);
                        self.ready.push(slot.node);
                    }
                }
                if !self.ready.is_empty() || std::time::Instant::now() >= spin_until {
                    break;
                }
                std::hint::spin_loop();
            }
        }

        // sleep only when the rings are silent; shared-memory readers
        // announce the sleep so writers know to prod the wake socket
        let may_block = timeout > Duration::ZERO && self.ready.is_empty();
        if may_block {
            self.set_shm_awake(&slots, false);
        }
        let poll_timeout = if may_block { timeout } else { Duration::ZERO };
        if let Err(e) = self.poll.poll(&mut self.events, Some(poll_timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                safe_panic!("receive poll failed: {e}");
            }
        }
        if may_block {
            self.set_shm_awake(&slots, true);
        }

        for event in self.events.iter() {
            let node = event.token().0 as NodeId;
            let Some(slot) = slots.iter().find(|s| s.node == node) else { continue };
            mask |= kind_bit(slot.kind);
            if !self.ready.contains(&node) {
                self.ready.push(node);
            }
        }

        // rings may have filled while we slept
        if has_rings {
            for slot in &slots {
                if matches!(slot.kind, TransporterKind::Shm | TransporterKind::Rdma)
                    && slot.phase() == PerformPhase::Connected
                    && !self.ready.contains(&slot.node)
                {
                    let Ok(link) = slot.link.try_lock() else { continue };
                    if link.has_data_to_read() {
                        mask |= kind_bit(slot.kind);
                        self.ready.push(slot.node);
                    }
                }
            }
        }

        for node in &self.pending {
            if let Some(slot) = slots.iter().find(|s| s.node == *node) {
                mask |= kind_bit(slot.kind);
            }
        }
        mask
    }

    fn set_shm_awake(&self, slots: &[Arc<PeerSlot>], awake: bool) {
        for slot in slots {
            if slot.kind != TransporterKind::Shm || slot.phase() != PerformPhase::Connected {
                continue;
            }
            let Ok(link) = slot.link.try_lock() else { continue };
            if let Some(shm) = link.as_shm() {
                shm.set_awake_state(awake);
            }
        }
    }

    /// Drain and deliver everything the last poll flagged, plus peers left
    /// over from an earlier backpressure stop.
    pub fn perform_receive(&mut self) {
        let mut targets = std::mem::take(&mut self.pending);
        for node in self.ready.drain(..) {
            if !targets.contains(&node) {
                targets.push(node);
            }
        }

        for node in targets {
            let Some(slot) = self.shared.slot(node) else { continue };
            if slot.phase() != PerformPhase::Connected {
                continue;
            }
            self.receive_one(&slot);
        }
    }

    fn receive_one(&mut self, slot: &Arc<PeerSlot>) {
        let node = slot.node;
        let callback = &self.shared.callback;
        let Ok(mut link) = slot.link.try_lock() else { return };

        callback.lock_transporter(node);
        loop {
            link.do_receive();
            if !link.core().connected {
                break;
            }

            if slot.bad_data.load(Ordering::Acquire) {
                // framing already broke on this peer: black-hole everything
                // until it reconnects
                let words = link.recv_span().len();
                if words == 0 {
                    break;
                }
                link.consume_recv(words);
                continue;
            }

            let span = link.recv_span();
            if span.len() < 4 {
                break;
            }
            let sink: &dyn SignalSink = callback.as_ref();
            let outcome = unpack(span, node, slot.io_state(), sink);
            link.consume_recv(outcome.consumed_words);

            if let Some(err) = outcome.error {
                slot.bad_data.store(true, Ordering::Release);
                callback.report_error(node, err);
                let rest = link.recv_span().len();
                link.consume_recv(rest);
                break;
            }
            if outcome.stop {
                // cooperative backpressure: finish this span next cycle
                self.pending.push(node);
                break;
            }
            if outcome.consumed_words == 0 {
                // partial message; wait for more bytes
                break;
            }
            if !link.has_data_to_read() {
                break;
            }
        }
        callback.unlock_transporter(node);

        drop(link);
        self.sync_disconnect(slot);
    }

    /// Round-robin flush, starting one past where the last cycle started so
    /// no peer monopolizes the socket budget.
    pub fn perform_send(&mut self) {
        let slots = self.shared.snapshot();
        if slots.is_empty() {
            return;
        }
        let n = slots.len();
        let start = self.send_cursor % n;
        for i in 0..n {
            let slot = &slots[(start + i) % n];
            if slot.phase() != PerformPhase::Connected {
                continue;
            }
            {
                let Ok(mut link) = slot.link.try_lock() else { continue };
                if link.core().connected && link.has_data_to_send() {
                    link.do_send();
                }
            }
            self.sync_disconnect(slot);
        }
        self.send_cursor = self.send_cursor.wrapping_add(1);
    }

    /// A transporter that lost its connection underneath a Connected phase
    /// surfaces here: flip the phase and tell the embedder.
    fn sync_disconnect(&self, slot: &Arc<PeerSlot>) {
        if slot.phase() != PerformPhase::Connected {
            return;
        }
        let errno = {
            let Ok(link) = slot.link.try_lock() else { return };
            if link.core().connected {
                return;
            }
            link.core().last_errno
        };
        slot.set_phase(PerformPhase::Disconnected);
        slot.bad_data.store(false, Ordering::Release);
        self.shared.callback.report_disconnect(slot.node, errno);
    }

    /// Synthesize connect/disconnect reports out of phase transitions the
    /// worker and the transporters made since the last call.
    pub fn update_connections(&self) {
        for slot in self.shared.snapshot() {
            let connected = match slot.link.try_lock() {
                Ok(link) => link.core().connected,
                // mid-connect on the worker thread
                Err(_) => continue,
            };
            match slot.phase() {
                PerformPhase::Connecting if connected => {
                    slot.set_phase(PerformPhase::Connected);
                    slot.bad_data.store(false, Ordering::Release);
                    self.shared.callback.report_connect(slot.node);
                }
                PerformPhase::Disconnecting if !connected => {
                    slot.set_phase(PerformPhase::Disconnected);
                    slot.bad_data.store(false, Ordering::Release);
                    self.shared.callback.report_disconnect(slot.node, 0);
                }
                PerformPhase::Connected if !connected => {
                    self.sync_disconnect(&slot);
                }
                _ => {}
            }
        }
    }

    /// Spawn the background connect worker: every 100 ms it walks the peer
    /// table, runs client connects for `Connecting` peers and teardown for
    /// `Disconnecting` ones.
    pub fn start_clients(&mut self) -> bool {
        self.start_clients_on(None, ThreadPriority::OSDefault)
    }

    /// As `start_clients`, with explicit placement for deployments that pin
    /// their service threads.
    pub fn start_clients_on(&mut self, core: Option<usize>, prio: ThreadPriority) -> bool {
        if self.clients_thread.is_some() {
            return false;
        }
        self.shared.run_clients.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("signet-connect".into())
            .spawn(move || {
                thread_boot(core, prio);
                run_clients_loop(&shared);
            });
        match handle {
            Ok(h) => {
                self.clients_thread = Some(h);
                true
            }
            Err(e) => {
                warn!("couldn't spawn connect worker: {e}");
                self.shared.run_clients.store(false, Ordering::Release);
                false
            }
        }
    }

    pub fn stop_clients(&mut self) -> bool {
        self.shared.run_clients.store(false, Ordering::Release);
        if let Some(handle) = self.clients_thread.take() {
            let _ = handle.join();
        }
        true
    }

    /// Start the server half: an accept loop performing the base handshake
    /// and dispatching accepted sockets to their peer's transporter.
    /// Returns the bound address (useful with an ephemeral port).
    pub fn start_service(&mut self, bind: std::net::SocketAddr) -> io::Result<std::net::SocketAddr> {
        if self.service_thread.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "service already running"));
        }
        let listener = std::net::TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?;
        info!(addr = %bound, "transporter service listening");

        self.shared.run_service.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("signet-service".into())
            .spawn(move || crate::service::run_service_loop(&shared, &listener))?;
        self.service_thread = Some(handle);
        Ok(bound)
    }

    pub fn stop_service(&mut self) {
        self.shared.run_service.store(false, Ordering::Release);
        if let Some(handle) = self.service_thread.take() {
            let _ = handle.join();
        }
    }

    /// Tear down every peer immediately.
    pub fn disconnect_all(&self) {
        for slot in self.shared.snapshot() {
            if let Ok(mut link) = slot.link.lock() {
                link.do_disconnect();
            }
            slot.set_phase(PerformPhase::Disconnected);
        }
    }
}

impl Drop for TransporterRegistry {
    fn drop(&mut self) {
        self.stop_clients();
        self.stop_service();
        self.disconnect_all();
    }
}

#[inline]
fn kind_bit(kind: TransporterKind) -> u32 {
    match kind {
        TransporterKind::Tcp => 1,
        TransporterKind::Shm => 1 << 1,
        TransporterKind::Rdma => 1 << 2,
        TransporterKind::Ose => 1 << 3,
    }
}

fn run_clients_loop(shared: &Shared) {
    while shared.run_clients.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
        for slot in shared.snapshot() {
            if !shared.run_clients.load(Ordering::Acquire) {
                return;
            }
            match slot.phase() {
                PerformPhase::Connecting => {
                    let Ok(mut link) = slot.link.try_lock() else { continue };
                    if !link.core().connected && !link.core().is_server {
                        link.connect_client();
                    }
                }
                PerformPhase::Disconnecting => {
                    let Ok(mut link) = slot.link.try_lock() else { continue };
                    if link.core().connected {
                        link.do_disconnect();
                    }
                }
                _ => {}
            }
        }
    }
}
