use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use signet_wire::{NodeId, Packer, SignalSink, TransporterError};

use crate::{auth::Authenticator, control::TransporterKind};

/// Receiving and reporting half of the callback boundary the registry and
/// its transporters talk to. Everything but signal delivery defaults to a
/// no-op so embedders only implement what they watch.
pub trait TransporterCallback: SignalSink + Send + Sync {
    fn report_connect(&self, _node: NodeId) {}
    fn report_disconnect(&self, _node: NodeId, _errno: i32) {}
    fn report_error(&self, _node: NodeId, _kind: TransporterError) {}
    fn report_send_len(&self, _node: NodeId, _count: u32, _bytes: u64) {}
    fn report_receive_len(&self, _node: NodeId, _count: u32, _bytes: u64) {}
}

const MAX_BLOCK_TIME: Duration = Duration::from_secs(10);
const MIN_CONNECTIONS_REFUSED: u32 = 3;

/// State every backend shares: identity, framing options, statistics and
/// the refused-connect backoff.
pub struct TransporterCore {
    pub local_node_id: NodeId,
    pub remote_node_id: NodeId,
    /// Lower node id serves; the other side connects.
    pub is_server: bool,
    pub kind: TransporterKind,
    pub remote_addr: SocketAddr,
    pub packer: Packer,
    pub connected: bool,
    /// Bounds the control-socket handshake and setup waits.
    pub timeout: Duration,
    pub report_freq: u32,
    pub callback: Arc<dyn TransporterCallback>,
    /// Optional control-socket authentication, run before the greeting.
    pub authenticator: Option<Arc<dyn Authenticator>>,

    /// errno of the failure that dropped the connection, for
    /// `report_disconnect`.
    pub last_errno: i32,

    send_count: u32,
    send_size: u64,
    receive_count: u32,
    receive_size: u64,

    refused_count: u32,
    connect_block_until: Option<Instant>,
}

impl TransporterCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_node_id: NodeId,
        remote_node_id: NodeId,
        kind: TransporterKind,
        remote_addr: SocketAddr,
        signal_id_used: bool,
        checksum_used: bool,
        report_freq: u32,
        callback: Arc<dyn TransporterCallback>,
    ) -> Self {
        Self {
            local_node_id,
            remote_node_id,
            is_server: local_node_id < remote_node_id,
            kind,
            remote_addr,
            packer: Packer::new(signal_id_used, checksum_used),
            connected: false,
            timeout: Duration::from_secs(30),
            report_freq,
            callback,
            authenticator: None,
            last_errno: 0,
            send_count: 0,
            send_size: 0,
            receive_count: 0,
            receive_size: 0,
            refused_count: 0,
            connect_block_until: None,
        }
    }

    /// Fold `n` sent bytes into the stats, reporting every `report_freq`
    /// sends.
    pub fn account_sent(&mut self, n: u64) {
        self.send_count += 1;
        self.send_size += n;
        if self.send_count >= self.report_freq {
            self.callback.report_send_len(self.remote_node_id, self.send_count, self.send_size);
            self.send_count = 0;
            self.send_size = 0;
        }
    }

    pub fn account_received(&mut self, n: u64) {
        self.receive_count += 1;
        self.receive_size += n;
        if self.receive_count >= self.report_freq {
            self.callback.report_receive_len(
                self.remote_node_id,
                self.receive_count,
                self.receive_size,
            );
            self.receive_count = 0;
            self.receive_size = 0;
        }
    }

    /// The server turned us away. The third consecutive refusal starts
    /// blocking reconnects, one second per further refusal, capped at ten.
    pub fn connection_refused(&mut self) {
        self.refused_count += 1;
        if self.refused_count < MIN_CONNECTIONS_REFUSED {
            return;
        }
        let block =
            Duration::from_secs(u64::from(self.refused_count - MIN_CONNECTIONS_REFUSED) + 1)
                .min(MAX_BLOCK_TIME);
        self.connect_block_until = Some(Instant::now() + block);
    }

    pub fn reset_connection_block(&mut self) {
        self.refused_count = 0;
        self.connect_block_until = None;
    }

    pub fn is_connect_blocked(&mut self) -> bool {
        match self.connect_block_until {
            None => false,
            Some(until) if Instant::now() > until => {
                self.connect_block_until = None;
                false
            }
            Some(_) => true,
        }
    }

    #[inline]
    pub fn refused_count(&self) -> u32 {
        self.refused_count
    }

    /// Client half of the base handshake: connect the control socket, send
    /// our greeting, validate the server's reply. Refusals feed the backoff;
    /// an accepted greeting clears it.
    pub fn connect_and_greet(&mut self) -> Option<std::net::TcpStream> {
        use crate::control::{ControlLine, read_control_line, write_control_line};

        if self.is_connect_blocked() {
            return None;
        }
        let Ok(mut stream) = std::net::TcpStream::connect_timeout(&self.remote_addr, self.timeout)
        else {
            return None;
        };

        if let Some(auth) = self.authenticator.clone() {
            let _ = stream.set_read_timeout(Some(self.timeout));
            if !matches!(auth.client_authenticate(&mut stream), Ok(true)) {
                self.connection_refused();
                return None;
            }
        }

        let hello =
            ControlLine::NodeGreeting { node_id: self.local_node_id, kind: Some(self.kind) };
        if write_control_line(&mut stream, &hello).is_err() {
            self.connection_refused();
            return None;
        }
        let reply = match read_control_line(&mut stream, self.timeout) {
            Ok(line) => line,
            Err(_) => {
                self.connection_refused();
                return None;
            }
        };
        // the server accepted us; any block is over
        self.reset_connection_block();

        match reply {
            ControlLine::NodeGreeting { node_id, kind } => {
                if let Some(kind) = kind {
                    if kind != self.kind {
                        tracing::error!(
                            peer = node_id,
                            ?kind,
                            "incompatible configuration: transporter type mismatch"
                        );
                        return None;
                    }
                } else if self.kind == TransporterKind::Shm {
                    tracing::warn!(
                        peer = node_id,
                        "peer did not announce a transporter type, cannot verify compatibility"
                    );
                }
                Some(stream)
            }
            other => {
                tracing::warn!(?other, "unexpected handshake reply");
                None
            }
        }
    }
}

/// Per-backend contract. One implementor per wire technology; the registry
/// stores them behind the [`crate::Backend`] sum type, one per peer.
pub trait Link {
    fn core(&self) -> &TransporterCore;
    fn core_mut(&mut self) -> &mut TransporterCore;

    /// Allocate staging resources. Called once before the first connect.
    fn init(&mut self) -> Result<(), TransporterError> {
        Ok(())
    }

    /// Full client-side connect: socket, base handshake, backend setup.
    /// Driven by the background connect worker.
    fn connect_client(&mut self) -> bool;

    /// Server side, handed a socket whose greeting the listener already
    /// consumed and answered.
    fn connect_server(&mut self, stream: std::net::TcpStream) -> bool;

    /// Idempotent teardown.
    fn do_disconnect(&mut self);

    /// Room for one framed message of `len_bytes`, or `None` when the
    /// outgoing side is full.
    fn get_write_ptr(&mut self, len_bytes: u32, prio: u8) -> Option<&mut [u32]>;

    /// Commit a message packed into the last granted region.
    fn update_write_ptr(&mut self, len_bytes: u32, prio: u8);

    fn has_data_to_send(&self) -> bool;

    fn send_is_possible(&self, timeout: Duration) -> bool;

    /// Push buffered bytes towards the peer. `false` on transient
    /// inability or connection loss (check `core().connected`).
    fn do_send(&mut self) -> bool;

    /// Backend has bytes ready for `recv_span` without further socket work.
    fn has_data_to_read(&self) -> bool;

    /// Pull bytes off the backend (socket read / wake-byte drain). Returns
    /// bytes newly staged for TCP; ring backends return 0 and expose data
    /// through `recv_span` directly.
    fn do_receive(&mut self) -> usize;

    /// Linear run of received words for the unpack loop.
    fn recv_span(&self) -> &[u32];

    /// Consume `words` words of the current span.
    fn consume_recv(&mut self, words: usize);
}
