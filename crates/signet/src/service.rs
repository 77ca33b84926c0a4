//! Server half of connection establishment: accept control sockets, read
//! the peer's greeting, and hand the socket to the right transporter.

use std::{
    net::{TcpListener, TcpStream},
    sync::atomic::Ordering,
    time::Duration,
};

use signet_transport::{ControlLine, Link, read_control_line, write_control_line};
use tracing::{debug, error, info};

use crate::registry::{PerformPhase, Shared};

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn run_service_loop(shared: &Shared, listener: &TcpListener) {
    while shared.run_service.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!(%addr, "transporter service: connection");
                new_session(shared, stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                error!("transporter service accept failed: {e}");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// One inbound session: greeting in, our node id out, then the transporter
/// runs its backend-specific server connect on the socket.
fn new_session(shared: &Shared, mut stream: TcpStream) {
    if stream.set_nonblocking(false).is_err() {
        return;
    }

    let auth = shared.authenticator.lock().expect("authenticator poisoned").clone();
    if let Some(auth) = auth {
        let _ = stream.set_read_timeout(Some(GREETING_TIMEOUT));
        if !matches!(auth.server_authenticate(&mut stream), Ok(true)) {
            debug!("authentication failed, dropping session");
            return;
        }
    }

    let greeting = match read_control_line(&mut stream, GREETING_TIMEOUT) {
        Ok(line) => line,
        Err(e) => {
            debug!("could not read greeting: {e}");
            return;
        }
    };
    let (node_id, kind) = match greeting {
        ControlLine::NodeGreeting { node_id, kind } => (node_id, kind),
        other => {
            debug!(?other, "unexpected greeting");
            return;
        }
    };

    let Some(slot) = shared.slot(node_id) else {
        debug!(node_id, "greeting from unconfigured node");
        return;
    };
    if let Some(kind) = kind {
        if kind != slot.kind {
            error!(
                node_id,
                ?kind,
                expected = ?slot.kind,
                "incompatible configuration: transporter type mismatch"
            );
            return;
        }
    }
    // only peers we are actively trying to bring up get accepted
    if slot.phase() != PerformPhase::Connecting {
        debug!(node_id, phase = ?slot.phase(), "peer not in connecting phase, dropping");
        return;
    }

    let ack = ControlLine::NodeGreeting { node_id: shared.local_node_id, kind: None };
    if write_control_line(&mut stream, &ack).is_err() {
        return;
    }

    let Ok(mut link) = slot.link.try_lock() else {
        debug!(node_id, "transporter busy, dropping session");
        return;
    };
    if link.connect_server(stream) {
        info!(node_id, "server-side connect complete");
    }
}
