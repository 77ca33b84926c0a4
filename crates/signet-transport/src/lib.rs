mod auth;
mod config;
mod control;
mod core;
mod rdma;
mod resequencer;
mod shm;
mod tcp;

use std::time::Duration;

pub use auth::{Authenticator, ChallengeResponseAuth};
pub use config::{FramingConfig, RdmaConfig, ShmConfig, TcpConfig};
pub use control::{
    ControlLine, ControlLineError, TransporterKind, read_control_line, write_control_line,
};
pub use core::{Link, TransporterCallback, TransporterCore};
pub use rdma::{DmaAdapter, RdmaTransporter, SegmentAdapter, TransferError};
pub use resequencer::{Resequenced, Resequencer};
pub use shm::ShmTransporter;
pub use tcp::TcpTransporter;

use signet_wire::TransporterError;

/// One peer's transporter, whichever wire it runs on.
pub enum Backend {
    Tcp(TcpTransporter),
    Shm(ShmTransporter),
    Rdma(RdmaTransporter),
}

impl Backend {
    #[inline]
    pub fn kind(&self) -> TransporterKind {
        match self {
            Self::Tcp(_) => TransporterKind::Tcp,
            Self::Shm(_) => TransporterKind::Shm,
            Self::Rdma(_) => TransporterKind::Rdma,
        }
    }

    /// Register the owning registry's poller with backends that drive
    /// receive readiness through a socket.
    pub fn set_poller(&mut self, registry: mio::Registry) {
        match self {
            Self::Tcp(t) => t.set_poller(registry),
            Self::Shm(t) => t.set_poller(registry),
            Self::Rdma(_) => {}
        }
    }

    #[inline]
    pub fn as_shm(&self) -> Option<&ShmTransporter> {
        match self {
            Self::Shm(t) => Some(t),
            _ => None,
        }
    }

    #[inline]
    fn link(&self) -> &dyn Link {
        match self {
            Self::Tcp(t) => t,
            Self::Shm(t) => t,
            Self::Rdma(t) => t,
        }
    }

    #[inline]
    fn link_mut(&mut self) -> &mut dyn Link {
        match self {
            Self::Tcp(t) => t,
            Self::Shm(t) => t,
            Self::Rdma(t) => t,
        }
    }
}

impl Link for Backend {
    fn core(&self) -> &TransporterCore {
        self.link().core()
    }

    fn core_mut(&mut self) -> &mut TransporterCore {
        self.link_mut().core_mut()
    }

    fn init(&mut self) -> Result<(), TransporterError> {
        self.link_mut().init()
    }

    fn connect_client(&mut self) -> bool {
        self.link_mut().connect_client()
    }

    fn connect_server(&mut self, stream: std::net::TcpStream) -> bool {
        self.link_mut().connect_server(stream)
    }

    fn do_disconnect(&mut self) {
        self.link_mut().do_disconnect();
    }

    fn get_write_ptr(&mut self, len_bytes: u32, prio: u8) -> Option<&mut [u32]> {
        self.link_mut().get_write_ptr(len_bytes, prio)
    }

    fn update_write_ptr(&mut self, len_bytes: u32, prio: u8) {
        self.link_mut().update_write_ptr(len_bytes, prio);
    }

    fn has_data_to_send(&self) -> bool {
        self.link().has_data_to_send()
    }

    fn send_is_possible(&self, timeout: Duration) -> bool {
        self.link().send_is_possible(timeout)
    }

    fn do_send(&mut self) -> bool {
        self.link_mut().do_send()
    }

    fn has_data_to_read(&self) -> bool {
        self.link().has_data_to_read()
    }

    fn do_receive(&mut self) -> usize {
        self.link_mut().do_receive()
    }

    fn recv_span(&self) -> &[u32] {
        self.link().recv_span()
    }

    fn consume_recv(&mut self, words: usize) {
        self.link_mut().consume_recv(words);
    }
}
