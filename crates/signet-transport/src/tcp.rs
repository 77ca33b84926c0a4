use std::{
    io::{Read, Write},
    net::TcpStream as StdTcpStream,
    os::fd::AsRawFd,
    sync::Arc,
    time::Duration,
};

use mio::{Interest, Token};
use signet_buffers::SendBuffer;
use signet_utils::safe_assert;
use signet_wire::{MAX_MESSAGE_SIZE, NodeId, TransporterError, get_message_length};
use tracing::{debug, warn};

use crate::{
    config::TcpConfig,
    control::TransporterKind,
    core::{Link, TransporterCallback, TransporterCore},
};

/// Buffered bytes beyond which `update_write_ptr` tries an opportunistic
/// flush instead of waiting for the next `perform_send`.
const TCP_SEND_LIMIT: u32 = 64 * 1024;

/// Staging for inbound stream bytes. Framed messages are unpacked from the
/// front; a trailing partial message is moved back to the start so the next
/// read continues contiguously.
struct ReceiveBuffer {
    words: Box<[u32]>,
    used_bytes: usize,
}

impl ReceiveBuffer {
    fn new(size_bytes: u32) -> Self {
        Self { words: vec![0u32; (size_bytes / 4) as usize].into_boxed_slice(), used_bytes: 0 }
    }

    #[inline]
    fn capacity_bytes(&self) -> usize {
        self.words.len() * 4
    }

    #[inline]
    fn free_space(&mut self) -> &mut [u8] {
        let cap = self.capacity_bytes();
        unsafe {
            std::slice::from_raw_parts_mut(
                (self.words.as_mut_ptr() as *mut u8).add(self.used_bytes),
                cap - self.used_bytes,
            )
        }
    }

    #[inline]
    fn commit(&mut self, n: usize) {
        self.used_bytes += n;
        safe_assert!(self.used_bytes <= self.capacity_bytes());
    }

    /// Whole words available for unpacking; a trailing partial word stays.
    #[inline]
    fn data_words(&self) -> &[u32] {
        &self.words[..self.used_bytes / 4]
    }

    fn consume_words(&mut self, words: usize) {
        let bytes = words * 4;
        safe_assert!(bytes <= self.used_bytes);
        let rest = self.used_bytes - bytes;
        if rest > 0 {
            unsafe {
                let base = self.words.as_mut_ptr() as *mut u8;
                std::ptr::copy(base.add(bytes), base, rest);
            }
        }
        self.used_bytes = rest;
    }

    fn clear(&mut self) {
        self.used_bytes = 0;
    }
}

/// Stream-socket backend: non-blocking reads into a staging buffer,
/// non-blocking writes out of a [`SendBuffer`], readiness driven by the
/// registry's poller.
pub struct TcpTransporter {
    core: TransporterCore,
    cfg: TcpConfig,
    poller: Option<mio::Registry>,
    stream: Option<mio::net::TcpStream>,
    send_buffer: SendBuffer,
    recv: ReceiveBuffer,
}

impl TcpTransporter {
    pub fn new(
        local: NodeId,
        remote: NodeId,
        remote_addr: std::net::SocketAddr,
        cfg: TcpConfig,
        callback: Arc<dyn TransporterCallback>,
    ) -> Self {
        let core = TransporterCore::new(
            local,
            remote,
            TransporterKind::Tcp,
            remote_addr,
            cfg.framing.signal_id_used,
            cfg.framing.checksum_used,
            cfg.framing.report_freq,
            callback,
        );
        Self {
            core,
            cfg,
            poller: None,
            stream: None,
            send_buffer: SendBuffer::new(0),
            recv: ReceiveBuffer::new(0),
        }
    }

    /// Hand over the registry's poller so the stream can be registered under
    /// this peer's token on connect.
    pub fn set_poller(&mut self, registry: mio::Registry) {
        self.poller = Some(registry);
    }

    fn set_socket_options(&self, stream: &StdTcpStream) {
        let fd = stream.as_raw_fd();
        set_sock_opt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, self.cfg.sock_rcv_buf as i32);
        set_sock_opt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, self.cfg.sock_snd_buf as i32);
        set_sock_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
        set_sock_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1);
    }

    fn connect_common(&mut self, stream: StdTcpStream) -> bool {
        self.set_socket_options(&stream);
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(peer = self.core.remote_node_id, "couldn't set socket non-blocking: {e}");
            return false;
        }
        let mut mstream = mio::net::TcpStream::from_std(stream);
        if let Some(poller) = &self.poller {
            if let Err(e) = poller.register(
                &mut mstream,
                Token(usize::from(self.core.remote_node_id)),
                Interest::READABLE,
            ) {
                warn!(peer = self.core.remote_node_id, "couldn't register stream: {e}");
                return false;
            }
        }
        self.stream = Some(mstream);
        self.core.connected = true;
        self.core.last_errno = 0;
        true
    }

    fn drop_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Some(poller) = &self.poller {
                let _ = poller.deregister(&mut stream);
            }
            if let Err(e) = stream.shutdown(std::net::Shutdown::Both) {
                if e.kind() != std::io::ErrorKind::NotConnected {
                    self.core
                        .callback
                        .report_error(self.core.remote_node_id, TransporterError::ErrorClosingSocket);
                }
            }
        }
    }

    /// Transient write/read failures keep the connection; everything else
    /// tears it down.
    fn is_transient(e: &std::io::Error) -> bool {
        matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted)
    }

    fn fail_connection(&mut self, errno: i32) {
        self.core.last_errno = errno;
        self.do_disconnect();
    }
}

impl Link for TcpTransporter {
    fn core(&self) -> &TransporterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TransporterCore {
        &mut self.core
    }

    fn init(&mut self) -> Result<(), TransporterError> {
        // staging holds one receive chunk plus one maximum earlier partial
        // message
        let recv_size = self.cfg.max_receive_size.max(MAX_MESSAGE_SIZE) + MAX_MESSAGE_SIZE;
        self.recv = ReceiveBuffer::new(recv_size);
        self.send_buffer = SendBuffer::new(self.cfg.send_buffer_size);
        Ok(())
    }

    fn connect_client(&mut self) -> bool {
        if self.core.connected {
            return true;
        }
        let Some(stream) = self.core.connect_and_greet() else { return false };
        self.connect_common(stream)
    }

    fn connect_server(&mut self, stream: StdTcpStream) -> bool {
        if self.core.connected {
            return false;
        }
        self.connect_common(stream)
    }

    fn do_disconnect(&mut self) {
        if !self.core.connected {
            return;
        }
        self.core.connected = false;
        self.drop_stream();
        self.recv.clear();
        self.send_buffer.empty_buffer();
    }

    fn get_write_ptr(&mut self, len_bytes: u32, _prio: u8) -> Option<&mut [u32]> {
        if !self.send_buffer.can_insert(len_bytes) {
            // completely full: give the kernel a short window to drain, then
            // make one emergency send and retry the grant
            if !self.send_is_possible(Duration::from_millis(10)) {
                return None;
            }
            self.do_send();
        }
        self.send_buffer.get_insert_ptr(len_bytes)
    }

    fn update_write_ptr(&mut self, len_bytes: u32, _prio: u8) {
        self.send_buffer.update_insert_ptr(len_bytes);
        if self.send_buffer.data_size() > TCP_SEND_LIMIT
            && self.send_is_possible(Duration::ZERO)
        {
            self.do_send();
        }
    }

    fn has_data_to_send(&self) -> bool {
        self.send_buffer.has_data()
    }

    fn send_is_possible(&self, timeout: Duration) -> bool {
        let Some(stream) = &self.stream else { return false };
        poll_writable(stream.as_raw_fd(), timeout)
    }

    fn do_send(&mut self) -> bool {
        let span = self.send_buffer.send_span();
        if span.is_empty() {
            return true;
        }
        let Some(stream) = &mut self.stream else { return false };

        match stream.write(span) {
            Ok(0) => {
                self.fail_connection(libc::EPIPE);
                false
            }
            Ok(n) => {
                self.send_buffer.bytes_sent(n as u32);
                self.core.account_sent(n as u64);
                true
            }
            Err(e) if Self::is_transient(&e) => false,
            Err(e) => {
                debug!(peer = self.core.remote_node_id, "send failed: {e}");
                self.fail_connection(e.raw_os_error().unwrap_or(0));
                false
            }
        }
    }

    fn has_data_to_read(&self) -> bool {
        // readiness comes from the poller; leftover staged bytes are
        // rechecked by the receive loop
        self.recv.used_bytes >= 4
    }

    /// One chunk off the socket into staging. Loops until the socket would
    /// block or staging is full, as the poller only reports edges.
    fn do_receive(&mut self) -> usize {
        let mut total = 0usize;
        loop {
            let max = self.recv.free_space().len().min(self.cfg.max_receive_size as usize);
            if max == 0 {
                // a full staging buffer is fine while it still holds whole
                // messages for the unpack loop; it is fatal when the front
                // message claims more than the buffer can ever hold, since
                // that message can never complete
                let staged = self.recv.data_words();
                let stuck = staged
                    .first()
                    .is_none_or(|&word1| get_message_length(word1) as usize > staged.len());
                if stuck {
                    self.core.callback.report_error(
                        self.core.remote_node_id,
                        TransporterError::InvalidMessageLength,
                    );
                    self.fail_connection(libc::EMSGSIZE);
                }
                break;
            }
            let space = self.recv.free_space();
            let Some(stream) = &mut self.stream else { break };
            match stream.read(&mut space[..max]) {
                Ok(0) => {
                    self.fail_connection(libc::ECONNRESET);
                    break;
                }
                Ok(n) => {
                    self.recv.commit(n);
                    self.core.account_received(n as u64);
                    total += n;
                }
                Err(e) if Self::is_transient(&e) => break,
                Err(e) => {
                    debug!(peer = self.core.remote_node_id, "recv failed: {e}");
                    self.fail_connection(e.raw_os_error().unwrap_or(0));
                    break;
                }
            }
        }
        total
    }

    fn recv_span(&self) -> &[u32] {
        self.recv.data_words()
    }

    fn consume_recv(&mut self, words: usize) {
        self.recv.consume_words(words);
    }
}

fn set_sock_opt(fd: i32, level: i32, opt: i32, value: i32) {
    unsafe {
        let res = libc::setsockopt(
            fd,
            level,
            opt,
            std::ptr::addr_of!(value).cast::<libc::c_void>(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
        if res != 0 {
            debug!(fd, level, opt, "setsockopt failed: {}", std::io::Error::last_os_error());
        }
    }
}

fn poll_writable(fd: i32, timeout: Duration) -> bool {
    let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
    let millis = timeout.as_millis() as libc::c_int;
    let res = unsafe { libc::poll(&mut pfd, 1, millis) };
    res > 0 && (pfd.revents & libc::POLLOUT) != 0
}
