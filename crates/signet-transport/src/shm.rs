use std::{
    io::{Read, Write},
    net::TcpStream as StdTcpStream,
    os::fd::AsRawFd,
    ptr::NonNull,
    sync::Arc,
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use mio::{Interest, Token};
use signet_buffers::{RingControl, RingReader, RingWriter, SharedMutex, SysvSegment};
use signet_wire::{MAX_MESSAGE_SIZE, NodeId, TransporterError};
use tracing::{debug, warn};

use crate::{
    config::ShmConfig,
    control::{ControlLine, TransporterKind, read_control_line, write_control_line},
    core::{Link, TransporterCallback, TransporterCore},
};

/// Shared-memory backend: one SysV segment per node pair, split into two
/// control pages and two back-to-back single-producer rings. Packed signals
/// go straight into the outbound ring; the control socket only carries the
/// handshake and the wake byte.
pub struct ShmTransporter {
    core: TransporterCore,
    cfg: ShmConfig,
    poller: Option<mio::Registry>,
    socket: Option<mio::net::TcpStream>,
    segment: Option<SysvSegment>,
    reader: Option<RingReader>,
    writer: Option<RingWriter>,
    /// Control page owned by this side (our sleep/wake flags, our mutex).
    own_ctl: Option<NonNull<RingControl>>,
    /// The peer's control page.
    reverse_ctl: Option<NonNull<RingControl>>,
    setup_done: bool,
    remote_pid: u32,
}

unsafe impl Send for ShmTransporter {}

impl ShmTransporter {
    pub fn new(
        local: NodeId,
        remote: NodeId,
        remote_addr: std::net::SocketAddr,
        cfg: ShmConfig,
        callback: Arc<dyn TransporterCallback>,
    ) -> Self {
        let core = TransporterCore::new(
            local,
            remote,
            TransporterKind::Shm,
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
            socket: None,
            segment: None,
            reader: None,
            writer: None,
            own_ctl: None,
            reverse_ctl: None,
            setup_done: false,
            remote_pid: 0,
        }
    }

    pub fn set_poller(&mut self, registry: mio::Registry) {
        self.poller = Some(registry);
    }

    #[inline]
    fn ring_total(&self) -> u32 {
        (self.cfg.shm_size - 2 * RingControl::SIZE as u32) / 2
    }

    fn report(&self, kind: TransporterError) {
        self.core.callback.report_error(self.core.remote_node_id, kind);
    }

    /// Map the two control pages and ring halves onto the attached segment.
    /// The page at the segment start belongs to the server side; its ring is
    /// written by the client. The server initializes everything and only
    /// then publishes its status flag; the client never touches the mutexes
    /// before seeing the server's ready line.
    fn setup_buffers(&mut self, base: NonNull<u8>) -> bool {
        let ring_total = self.ring_total();
        let ctl_size = RingControl::SIZE;
        let slack = MAX_MESSAGE_SIZE;

        unsafe {
            let ctl1 = NonNull::new_unchecked(base.as_ptr() as *mut RingControl);
            let buf1 = NonNull::new_unchecked(base.as_ptr().add(ctl_size));
            let ctl2 = NonNull::new_unchecked(
                base.as_ptr().add(ctl_size + ring_total as usize) as *mut RingControl,
            );
            let buf2 =
                NonNull::new_unchecked(base.as_ptr().add(2 * ctl_size + ring_total as usize));

            if self.core.is_server {
                let server_mutex = std::ptr::addr_of_mut!((*ctl1.as_ptr()).mutex);
                let client_mutex = std::ptr::addr_of_mut!((*ctl2.as_ptr()).mutex);
                if SharedMutex::init_shared(server_mutex).is_err()
                    || SharedMutex::init_shared(client_mutex).is_err()
                {
                    return false;
                }
                ctl1.as_ref().reset();
                ctl2.as_ref().reset();

                self.reader = Some(RingReader::new(ctl1, buf1, ring_total, slack));
                self.writer = Some(RingWriter::new(ctl2, buf2, ring_total, slack));
                self.own_ctl = Some(ctl1);
                self.reverse_ctl = Some(ctl2);

                ctl1.as_ref().up_flag.store(1, Ordering::Release);
                ctl1.as_ref().status_flag.store(1, Ordering::Release);
            } else {
                self.reader = Some(RingReader::new(ctl2, buf2, ring_total, slack));
                self.writer = Some(RingWriter::new(ctl1, buf1, ring_total, slack));
                self.own_ctl = Some(ctl2);
                self.reverse_ctl = Some(ctl1);

                // the server's page arbitrates attachment
                ctl1.as_ref().mutex.lock();
                ctl2.as_ref().up_flag.store(1, Ordering::Release);
                ctl2.as_ref().status_flag.store(1, Ordering::Release);
                ctl1.as_ref().mutex.unlock();
            }
        }
        self.setup_done = true;
        true
    }

    #[inline]
    fn own(&self) -> Option<&RingControl> {
        self.own_ctl.map(|p| unsafe { &*p.as_ptr() })
    }

    #[inline]
    fn reverse(&self) -> Option<&RingControl> {
        self.reverse_ctl.map(|p| unsafe { &*p.as_ptr() })
    }

    /// Both sides have published their status flags, the segment really has
    /// two attachments, and (on the server) the segment is marked for
    /// removal so a crash cannot leak it.
    fn connect_common(&mut self) -> bool {
        let Some(segment) = &mut self.segment else { return false };
        match segment.attach_count() {
            Ok(2) => {}
            Ok(n) => {
                debug!(peer = self.core.remote_node_id, attached = n, "unexpected attach count");
                return false;
            }
            Err(e) => {
                warn!(peer = self.core.remote_node_id, "segment stat failed: {e}");
                self.report(TransporterError::ShmIpcStat);
                return false;
            }
        }
        if self.core.is_server {
            if let Err(e) = segment.mark_removed() {
                warn!(peer = self.core.remote_node_id, "couldn't mark segment removed: {e}");
                self.report(TransporterError::ShmUnableToRemoveSegment);
                return false;
            }
        }

        let deadline = Instant::now() + self.core.timeout;
        loop {
            let (own_ok, reverse_ok) = (
                self.own().is_some_and(|c| c.status_flag.load(Ordering::Acquire) == 1),
                self.reverse().is_some_and(|c| c.status_flag.load(Ordering::Acquire) == 1),
            );
            if own_ok && reverse_ok {
                return true;
            }
            if Instant::now() > deadline {
                debug!(peer = self.core.remote_node_id, "timed out waiting for setup flags");
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Promote the control socket to its steady-state wake-byte role.
    fn set_socket(&mut self, stream: StdTcpStream) -> bool {
        let fd = stream.as_raw_fd();
        unsafe {
            for (level, opt) in
                [(libc::IPPROTO_TCP, libc::TCP_NODELAY), (libc::SOL_SOCKET, libc::SO_KEEPALIVE)]
            {
                let one: libc::c_int = 1;
                libc::setsockopt(
                    fd,
                    level,
                    opt,
                    std::ptr::addr_of!(one).cast(),
                    size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut mstream = mio::net::TcpStream::from_std(stream);
        if let Some(poller) = &self.poller {
            if let Err(e) = poller.register(
                &mut mstream,
                Token(usize::from(self.core.remote_node_id)),
                Interest::READABLE,
            ) {
                warn!(peer = self.core.remote_node_id, "couldn't register wake socket: {e}");
                return false;
            }
        }
        self.socket = Some(mstream);
        self.core.connected = true;
        self.core.last_errno = 0;
        true
    }

    /// The reader publishes whether it is awake; the registry flips this
    /// around its blocking poll.
    pub fn set_awake_state(&self, awake: bool) {
        if !self.setup_done {
            return;
        }
        if let Some(own) = self.own() {
            own.mutex.lock();
            own.status_flag.store(u32::from(awake), Ordering::Release);
            own.awakened_flag.store(0, Ordering::Release);
            own.mutex.unlock();
        }
    }

    /// Prod a sleeping peer with a single byte on the control socket. The
    /// whole asleep-and-not-yet-prodded decision happens under the peer's
    /// mutex, so at most one byte is in flight per sleep.
    fn wakeup(&mut self) {
        if !self.setup_done {
            return;
        }
        let awake = {
            let Some(reverse) = self.reverse() else { return };
            reverse.mutex.lock();
            let awake = reverse.status_flag.load(Ordering::Acquire) == 1
                || reverse.awakened_flag.load(Ordering::Acquire) == 1;
            if !awake {
                reverse.awakened_flag.store(1, Ordering::Release);
            }
            reverse.mutex.unlock();
            awake
        };
        if awake {
            return;
        }

        let mut tries = 5;
        while tries > 0 {
            tries -= 1;
            let Some(socket) = &mut self.socket else { return };
            match socket.write(&[0u8]) {
                Ok(1) => return,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.core.last_errno = e.raw_os_error().unwrap_or(0);
                    self.do_disconnect();
                    return;
                }
            }
        }
    }

    /// Tear down the mapping. The last side to detach destroys the mutexes;
    /// both up flags under the server mutex arbitrate who that is.
    fn detach_shm(&mut self, report_errors: bool) {
        if self.setup_done {
            if let (Some(own), Some(reverse)) = (self.own(), self.reverse()) {
                let server_ctl = if self.core.is_server { own } else { reverse };
                server_ctl.mutex.lock();
                own.up_flag.store(0, Ordering::Release);
                let last = own.up_flag.load(Ordering::Acquire) == 0
                    && reverse.up_flag.load(Ordering::Acquire) == 0;
                server_ctl.mutex.unlock();
                if last {
                    unsafe {
                        if let (Some(o), Some(r)) = (self.own_ctl, self.reverse_ctl) {
                            SharedMutex::destroy(std::ptr::addr_of_mut!((*o.as_ptr()).mutex));
                            SharedMutex::destroy(std::ptr::addr_of_mut!((*r.as_ptr()).mutex));
                        }
                    }
                }
            }
        }
        self.reader = None;
        self.writer = None;
        self.own_ctl = None;
        self.reverse_ctl = None;
        self.setup_done = false;

        if let Some(mut segment) = self.segment.take() {
            if segment.detach().is_err() && report_errors {
                self.report(TransporterError::ShmUnableToRemoveSegment);
            }
        }
    }

    fn drop_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Some(poller) = &self.poller {
                let _ = poller.deregister(&mut socket);
            }
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn remote_pid(&self) -> u32 {
        self.remote_pid
    }
}

impl Link for ShmTransporter {
    fn core(&self) -> &TransporterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TransporterCore {
        &mut self.core
    }

    fn init(&mut self) -> Result<(), TransporterError> {
        let min_size = 2 * (RingControl::SIZE as u32 + MAX_MESSAGE_SIZE + 4096);
        if self.cfg.shm_size < min_size {
            return Err(TransporterError::ShmIpcPermanent);
        }
        Ok(())
    }

    fn connect_client(&mut self) -> bool {
        if self.core.connected {
            return true;
        }
        let Some(mut stream) = self.core.connect_and_greet() else { return false };

        // wait for the server to create, attach and initialize
        let server_pid = match read_control_line(&mut stream, self.core.timeout) {
            Ok(ControlLine::ShmServerReady { pid }) => pid,
            other => {
                debug!(peer = self.core.remote_node_id, ?other, "no shm-ready line from server");
                return false;
            }
        };
        self.remote_pid = server_pid;

        let mut segment = match SysvSegment::open(self.cfg.shm_key, self.cfg.shm_size) {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = self.core.remote_node_id, "shm open failed: {e}");
                self.report(TransporterError::ShmUnableToAttachSegment);
                return false;
            }
        };
        let base = match segment.attach() {
            Ok(b) => b,
            Err(e) => {
                warn!(peer = self.core.remote_node_id, "shm attach failed: {e}");
                self.report(TransporterError::ShmUnableToAttachSegment);
                return false;
            }
        };
        self.segment = Some(segment);
        if !self.setup_buffers(base) {
            self.detach_shm(false);
            return false;
        }

        let ok1 = ControlLine::ShmClientReady { pid: std::process::id() };
        if write_control_line(&mut stream, &ok1).is_err() {
            self.detach_shm(false);
            return false;
        }

        if !self.connect_common() {
            self.detach_shm(false);
            return false;
        }

        match read_control_line(&mut stream, self.core.timeout) {
            Ok(ControlLine::ShmServerUp) => {}
            other => {
                debug!(peer = self.core.remote_node_id, ?other, "no shm-up line from server");
                self.detach_shm(false);
                return false;
            }
        }
        if write_control_line(&mut stream, &ControlLine::ShmClientUp).is_err() {
            self.detach_shm(false);
            return false;
        }

        self.set_socket(stream)
    }

    fn connect_server(&mut self, mut stream: StdTcpStream) -> bool {
        if self.core.connected {
            return false;
        }

        let mut segment = match SysvSegment::create(self.cfg.shm_key, self.cfg.shm_size) {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = self.core.remote_node_id, "shm create failed: {e}");
                self.report(TransporterError::ShmUnableToCreateSegment);
                return false;
            }
        };
        let base = match segment.attach() {
            Ok(b) => b,
            Err(e) => {
                warn!(peer = self.core.remote_node_id, "shm attach failed: {e}");
                self.report(TransporterError::ShmUnableToAttachSegment);
                return false;
            }
        };
        self.segment = Some(segment);
        if !self.setup_buffers(base) {
            self.detach_shm(false);
            return false;
        }

        let ready = ControlLine::ShmServerReady { pid: std::process::id() };
        if write_control_line(&mut stream, &ready).is_err() {
            self.detach_shm(false);
            return false;
        }
        match read_control_line(&mut stream, self.core.timeout) {
            Ok(ControlLine::ShmClientReady { pid }) => self.remote_pid = pid,
            other => {
                debug!(peer = self.core.remote_node_id, ?other, "no shm-ready line from client");
                self.detach_shm(false);
                return false;
            }
        }

        if !self.connect_common() {
            self.detach_shm(false);
            return false;
        }

        if write_control_line(&mut stream, &ControlLine::ShmServerUp).is_err() {
            self.detach_shm(false);
            return false;
        }
        match read_control_line(&mut stream, self.core.timeout) {
            Ok(ControlLine::ShmClientUp) => {}
            other => {
                debug!(peer = self.core.remote_node_id, ?other, "no shm-up line from client");
                self.detach_shm(false);
                return false;
            }
        }

        self.set_socket(stream)
    }

    fn do_disconnect(&mut self) {
        if !self.core.connected && self.segment.is_none() && self.socket.is_none() {
            return;
        }
        self.core.connected = false;
        self.drop_socket();
        self.detach_shm(true);
    }

    fn get_write_ptr(&mut self, len_bytes: u32, _prio: u8) -> Option<&mut [u32]> {
        let writer = self.writer.as_mut()?;
        let ptr = writer.get_write_ptr(len_bytes)?;
        Some(unsafe {
            std::slice::from_raw_parts_mut(ptr.as_ptr() as *mut u32, (len_bytes / 4) as usize)
        })
    }

    fn update_write_ptr(&mut self, len_bytes: u32, _prio: u8) {
        if let Some(writer) = self.writer.as_mut() {
            writer.update_write_ptr(len_bytes);
        }
        self.core.account_sent(u64::from(len_bytes));
        self.wakeup();
    }

    fn has_data_to_send(&self) -> bool {
        // signals land in the shared ring at pack time; there is nothing to
        // flush afterwards
        false
    }

    fn send_is_possible(&self, _timeout: Duration) -> bool {
        true
    }

    fn do_send(&mut self) -> bool {
        self.wakeup();
        true
    }

    fn has_data_to_read(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| !r.empty())
    }

    /// Drain wake bytes off the control socket. Ring data needs no receive
    /// step; it is already visible through `recv_span`.
    fn do_receive(&mut self) -> usize {
        let mut buf = [0u8; 128];
        loop {
            let Some(socket) = &mut self.socket else { return 0 };
            match socket.read(&mut buf) {
                Ok(0) => {
                    self.core.last_errno = libc::ECONNRESET;
                    self.report(TransporterError::ShmDisconnect);
                    self.do_disconnect();
                    return 0;
                }
                Ok(n) if n == buf.len() => {}
                Ok(_) => return 0,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    return 0;
                }
                Err(e) => {
                    self.core.last_errno = e.raw_os_error().unwrap_or(0);
                    self.report(TransporterError::ShmDisconnect);
                    self.do_disconnect();
                    return 0;
                }
            }
        }
    }

    fn recv_span(&self) -> &[u32] {
        let Some(reader) = &self.reader else { return &[] };
        let (ptr, end) = reader.get_read_ptr();
        let bytes = unsafe { end.as_ptr().offset_from(ptr.as_ptr()) } as usize;
        unsafe { std::slice::from_raw_parts(ptr.as_ptr() as *const u32, bytes / 4) }
    }

    fn consume_recv(&mut self, words: usize) {
        let Some(reader) = self.reader.as_mut() else { return };
        let (ptr, _) = reader.get_read_ptr();
        let new_ptr =
            unsafe { NonNull::new_unchecked(ptr.as_ptr().add(words * 4)) };
        reader.update_read_ptr(new_ptr);
        self.core.account_received((words * 4) as u64);
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use signet_wire::{DeliveryOutcome, SignalHeader, SignalSink};

    use super::*;

    struct NullCb;
    impl SignalSink for NullCb {
        fn deliver_signal(
            &self,
            _h: &SignalHeader,
            _p: u8,
            _e: Option<TransporterError>,
            _d: &[u32],
            _s: &[&[u32]],
        ) -> DeliveryOutcome {
            DeliveryOutcome::Continue
        }
    }
    impl TransporterCallback for NullCb {}

    fn socket_pair() -> (mio::net::TcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        (mio::net::TcpStream::from_std(client), server)
    }

    fn aligned_region(size: usize) -> NonNull<u8> {
        let layout = std::alloc::Layout::from_size_align(size, 64).unwrap();
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap()
    }

    fn rigged_server() -> (ShmTransporter, StdTcpStream) {
        let cfg = ShmConfig::default();
        let mut t =
            ShmTransporter::new(1, 2, "127.0.0.1:1".parse().unwrap(), cfg, Arc::new(NullCb));
        let region = aligned_region(cfg.shm_size as usize);
        assert!(t.setup_buffers(region));
        let (wake_tx, peer_end) = socket_pair();
        t.socket = Some(wake_tx);
        t.core.connected = true;
        (t, peer_end)
    }

    fn push_message(t: &mut ShmTransporter, len_bytes: u32) {
        let region = t.get_write_ptr(len_bytes, 1).unwrap();
        region.fill(7);
        t.update_write_ptr(len_bytes, 1);
    }

    #[test]
    fn wake_protocol_sends_exactly_one_byte() {
        let (mut t, mut peer_end) = rigged_server();

        // the peer reader is asleep and has not been prodded yet
        t.reverse().unwrap().status_flag.store(0, Ordering::Release);
        t.reverse().unwrap().awakened_flag.store(0, Ordering::Release);

        push_message(&mut t, 100);

        peer_end.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(peer_end.read(&mut buf).unwrap(), 1);
        assert_eq!(t.reverse().unwrap().awakened_flag.load(Ordering::Acquire), 1);

        // still asleep, already prodded: no second byte
        push_message(&mut t, 100);
        peer_end.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        match peer_end.read(&mut buf) {
            Ok(n) => panic!("unexpected extra wake bytes: {n}"),
            Err(e) => assert!(matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )),
        }
    }

    #[test]
    fn awake_peer_is_not_prodded() {
        let (mut t, mut peer_end) = rigged_server();
        t.reverse().unwrap().status_flag.store(1, Ordering::Release);

        push_message(&mut t, 64);

        peer_end.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut buf = [0u8; 8];
        assert!(peer_end.read(&mut buf).is_err());
    }

    #[test]
    fn published_messages_visible_to_a_peer_reader() {
        let (mut t, _peer_end) = rigged_server();
        t.reverse().unwrap().status_flag.store(1, Ordering::Release);
        push_message(&mut t, 64);

        // the ring index advanced by exactly the published run
        let writer = t.writer.as_ref().unwrap();
        assert_eq!(writer.write_index(), 64);
        let usable = t.ring_total() - MAX_MESSAGE_SIZE;
        assert_eq!(writer.free_bytes(), usable - 64);
    }

    #[test]
    fn own_sleep_state_toggles_under_the_mutex() {
        let (t, _peer_end) = rigged_server();
        t.set_awake_state(false);
        assert_eq!(t.own().unwrap().status_flag.load(Ordering::Acquire), 0);
        t.set_awake_state(true);
        assert_eq!(t.own().unwrap().status_flag.load(Ordering::Acquire), 1);
        assert_eq!(t.own().unwrap().awakened_flag.load(Ordering::Acquire), 0);
    }
}
