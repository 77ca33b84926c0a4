use std::{
    net::TcpStream as StdTcpStream,
    ptr::NonNull,
    sync::Arc,
    time::{Duration, Instant},
};

use signet_buffers::{RingControl, RingReader, RingWriter};
use signet_wire::{MAX_MESSAGE_SIZE, NodeId, TransporterError};
use tracing::{debug, warn};

use crate::{
    config::RdmaConfig,
    control::TransporterKind,
    core::{Link, TransporterCallback, TransporterCore},
};

/// Why a remote write did not land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// Retryable; the adapter's sequence caught a failed write.
    TransferFailed,
    /// Alignment/range class failures; no retry will help.
    Unrecoverable,
}

/// One remote-memory adapter: a path to the peer's receive segment plus a
/// sequence primitive that detects failed writes. Production uses mapped
/// shared segments; tests inject faults.
pub trait DmaAdapter: Send {
    fn link_ok(&self) -> bool;
    /// Map our receive segment (created by us, written by the peer).
    fn map_local(&mut self, size: u32) -> Result<NonNull<u8>, TransporterError>;
    /// Map the peer's receive segment.
    fn map_remote(&mut self, size: u32) -> Result<NonNull<u8>, TransporterError>;
    fn create_sequence(&mut self) -> Result<(), TransporterError>;
    fn start_sequence(&mut self) -> Result<(), TransporterError>;
    fn remove_sequence(&mut self) -> Result<(), TransporterError>;
    /// Order all prior stores on this adapter before any later ones.
    fn store_barrier(&mut self);
    /// Copy `data` into the remote segment at `offset` from its base.
    fn transfer(&mut self, offset: u32, data: &[u8]) -> Result<(), TransferError>;
    fn unmap(&mut self) -> Result<(), TransporterError>;
}

/// Remote-DMA backend emulated over mapped shared segments: packed signals
/// coalesce in a local staging buffer and are pushed into the peer's ring
/// through the active adapter, failing over to the standby mid-send when
/// the active link dies.
pub struct RdmaTransporter {
    core: TransporterCore,
    cfg: RdmaConfig,
    adapters: Vec<Box<dyn DmaAdapter>>,
    active: usize,
    standby: usize,
    writers: Vec<Option<RingWriter>>,
    remote_bases: Vec<Option<NonNull<u8>>>,
    reader: Option<RingReader>,
    send_buf: Box<[u32]>,
    send_bytes: u32,
    socket: Option<StdTcpStream>,
    fail_counter: u32,
}

unsafe impl Send for RdmaTransporter {}

impl RdmaTransporter {
    pub fn new(
        local: NodeId,
        remote: NodeId,
        remote_addr: std::net::SocketAddr,
        cfg: RdmaConfig,
        adapters: Vec<Box<dyn DmaAdapter>>,
        callback: Arc<dyn TransporterCallback>,
    ) -> Self {
        assert!(
            (1..=2).contains(&adapters.len()),
            "remote-dma runs on one adapter or an active/standby pair"
        );
        let n = adapters.len();
        let core = TransporterCore::new(
            local,
            remote,
            TransporterKind::Rdma,
            remote_addr,
            cfg.framing.signal_id_used,
            cfg.framing.checksum_used,
            cfg.framing.report_freq,
            callback,
        );
        Self {
            core,
            cfg,
            adapters,
            active: 0,
            standby: n - 1,
            writers: (0..n).map(|_| None).collect(),
            remote_bases: vec![None; n],
            reader: None,
            send_buf: Box::new([]),
            send_bytes: 0,
            socket: None,
            fail_counter: 0,
        }
    }

    #[inline]
    fn segment_size(&self) -> u32 {
        RingControl::SIZE as u32 + self.cfg.buffer_size
    }

    fn report(&self, kind: TransporterError) {
        self.core.callback.report_error(self.core.remote_node_id, kind);
    }

    /// Map both directions through every adapter and build the rings.
    fn setup_channels(&mut self) -> Result<(), TransporterError> {
        let seg_size = self.segment_size();
        let ring_total = self.cfg.buffer_size;
        let slack = MAX_MESSAGE_SIZE;

        let local_base = self.adapters[0]
            .map_local(seg_size)
            .map_err(|_| TransporterError::RdmaCannotInitLocalSegment)?;
        unsafe {
            let ctl = NonNull::new_unchecked(local_base.as_ptr() as *mut RingControl);
            ctl.as_ref().reset();
            let data = NonNull::new_unchecked(local_base.as_ptr().add(RingControl::SIZE));
            self.reader = Some(RingReader::new(ctl, data, ring_total, slack));
        }

        // the peer's segment may lag ours; retry mapping up to the timeout
        let deadline = Instant::now() + self.core.timeout;
        for i in 0..self.adapters.len() {
            let base = loop {
                match self.adapters[i].map_remote(seg_size) {
                    Ok(base) => break base,
                    Err(_) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => return Err(TransporterError::RdmaCannotMapRemoteSegment),
                }
            };
            self.remote_bases[i] = Some(base);
            unsafe {
                let ctl = NonNull::new_unchecked(base.as_ptr() as *mut RingControl);
                let data = NonNull::new_unchecked(base.as_ptr().add(RingControl::SIZE));
                self.writers[i] = Some(RingWriter::new(ctl, data, ring_total, slack));
            }
            self.adapters[i]
                .create_sequence()
                .map_err(|_| TransporterError::RdmaUnableToCreateSequence)?;
        }
        self.adapters[self.active]
            .start_sequence()
            .map_err(|_| TransporterError::RdmaUnableToStartSequence)?;
        Ok(())
    }

    fn teardown_channels(&mut self, report_errors: bool) {
        self.reader = None;
        for i in 0..self.adapters.len() {
            self.writers[i] = None;
            self.remote_bases[i] = None;
            if self.adapters[i].remove_sequence().is_err() && report_errors {
                self.report(TransporterError::RdmaUnableToRemoveSequence);
            }
            if self.adapters[i].unmap().is_err() && report_errors {
                self.report(TransporterError::RdmaUnableToUnmapSegment);
            }
        }
    }

    fn finish_connect(&mut self, stream: StdTcpStream) -> bool {
        match self.setup_channels() {
            Ok(()) => {
                self.socket = Some(stream);
                self.core.connected = true;
                self.core.last_errno = 0;
                true
            }
            Err(kind) => {
                self.report(kind);
                self.teardown_channels(false);
                false
            }
        }
    }

    /// Swap to the standby adapter mid-send: carry the writer cursor over,
    /// fence the new path, restart the sequence pair.
    fn failover(&mut self) -> bool {
        let (act, stb) = (self.active, self.standby);
        debug!(peer = self.core.remote_node_id, from = act, to = stb, "adapter failover");

        let src = self.writers[act].take();
        if let (Some(src), Some(dst)) = (&src, self.writers[stb].as_mut()) {
            dst.copy_indexes_from(src);
        }
        self.writers[act] = src;

        self.adapters[stb].store_barrier();
        self.active = stb;
        self.standby = act;

        if self.adapters[act].remove_sequence().is_err() {
            self.report(TransporterError::RdmaUnableToRemoveSequence);
        }
        if self.adapters[stb].start_sequence().is_err() {
            self.report(TransporterError::RdmaUnableToStartSequence);
            return false;
        }
        true
    }

    /// Times a transfer fell over to the other adapter since connect.
    #[inline]
    pub fn failover_count(&self) -> u32 {
        self.fail_counter
    }
}

impl Link for RdmaTransporter {
    fn core(&self) -> &TransporterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TransporterCore {
        &mut self.core
    }

    fn init(&mut self) -> Result<(), TransporterError> {
        if self.cfg.buffer_size <= MAX_MESSAGE_SIZE + 4096 {
            return Err(TransporterError::RdmaCannotInitLocalSegment);
        }
        self.send_buf = vec![0u32; (self.cfg.buffer_size / 4) as usize].into_boxed_slice();
        Ok(())
    }

    fn connect_client(&mut self) -> bool {
        if self.core.connected {
            return true;
        }
        let Some(stream) = self.core.connect_and_greet() else { return false };
        self.finish_connect(stream)
    }

    fn connect_server(&mut self, stream: StdTcpStream) -> bool {
        if self.core.connected {
            return false;
        }
        self.finish_connect(stream)
    }

    fn do_disconnect(&mut self) {
        if !self.core.connected {
            return;
        }
        self.core.connected = false;
        self.socket = None;
        self.send_bytes = 0;
        self.fail_counter = 0;
        self.teardown_channels(true);
    }

    fn get_write_ptr(&mut self, len_bytes: u32, prio: u8) -> Option<&mut [u32]> {
        let cap = (self.send_buf.len() * 4) as u32;
        if self.send_bytes + len_bytes > cap {
            // staging full: push what we have and retry once
            self.do_send();
            if self.send_bytes + len_bytes > cap {
                return None;
            }
        }
        let _ = prio;
        let start = (self.send_bytes / 4) as usize;
        Some(&mut self.send_buf[start..start + (len_bytes / 4) as usize])
    }

    fn update_write_ptr(&mut self, len_bytes: u32, _prio: u8) {
        self.send_bytes += len_bytes;
        if self.send_bytes >= self.cfg.packet_size {
            self.do_send();
        }
    }

    fn has_data_to_send(&self) -> bool {
        self.send_bytes > 0
    }

    fn send_is_possible(&self, _timeout: Duration) -> bool {
        true
    }

    fn do_send(&mut self) -> bool {
        if self.send_bytes == 0 {
            return true;
        }
        let size = self.send_bytes;
        let mut retry = 0u32;

        loop {
            retry += 1;
            if retry > 3 {
                self.report(TransporterError::RdmaUnrecoverableDataTfxError);
                return false;
            }

            let offset = {
                let Some(writer) = self.writers[self.active].as_mut() else { return false };
                let Some(ptr) = writer.get_write_ptr(size) else {
                    // remote ring full; the peer must drain first
                    return false;
                };
                let Some(base) = self.remote_bases[self.active] else { return false };
                unsafe { ptr.as_ptr().offset_from(base.as_ptr()) as u32 }
            };

            let result = {
                let span = unsafe {
                    std::slice::from_raw_parts(self.send_buf.as_ptr() as *const u8, size as usize)
                };
                self.adapters[self.active].transfer(offset, span)
            };

            match result {
                Ok(()) => {
                    if let Some(writer) = self.writers[self.active].as_mut() {
                        writer.update_write_ptr(size);
                    }
                    self.send_bytes = 0;
                    self.core.account_sent(u64::from(size));
                    return true;
                }
                Err(TransferError::Unrecoverable) => {
                    self.report(TransporterError::RdmaUnrecoverableDataTfxError);
                    return false;
                }
                Err(TransferError::TransferFailed) => {
                    if self.adapters[self.active].link_ok() {
                        // glitch on a healthy link: plain retry
                        continue;
                    }
                    if self.adapters.len() == 1 {
                        self.report(TransporterError::RdmaUnrecoverableDataTfxError);
                        return false;
                    }
                    self.fail_counter += 1;
                    if !self.adapters[self.standby].link_ok() {
                        self.report(TransporterError::RdmaLinkError);
                        self.report(TransporterError::RdmaUnrecoverableDataTfxError);
                        return false;
                    }
                    if !self.failover() {
                        return false;
                    }
                }
            }
        }
    }

    fn has_data_to_read(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| !r.empty())
    }

    fn do_receive(&mut self) -> usize {
        0
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
        let new_ptr = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(words * 4)) };
        reader.update_read_ptr(new_ptr);
        self.core.account_received((words * 4) as u64);
    }
}

/// Production adapter: both paths of a pair map the same named segments, so
/// a failover lands writes in the same remote ring through the other path.
pub struct SegmentAdapter {
    local_name: String,
    remote_name: String,
    local: Option<shared_memory::Shmem>,
    remote: Option<shared_memory::Shmem>,
    sequence_started: bool,
}

unsafe impl Send for SegmentAdapter {}

impl SegmentAdapter {
    /// `local` and `remote` name the two directions of the node pair; both
    /// adapters of a pair get identical names.
    pub fn new(local: String, remote: String) -> Self {
        Self {
            local_name: local,
            remote_name: remote,
            local: None,
            remote: None,
            sequence_started: false,
        }
    }

    fn flink(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(name)
    }

    fn create_or_open(name: &str, size: u32) -> Result<shared_memory::Shmem, TransporterError> {
        use shared_memory::{ShmemConf, ShmemError};
        let path = Self::flink(name);
        match ShmemConf::new().size(size as usize).flink(&path).create() {
            Ok(shmem) => Ok(shmem),
            Err(ShmemError::LinkExists) => ShmemConf::new()
                .flink(&path)
                .open()
                .map_err(|_| TransporterError::RdmaCannotInitLocalSegment),
            Err(e) => {
                warn!("couldn't create segment {name}: {e}");
                Err(TransporterError::RdmaCannotInitLocalSegment)
            }
        }
    }
}

impl DmaAdapter for SegmentAdapter {
    fn link_ok(&self) -> bool {
        true
    }

    fn map_local(&mut self, size: u32) -> Result<NonNull<u8>, TransporterError> {
        let shmem = Self::create_or_open(&self.local_name, size)?;
        let ptr = NonNull::new(shmem.as_ptr()).ok_or(TransporterError::RdmaCannotInitLocalSegment)?;
        self.local = Some(shmem);
        Ok(ptr)
    }

    fn map_remote(&mut self, _size: u32) -> Result<NonNull<u8>, TransporterError> {
        let shmem = shared_memory::ShmemConf::new()
            .flink(Self::flink(&self.remote_name))
            .open()
            .map_err(|_| TransporterError::RdmaCannotMapRemoteSegment)?;
        let ptr = NonNull::new(shmem.as_ptr()).ok_or(TransporterError::RdmaCannotMapRemoteSegment)?;
        self.remote = Some(shmem);
        Ok(ptr)
    }

    fn create_sequence(&mut self) -> Result<(), TransporterError> {
        Ok(())
    }

    fn start_sequence(&mut self) -> Result<(), TransporterError> {
        self.sequence_started = true;
        Ok(())
    }

    fn remove_sequence(&mut self) -> Result<(), TransporterError> {
        self.sequence_started = false;
        Ok(())
    }

    fn store_barrier(&mut self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    fn transfer(&mut self, offset: u32, data: &[u8]) -> Result<(), TransferError> {
        let Some(remote) = &self.remote else { return Err(TransferError::Unrecoverable) };
        if offset as usize + data.len() > remote.len() {
            return Err(TransferError::Unrecoverable);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                remote.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn unmap(&mut self) -> Result<(), TransporterError> {
        self.local = None;
        self.remote = None;
        Ok(())
    }
}
