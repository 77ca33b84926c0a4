//! Outgoing message aggregation for backends that write byte streams.
//!
//! Framed messages are packed at the insert cursor; the backend drains from
//! the send cursor, possibly a few bytes at a time. `send_data_size` covers
//! the current contiguous run only; when it drains, the run is repositioned
//! to whatever untransmitted data remains.

/// Circular buffer of framed signals awaiting transmission.
pub struct SendBuffer {
    storage: Box<[u32]>,
    cap_bytes: u32,
    /// Bytes of buffered data in total.
    data_size: u32,
    /// Byte offset where the next message is packed.
    insert_off: u32,
    /// Byte offset of the in-flight contiguous run.
    send_off: u32,
    /// Remaining bytes of the in-flight run.
    send_data_size: u32,
}

impl SendBuffer {
    pub fn new(size_bytes: u32) -> Self {
        let words = (size_bytes / 4) as usize;
        Self {
            storage: vec![0u32; words].into_boxed_slice(),
            cap_bytes: (words * 4) as u32,
            data_size: 0,
            insert_off: 0,
            send_off: 0,
            send_data_size: 0,
        }
    }

    #[inline]
    pub fn size_remaining(&self) -> u32 {
        self.cap_bytes - self.data_size
    }

    #[inline]
    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    #[inline]
    pub fn has_data(&self) -> bool {
        self.data_size > 0
    }

    /// Word region for one message of `len_bytes` (a multiple of 4), or
    /// `None` when it does not fit. A granted region must be packed and
    /// committed with `update_insert_ptr` before the next grant.
    pub fn get_insert_ptr(&mut self, len_bytes: u32) -> Option<&mut [u32]> {
        debug_assert_eq!(len_bytes % 4, 0);
        if self.size_remaining() < len_bytes {
            return None;
        }

        if self.insert_off >= self.send_off {
            if self.insert_off + len_bytes < self.cap_bytes {
                // same contiguous run as the send cursor
                self.send_data_size += len_bytes;
                return Some(self.region(self.insert_off, len_bytes));
            }
            // past the end; only usable if the front has room
            if self.send_off <= len_bytes {
                return None;
            }
            self.insert_off = 0;
            if self.send_data_size == 0 {
                // previous run fully drained: restart it at the front
                self.send_off = 0;
                self.send_data_size = len_bytes;
            }
            return Some(self.region(0, len_bytes));
        }

        // send cursor ahead of insert cursor
        if self.insert_off + len_bytes < self.send_off {
            return Some(self.region(self.insert_off, len_bytes));
        }
        None
    }

    /// Whether `get_insert_ptr(len_bytes)` would succeed, without the grant
    /// side effects.
    pub fn can_insert(&self, len_bytes: u32) -> bool {
        if self.size_remaining() < len_bytes {
            return false;
        }
        if self.insert_off >= self.send_off {
            if self.insert_off + len_bytes < self.cap_bytes {
                return true;
            }
            return self.send_off > len_bytes;
        }
        self.insert_off + len_bytes < self.send_off
    }

    /// Commit `len_bytes` packed at the last granted region.
    pub fn update_insert_ptr(&mut self, len_bytes: u32) {
        self.data_size += len_bytes;
        self.insert_off += len_bytes;
    }

    /// Account for `n` bytes the backend actually wrote. Returns whether
    /// data remains buffered.
    ///
    /// The cursor discipline is a hard invariant; breaking it means the
    /// buffer and the wire have diverged and nothing sane can be sent.
    pub fn bytes_sent(&mut self, n: u32) -> bool {
        assert!(n <= self.send_data_size, "sent {n} > run {}", self.send_data_size);
        assert!(self.send_data_size <= self.data_size);

        self.data_size -= n;
        self.send_off += n;
        self.send_data_size -= n;

        if self.send_data_size == 0 {
            if self.send_off > self.insert_off {
                // insert cursor wrapped behind us; continue from the front
                self.send_off = 0;
            } else {
                self.send_off = self.insert_off - self.data_size;
            }
            self.send_data_size = self.data_size;
        }

        self.data_size > 0
    }

    /// The bytes the backend should write next.
    #[inline]
    pub fn send_span(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                (self.storage.as_ptr() as *const u8).add(self.send_off as usize),
                self.send_data_size as usize,
            )
        }
    }

    /// Drop everything; post-disconnect state equals post-construction.
    pub fn empty_buffer(&mut self) {
        self.data_size = 0;
        self.insert_off = 0;
        self.send_off = 0;
        self.send_data_size = 0;
    }

    #[inline]
    fn region(&mut self, off_bytes: u32, len_bytes: u32) -> &mut [u32] {
        let start = (off_bytes / 4) as usize;
        let len = (len_bytes / 4) as usize;
        &mut self.storage[start..start + len]
    }
}
