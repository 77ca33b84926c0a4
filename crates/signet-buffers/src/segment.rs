use std::{io, ptr::NonNull};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("unable to create segment key {key}: {source}")]
    Create { key: i32, source: io::Error },
    #[error("unable to open segment key {key}: {source}")]
    Open { key: i32, source: io::Error },
    #[error("unable to attach segment id {id}: {source}")]
    Attach { id: i32, source: io::Error },
    #[error("segment stat failed for id {id}: {source}")]
    Stat { id: i32, source: io::Error },
    #[error("unable to remove segment id {id}: {source}")]
    Remove { id: i32, source: io::Error },
    #[error("unable to detach segment id {id}: {source}")]
    Detach { id: i32, source: io::Error },
}

/// One SysV shared memory segment, keyed per (local, remote) node pair.
///
/// The server side creates, the client side opens. Both attach; the segment
/// is marked removed (`IPC_RMID`) as soon as the pairing is confirmed so a
/// crash of either process takes the segment with it.
pub struct SysvSegment {
    key: i32,
    id: i32,
    size: u32,
    base: Option<NonNull<u8>>,
    created: bool,
}

unsafe impl Send for SysvSegment {}

const SEGMENT_MODE: i32 = 0o740;

impl SysvSegment {
    /// Create the segment (server side). A stale segment under the same key
    /// with an incompatible size is torn down and recreated.
    pub fn create(key: i32, size: u32) -> Result<Self, SegmentError> {
        let mut id =
            unsafe { libc::shmget(key, size as libc::size_t, libc::IPC_CREAT | SEGMENT_MODE) };
        if id == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EINVAL) {
            // exists with a smaller size; remove and retry once
            warn!(key, size, "stale shm segment with mismatched size, recreating");
            let stale = unsafe { libc::shmget(key, 0, 0) };
            if stale != -1 {
                unsafe { libc::shmctl(stale, libc::IPC_RMID, std::ptr::null_mut()) };
            }
            id = unsafe { libc::shmget(key, size as libc::size_t, libc::IPC_CREAT | SEGMENT_MODE) };
        }
        if id == -1 {
            return Err(SegmentError::Create { key, source: io::Error::last_os_error() });
        }
        debug!(key, id, size, "created shm segment");
        Ok(Self { key, id, size, base: None, created: true })
    }

    /// Open an existing segment (client side); never creates.
    pub fn open(key: i32, size: u32) -> Result<Self, SegmentError> {
        let id = unsafe { libc::shmget(key, size as libc::size_t, 0) };
        if id == -1 {
            return Err(SegmentError::Open { key, source: io::Error::last_os_error() });
        }
        Ok(Self { key, id, size, base: None, created: false })
    }

    pub fn attach(&mut self) -> Result<NonNull<u8>, SegmentError> {
        if let Some(base) = self.base {
            return Ok(base);
        }
        let addr = unsafe { libc::shmat(self.id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            let source = io::Error::last_os_error();
            if self.created {
                unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
                self.created = false;
            }
            return Err(SegmentError::Attach { id: self.id, source });
        }
        let base = NonNull::new(addr as *mut u8).expect("shmat returned null");
        self.base = Some(base);
        Ok(base)
    }

    /// Mark the segment for removal. Attached processes keep their mapping;
    /// the kernel reclaims it when the last one detaches (or dies).
    pub fn mark_removed(&mut self) -> Result<(), SegmentError> {
        let res = unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if res == -1 {
            return Err(SegmentError::Remove { id: self.id, source: io::Error::last_os_error() });
        }
        self.created = false;
        Ok(())
    }

    /// Number of processes currently attached. The pairing check: exactly 2
    /// once both sides are up.
    pub fn attach_count(&self) -> Result<u64, SegmentError> {
        let mut info = std::mem::MaybeUninit::<libc::shmid_ds>::uninit();
        let res = unsafe { libc::shmctl(self.id, libc::IPC_STAT, info.as_mut_ptr()) };
        if res == -1 {
            return Err(SegmentError::Stat { id: self.id, source: io::Error::last_os_error() });
        }
        Ok(unsafe { info.assume_init() }.shm_nattch as u64)
    }

    pub fn detach(&mut self) -> Result<(), SegmentError> {
        if let Some(base) = self.base.take() {
            let res = unsafe { libc::shmdt(base.as_ptr() as *const libc::c_void) };
            if res == -1 {
                return Err(SegmentError::Detach { id: self.id, source: io::Error::last_os_error() });
            }
        }
        Ok(())
    }

    #[inline]
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn key(&self) -> i32 {
        self.key
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.base.is_some()
    }
}

impl Drop for SysvSegment {
    fn drop(&mut self) {
        let _ = self.detach();
        if self.created {
            unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        }
    }
}
