use std::{cell::UnsafeCell, io, mem::MaybeUninit};

/// A `pthread_mutex_t` living inside a shared memory region, usable from
/// both attached processes.
///
/// The segment-creating side calls `init_shared` exactly once before
/// publishing the region; the last detacher calls `destroy`. Lock recovery
/// after an owner death is handled via the robust attribute where the
/// platform provides it.
#[repr(C, align(16))]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialize the mutex in place with `PTHREAD_PROCESS_SHARED`.
    ///
    /// # Safety
    /// `this` must point into a mapped region with space and alignment for a
    /// `SharedMutex`, and no other process may touch it until initialized.
    pub unsafe fn init_shared(this: *mut Self) -> io::Result<()> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            let mut eno = libc::pthread_mutexattr_init(attr.as_mut_ptr());
            if eno != 0 {
                return Err(io::Error::from_raw_os_error(eno));
            }
            eno = libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            if eno == 0 {
                #[cfg(target_os = "linux")]
                {
                    eno = libc::pthread_mutexattr_setrobust(
                        attr.as_mut_ptr(),
                        libc::PTHREAD_MUTEX_ROBUST,
                    );
                }
            }
            if eno == 0 {
                eno = libc::pthread_mutex_init((*this).inner.get(), attr.as_ptr());
            }
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            if eno != 0 {
                return Err(io::Error::from_raw_os_error(eno));
            }
            Ok(())
        }
    }

    pub fn lock(&self) {
        unsafe {
            let eno = libc::pthread_mutex_lock(self.inner.get());
            #[cfg(target_os = "linux")]
            if eno == libc::EOWNERDEAD {
                // previous owner died holding the lock; our protected state
                // is a pair of word-sized flags, always consistent
                libc::pthread_mutex_consistent(self.inner.get());
                return;
            }
            if eno != 0 {
                signet_utils::safe_panic!("shared mutex lock failed: errno {eno}");
            }
        }
    }

    pub fn unlock(&self) {
        unsafe {
            let eno = libc::pthread_mutex_unlock(self.inner.get());
            if eno != 0 {
                signet_utils::safe_panic!("shared mutex unlock failed: errno {eno}");
            }
        }
    }

    /// # Safety
    /// Only the last process detaching from the region may destroy, and only
    /// while no one holds the lock.
    pub unsafe fn destroy(this: *mut Self) {
        unsafe {
            libc::pthread_mutex_destroy((*this).inner.get());
        }
    }
}
