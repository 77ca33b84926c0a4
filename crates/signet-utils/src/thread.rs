use core_affinity::CoreId;
use tracing::warn;

/// Scheduling class for service threads. Anything but `OSDefault` requests
/// `SCHED_FIFO` realtime scheduling, which needs CAP_SYS_NICE; on failure
/// the thread simply stays on the default scheduler.
#[derive(Clone, Copy, Debug)]
pub enum ThreadPriority {
    OSDefault,
    Low,
    Medium,
    High,
    Custom(i32),
}

impl ThreadPriority {
    fn fifo_priority(self) -> Option<i32> {
        match self {
            ThreadPriority::OSDefault => None,
            ThreadPriority::Low => Some(40),
            ThreadPriority::Medium => Some(60),
            ThreadPriority::High => Some(75),
            ThreadPriority::Custom(p) => Some(p),
        }
    }
}

/// Pin and prioritize the calling thread. First statement of a service
/// thread's body.
pub fn thread_boot(core: Option<usize>, prio: ThreadPriority) {
    if let Some(core) = core {
        if !core_affinity::set_for_current(CoreId { id: core }) {
            warn!(?core, "couldn't set core affinity");
        }
    }

    #[cfg(target_os = "linux")]
    if let Some(sched_priority) = prio.fifo_priority() {
        let param = libc::sched_param { sched_priority };
        let code = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if code != 0 {
            warn!(%code, sched_priority, "couldn't set thread priority");
        }
    }

    #[cfg(not(target_os = "linux"))]
    if prio.fifo_priority().is_some() {
        warn!(?prio, "thread priority setting only supported on linux");
    }
}
