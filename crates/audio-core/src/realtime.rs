//! Real-time scheduling for the tx thread

use tracing::debug;
#[cfg(unix)]
use tracing::warn;

/// Switch the calling thread to round-robin real-time scheduling.
///
/// Failure (typically missing privileges) is logged and the thread keeps
/// its normal priority.
#[cfg(unix)]
pub fn enable_realtime() -> bool {
    // SAFETY: plain libc calls on the current thread with an initialized
    // sched_param
    let rc = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = libc::sched_get_priority_min(libc::SCHED_RR).max(1);
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param)
    };

    if rc != 0 {
        warn!(
            "audio: real-time scheduling unavailable: {}",
            std::io::Error::from_raw_os_error(rc)
        );
        return false;
    }

    debug!("audio: tx thread running with SCHED_RR");
    true
}

/// Real-time scheduling is not supported on this platform
#[cfg(not(unix))]
pub fn enable_realtime() -> bool {
    debug!("audio: real-time scheduling not supported on this platform");
    false
}
