//! Realtime scheduling acquire/release
//!
//! The engine requests SCHED_FIFO on start and drops back to SCHED_OTHER
//! on stop; the proxy server runs one priority step below the engine so
//! disk service can never starve the audio path.

/// Switch the calling thread to SCHED_FIFO at `priority`
///
/// Returns false (and logs) when the scheduler change is refused, which
/// is the normal case without CAP_SYS_NICE; processing continues without
/// realtime scheduling.
#[cfg(unix)]
pub fn acquire_realtime(priority: i32) -> bool {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc == 0 {
        log::debug!("using realtime scheduling (SCHED_FIFO, priority {})", priority);
        true
    } else {
        log::warn!("unable to acquire realtime scheduling (priority {})", priority);
        false
    }
}

/// Return the calling thread to the normal scheduler
#[cfg(unix)]
pub fn release_realtime() {
    let param = libc::sched_param { sched_priority: 0 };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_OTHER, &param) };
    if rc == 0 {
        log::debug!("changed back to non-realtime scheduling");
    } else {
        log::warn!("unable to change scheduling back to SCHED_OTHER");
    }
}

#[cfg(not(unix))]
pub fn acquire_realtime(_priority: i32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn release_realtime() {}
