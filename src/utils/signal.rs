//! Signal handling for graceful cleanup on interruption.
//!
//! Installs SIGINT/SIGTERM handlers so that a run can unmount the target
//! tree and close the root mapping before exiting.
//!
//! - First signal: sets the interrupted flag; the running command finishes
//!   and the next one is refused, then cleanup runs.
//! - Second signal: restores the default handler and re-raises, forcing
//!   immediate termination.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

static SIGNAL_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Signal number that triggered the first interruption.
static CAUGHT_SIGNAL: AtomicUsize = AtomicUsize::new(0);

/// Async-signal-safe handler: only atomics and raw `write(2, …)`.
extern "C" fn handle_signal(sig: libc::c_int) {
    let prev = SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst);

    if prev == 0 {
        INTERRUPTED.store(true, Ordering::SeqCst);
        CAUGHT_SIGNAL.store(sig as usize, Ordering::SeqCst);

        let msg = b"\nInterrupt received, cleaning up...\n";
        unsafe {
            libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        }
    } else {
        let msg = b"\nForced exit - mounts may remain. Run: architect cleanup\n";
        unsafe {
            libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    }
}

/// Install signal handlers for SIGINT and SIGTERM. Idempotent.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_signal as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            handle_signal as *const () as libc::sighandler_t,
        );
    }
}

/// Returns `true` if an interrupt signal has been received.
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Signal that interrupted the run, if any.
pub fn caught_signal() -> Option<i32> {
    match CAUGHT_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        sig => Some(sig as i32),
    }
}
