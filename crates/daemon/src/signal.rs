//! Quit-flag signal handling.
//!
//! Handlers do the minimum async-signal-safe work possible: they store into
//! process-wide atomics. `SIGINT`, `SIGTERM` and `SIGQUIT` request process
//! termination; `SIGHUP`, `SIGUSR1` and `SIGUSR2` bump an interruption
//! generation that makes every active connection close at its next request
//! boundary while the accept loop keeps running. Handlers are installed
//! without `SA_RESTART` so a signal also knocks the accept loop out of its
//! blocking syscall.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::DaemonError;

static TERMINATE: AtomicBool = AtomicBool::new(false);
static INTERRUPT_GENERATION: AtomicU64 = AtomicU64::new(0);

/// True once a terminating signal has arrived.
pub fn terminating() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

/// Monotonic counter of connection-interrupting signals. A connection
/// captures the value at startup and closes when it changes.
pub fn interrupt_generation() -> u64 {
    INTERRUPT_GENERATION.load(Ordering::SeqCst)
}

/// Marks the process as terminating, as a signal would. Used by transports
/// that decide to stop on their own.
pub fn request_termination() {
    TERMINATE.store(true, Ordering::SeqCst);
}

extern "C" fn on_signal(signal: libc::c_int) {
    match signal {
        libc::SIGINT | libc::SIGTERM | libc::SIGQUIT => {
            TERMINATE.store(true, Ordering::SeqCst);
        }
        _ => {
            INTERRUPT_GENERATION.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Installs the handler set. Call once at startup, before any transport
/// begins blocking.
pub fn install_handlers() -> Result<(), DaemonError> {
    const SIGNALS: [(libc::c_int, &str); 6] = [
        (libc::SIGHUP, "SIGHUP"),
        (libc::SIGINT, "SIGINT"),
        (libc::SIGTERM, "SIGTERM"),
        (libc::SIGQUIT, "SIGQUIT"),
        (libc::SIGUSR1, "SIGUSR1"),
        (libc::SIGUSR2, "SIGUSR2"),
    ];

    for (signal, name) in SIGNALS {
        // SAFETY: the handler only stores into atomics, which is
        // async-signal-safe; the sigaction struct is fully initialized.
        let result = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as usize;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = 0;
            libc::sigaction(signal, &action, std::ptr::null_mut())
        };

        if result == -1 {
            return Err(DaemonError::Signals {
                name,
                source: std::io::Error::last_os_error(),
            });
        }
        logging::log_debug!("{name} handler installed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_flag_is_sticky() {
        request_termination();
        assert!(terminating());
    }

    #[test]
    fn usr1_bumps_the_interrupt_generation() {
        install_handlers().expect("install handlers");
        let before = interrupt_generation();
        // SAFETY: raises a signal inside this process; the installed
        // handler only touches atomics.
        unsafe { libc::raise(libc::SIGUSR1) };
        assert!(interrupt_generation() > before);
    }
}
