//! Interrupt delivery for running spinners.
//!
//! A process-wide SIGINT handler bumps a generation counter; a spinner that
//! sees the counter move during its run stops and reports no result. The
//! handler is installed while at least one run wants it, and the handler that
//! was there before is put back when the last of them finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::reactor::Reactor;

/// Programmatic trigger with the same effect as an interrupt signal.
///
/// Obtained from [`Spinner::interrupter`](super::Spinner::interrupter). The
/// trigger only affects the run in progress: every run starts uninterrupted.
#[derive(Clone, Debug)]
pub struct Interrupter {
    pub(crate) flag: Arc<AtomicBool>,
    pub(crate) reactor: Reactor,
}

impl Interrupter {
    /// Interrupts the current run.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
        self.reactor.wake();
    }

    pub(crate) fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(unix)]
pub(crate) use self::unix::{generation, install, SignalGuard};

#[cfg(not(unix))]
pub(crate) use self::fallback::{generation, install, SignalGuard};

#[cfg(unix)]
mod unix {
    use std::ffi::c_int;
    use std::sync::atomic::{AtomicU64, Ordering};

    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use parking_lot::{const_mutex, Mutex};

    static GENERATION: AtomicU64 = AtomicU64::new(0);

    struct Installed {
        count: usize,
        previous: Option<SigAction>,
    }

    static INSTALLED: Mutex<Installed> = const_mutex(Installed {
        count: 0,
        previous: None,
    });

    extern "C" fn on_sigint(_: c_int) {
        GENERATION.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of interrupts received so far.
    pub(crate) fn generation() -> u64 {
        GENERATION.load(Ordering::SeqCst)
    }

    /// Keeps the SIGINT handler installed while alive.
    #[derive(Debug)]
    pub(crate) struct SignalGuard(());

    /// Installs the SIGINT handler, or takes another reference to it.
    ///
    /// Returns `None` if the handler could not be installed.
    pub(crate) fn install() -> Option<SignalGuard> {
        let mut installed = INSTALLED.lock();
        if installed.count == 0 {
            let action = SigAction::new(
                SigHandler::Handler(on_sigint),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            // SAFETY: the handler only touches an atomic counter.
            match unsafe { sigaction(Signal::SIGINT, &action) } {
                Ok(previous) => installed.previous = Some(previous),
                Err(errno) => {
                    tracing::warn!(%errno, "could not install SIGINT handler");
                    return None;
                }
            }
            tracing::trace!("SIGINT handler installed");
        }
        installed.count += 1;
        Some(SignalGuard(()))
    }

    impl Drop for SignalGuard {
        fn drop(&mut self) {
            let mut installed = INSTALLED.lock();
            installed.count -= 1;
            if installed.count > 0 {
                return;
            }
            if let Some(previous) = installed.previous.take() {
                // SAFETY: restores the handler that was in place before install.
                if let Err(errno) = unsafe { sigaction(Signal::SIGINT, &previous) } {
                    tracing::warn!(%errno, "could not restore SIGINT handler");
                }
                tracing::trace!("SIGINT handler restored");
            }
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    /// Signals are not handled on this platform.
    pub(crate) fn generation() -> u64 {
        0
    }

    #[derive(Debug)]
    pub(crate) struct SignalGuard(());

    pub(crate) fn install() -> Option<SignalGuard> {
        None
    }
}
