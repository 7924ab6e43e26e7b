/// # Signals
///
/// Shared termination state between the main thread, the event consumer and
/// the host backends. A `Running` instance can also be tied to the
/// termination signals (SIGINT, SIGTERM, etc).
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::Result;
use log::info;
use signal_hook::iterator::Signals;

#[derive(Clone)]
pub(crate) struct Running {
    condition: Arc<AtomicBool>,
    // Used to wake up sleepers early on termination.
    wakeup: Arc<(Mutex<()>, Condvar)>,
}

impl Running {
    // Create a new Running instance, stopping upon receiving one of the
    // termination signals.
    pub(crate) fn new() -> Result<Running> {
        let mut sigs = Signals::new(signal_hook::consts::TERM_SIGNALS)?;

        let run = Self::ignore_signals();
        let cloned = run.clone();

        thread::spawn(move || {
            sigs.wait();
            info!("Received signal, terminating...");
            cloned.terminate();
        });

        Ok(run)
    }

    // Same as `new()` but without handling termination signals. Termination
    // *must* be manually handled here.
    pub(crate) fn ignore_signals() -> Running {
        Self {
            condition: Arc::new(AtomicBool::new(false)),
            wakeup: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    pub(crate) fn running(&self) -> bool {
        !self.condition.load(Ordering::Relaxed)
    }

    pub(crate) fn terminate(&self) {
        self.condition.store(true, Ordering::Relaxed);

        let (lock, cvar) = &*self.wakeup;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        cvar.notify_all();
    }

    /// Sleep for `duration`, or less if terminated in the meantime. Returns
    /// whether we're still running.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let (lock, cvar) = &*self.wakeup;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = cvar
            .wait_timeout_while(guard, duration, |_| self.running())
            .unwrap_or_else(PoisonError::into_inner);

        self.running()
    }
}
