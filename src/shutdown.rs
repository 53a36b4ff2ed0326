//! Cooperative shutdown.
//!
//! Signals only ever set the [`StopFlag`]. Joining the stream thread and
//! releasing the radio happen on the orchestrating thread once it notices.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{info, warn};

use crate::{error::SignalError, session::SessionContext};

/// One-way stop request observed by the stream callback and the orchestrator
#[derive(Debug, Default)]
pub struct StopFlag(AtomicBool);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns `true` only for the call that actually flipped it,
    /// so repeated requests are no-ops.
    pub fn request(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Stop the capture on SIGINT, SIGTERM or SIGHUP, and make a best-effort stop
/// request on SIGABRT and SIGQUIT.
///
/// The termination handler runs on ctrlc's own thread, not in signal context,
/// and does nothing but set the flag. SIGSEGV, SIGILL and SIGFPE keep their
/// default action: after them the process state can no longer be trusted to
/// run a teardown.
pub fn install_signal_handler(session: Arc<SessionContext>) -> Result<(), SignalError> {
    register_fatal_signals(&session)?;
    ctrlc::set_handler(move || {
        if session.stop.request() {
            info!("Caught signal, stopping capture");
        } else {
            warn!("Already stopping");
        }
    })?;
    Ok(())
}

/// Raise the stop flag from inside the signal handler. An atomic swap is all
/// that runs there, no logging and no allocation.
#[cfg(unix)]
fn register_fatal_signals(session: &Arc<SessionContext>) -> Result<(), SignalError> {
    use signal_hook::consts::{SIGABRT, SIGQUIT};

    for signal in [SIGABRT, SIGQUIT] {
        let session = Arc::clone(session);
        // Safety: the action only touches an atomic, which is async-signal-safe
        unsafe {
            signal_hook::low_level::register(signal, move || {
                session.stop.request();
            })
        }
        .map_err(|source| SignalError::Register { signal, source })?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn register_fatal_signals(_session: &Arc<SessionContext>) -> Result<(), SignalError> {
    Ok(())
}
