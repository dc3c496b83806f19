//! Signal handling for the service loop.
//!
//! SIGTERM/SIGINT request shutdown, SIGHUP a config reload, SIGUSR1 an
//! immediate upload check. Handlers only set flags; the loop polls them.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Flags shared between OS signal hooks and the service loop.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    reload_flag: Arc<AtomicBool>,
    check_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register OS hooks. Registration failures are
    /// reported on stderr and otherwise ignored.
    pub fn new() -> Self {
        let handler = Self::unregistered();
        handler.register_signals();
        handler
    }

    /// Flags only; no OS hooks. For embedding and tests.
    #[must_use]
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            reload_flag: Arc::new(AtomicBool::new(false)),
            check_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Read and clear the reload request.
    pub fn should_reload(&self) -> bool {
        self.reload_flag.swap(false, Ordering::Relaxed)
    }

    /// Read and clear the immediate-check request.
    pub fn should_check(&self) -> bool {
        self.check_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_check(&self) {
        self.check_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[UMB-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[UMB-SIGNAL] failed to register SIGINT: {e}");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::{SIGHUP, SIGUSR1};
            if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&self.reload_flag)) {
                eprintln!("[UMB-SIGNAL] failed to register SIGHUP: {e}");
            }
            if let Err(e) = signal_hook::flag::register(SIGUSR1, Arc::clone(&self.check_flag)) {
                eprintln!("[UMB-SIGNAL] failed to register SIGUSR1: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
