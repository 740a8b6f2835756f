//! SIGINT handling while waiting on a build.
//!
//! While a command is being awaited, Ctrl-C only flags an interrupt; the wait
//! loop kills the child and the batch moves on. Outside a wait the default
//! disposition is restored and the signal re-raised, so the tool still exits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A pending-interrupt flag polled by the wait loop.
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Consume a pending interrupt.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Raised by the SIGINT handler.
pub static SIGINT: InterruptFlag = InterruptFlag::new();

static WAITERS: AtomicUsize = AtomicUsize::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigint(sig: libc::c_int) {
    if WAITERS.load(Ordering::SeqCst) > 0 {
        SIGINT.raise();
        return;
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

pub fn install() {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    #[cfg(unix)]
    unsafe {
        let handler: extern "C" fn(libc::c_int) = on_sigint;
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

/// Marks a wait in progress. An interrupt belongs to the wait it arrived
/// during, so the flag is cleared on both entry and exit.
pub struct WaitGuard<'a> {
    flag: &'a InterruptFlag,
}

impl<'a> WaitGuard<'a> {
    pub fn enter(flag: &'a InterruptFlag) -> Self {
        flag.take();
        WAITERS.fetch_add(1, Ordering::SeqCst);
        WaitGuard { flag }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        WAITERS.fetch_sub(1, Ordering::SeqCst);
        self.flag.take();
    }
}
