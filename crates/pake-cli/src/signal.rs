//! SIGINT handling.
//!
//! The first interrupt only sets a flag: the in-progress recipe (and any
//! child process it spawned) is left to finish, and the engine aborts before
//! starting the next one, after flushing completed results. A second SIGINT
//! kills the process the default way because the handler resets itself.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[cfg(unix)]
static FLAG: std::sync::OnceLock<Arc<AtomicBool>> = std::sync::OnceLock::new();

#[cfg(unix)]
extern "C" fn sigint_handler(_sig: libc::c_int) {
  if let Some(flag) = FLAG.get() {
    flag.store(true, std::sync::atomic::Ordering::Relaxed);
  }
  // SA_RESETHAND restores the default disposition for the next SIGINT.
}

#[cfg(unix)]
pub fn register_sigint(flag: Arc<AtomicBool>) {
  let _ = FLAG.set(flag);
  // Safety: registering a signal handler is libc unsafe code; the handler
  // only touches an atomic.
  unsafe {
    let mut sa: libc::sigaction = std::mem::zeroed();
    sa.sa_sigaction = sigint_handler as libc::sighandler_t;
    sa.sa_flags = libc::SA_RESETHAND;
    libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
  }
}

#[cfg(not(unix))]
pub fn register_sigint(_flag: Arc<AtomicBool>) {}
