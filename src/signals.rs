//! Signal passthrough: the supervisor relays to the container-init, and the
//! container-init relays to the sandboxed command, so a Ctrl-C or a TERM at
//! the outermost process lands on the process that should act on it.

use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{Context, Result};
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

/// The signals we relay. Everything else keeps its kernel default.
pub const FORWARDED_SIGNALS: [Signal; 6] = [
    Signal::SIGHUP,
    Signal::SIGPIPE,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

// The only cross-handler state in the program. The handler may run at any
// time, so it reads one atomic and calls kill, nothing else.
static FORWARD_TARGET: AtomicI32 = AtomicI32::new(0);

extern "C" fn relay(sig: libc::c_int) {
    let pid = FORWARD_TARGET.load(Ordering::Relaxed);
    if pid > 0 {
        unsafe {
            libc::kill(pid, sig);
        }
    }
}

/// Point the relay at a new pid. Takes effect for the next delivered signal.
pub fn set_forward_target(pid: Pid) {
    FORWARD_TARGET.store(pid.as_raw(), Ordering::Relaxed);
}

/// Install the relay handler for every forwarded signal. SA_RESTART keeps
/// the blocking waits in the supervisor and init loops from seeing EINTR
/// every time a signal passes through.
pub fn install_forwarding(target: Pid) -> Result<()> {
    set_forward_target(target);
    let action = SigAction::new(
        SigHandler::Handler(relay),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in FORWARDED_SIGNALS {
        unsafe { sigaction(sig, &action) }
            .with_context(|| format!("installing forwarding handler for {}", sig))?;
    }
    Ok(())
}
