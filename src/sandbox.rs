//! Container bring-up: the supervisor/container-init rendezvous, the root
//! switch, the init reaper loop, and the exit-status tunnel back out.
//!
//! Two processes cooperate. The supervisor stays in the host namespaces,
//! writes the inner process's uid/gid maps, and waits. The container-init is
//! cloned into fresh pid/mount/user/uts namespaces, builds the mount tree
//! (in unprivileged mode), switches root, and runs the command behind a
//! minimal pid-1. Two anonymous pipes order the handoff:
//!
//! ```text
//!   init:  restore dumpability -> ready byte ->            wait -> mount/pivot/exec
//!   supervisor:            wait ready -> write uid/gid maps -> release byte -> waitpid
//! ```
//!
//! The command's fate travels as four bytes through the report pipe: its
//! exit status, or 256 plus the signal number that killed it, which the
//! supervisor re-raises on itself so callers see the same death.

use std::ffi::CString;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::process;

use anyhow::{bail, ensure, Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{self, raise, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
    chdir, chroot, execv, fork, getpgid, pipe, pivot_root, read, sethostname, setgid, setuid,
    write, ForkResult, Pid,
};
use tracing::{debug, error};

use crate::config::{Config, ExecutionMode};
use crate::fsutil::mkpath;
use crate::mounts::mount_procfs;
use crate::signals::install_forwarding;
use crate::userns::{configure_user_namespace, IdMapping};
use crate::world::mount_the_world;

/// The direct kernel clone, returning twice like fork. The wrapper clones
/// that take a callback and a fresh stack cannot be used here: the child
/// must keep executing on the caller's own stack frame, and the namespace
/// flags rule out plain fork.
fn raw_clone(flags: libc::c_int) -> Result<Pid> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_clone,
            flags as libc::c_ulong,
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
            0 as libc::c_ulong,
        )
    };
    if rc < 0 {
        Err(std::io::Error::last_os_error()).context("clone")
    } else {
        Ok(Pid::from_raw(rc as libc::pid_t))
    }
}

/// Supervisor-side handle to a cloned, mapped, and released container-init.
pub struct ContainerHandle {
    pub pid: Pid,
    /// Read end of the pipe the container-init reports through.
    pub report_pipe: OwnedFd,
}

/// Clone `child_main` into fresh pid/mount/user/uts namespaces and perform
/// the identity-mapping rendezvous with it.
///
/// In the child, `child_main` receives the write end of the report pipe and
/// its return value becomes the container-init's exit status; the call never
/// returns there. In the supervisor this returns once the child has been
/// released, with signal forwarding already pointed at it.
pub fn spawn_container<F>(ids: &IdMapping, child_main: F) -> Result<ContainerHandle>
where
    F: FnOnce(OwnedFd) -> i32,
{
    // release pipe: supervisor writes, init reads.
    // report pipe: init writes, supervisor reads.
    let (release_read, release_write) = pipe().context("creating release pipe")?;
    let (report_read, report_write) = pipe().context("creating report pipe")?;

    let flags = libc::CLONE_NEWPID
        | libc::CLONE_NEWNS
        | libc::CLONE_NEWUSER
        | libc::CLONE_NEWUTS
        | libc::SIGCHLD;
    let child = raw_clone(flags)?;

    if child.as_raw() == 0 {
        // Container side. Everything below must end in process::exit:
        // returning here would run the supervisor half in both processes.
        drop(release_write);
        drop(report_read);

        // Creating the user namespace may have cleared our dumpability,
        // which leaves /proc/<pid> owned by root and the supervisor unable
        // to write our maps. Restore it before signalling readiness.
        unsafe {
            libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0);
        }

        let code = match rendezvous_child(&release_read, &report_write) {
            Ok(()) => child_main(report_write),
            Err(e) => {
                error!("container rendezvous failed: {:#}", e);
                1
            }
        };
        process::exit(code);
    }

    // Supervisor side.
    drop(release_read);
    drop(report_write);

    install_forwarding(child)?;

    let mut byte = [0u8; 1];
    let n = read(report_read.as_raw_fd(), &mut byte).context("waiting for readiness byte")?;
    ensure!(n == 1, "container-init exited before signalling readiness");
    debug!("container-init pid is {}", child);

    // The init is parked on the release pipe; its maps can only be written
    // from out here, and nothing inside moves until they are.
    configure_user_namespace(child, ids)?;

    let n = write(&release_write, b"X").context("writing release byte")?;
    ensure!(n == 1, "short write on release byte");

    Ok(ContainerHandle {
        pid: child,
        report_pipe: report_read,
    })
}

fn rendezvous_child(release: &OwnedFd, ready: &OwnedFd) -> Result<()> {
    let n = write(ready, b"X").context("writing readiness byte")?;
    ensure!(n == 1, "short write on readiness byte");

    let mut byte = [0u8; 1];
    let n = read(release.as_raw_fd(), &mut byte).context("waiting for release")?;
    ensure!(n == 1, "supervisor closed the release pipe before mapping ids");
    Ok(())
}

/// Launch the sandbox described by `cfg` and run its command to completion.
/// Returns the command's exit code; if the command died of a signal, this
/// re-raises it on the current process and does not return.
pub fn run(cfg: &Config) -> Result<i32> {
    let pgrp = getpgid(None).context("reading process group")?;

    if cfg.mode == ExecutionMode::Privileged {
        // With real root the kernel may refuse overlayfs inside the user
        // namespace, so the world is mounted out here first, inside a
        // private mount namespace so none of it leaks to the host.
        unshare(CloneFlags::CLONE_NEWNS).context("unsharing mount namespace")?;
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        )
        .context("remounting / private")?;
        mount_the_world(
            &cfg.rootfs,
            &cfg.mounts,
            cfg.ids.src_uid,
            cfg.ids.src_gid,
            cfg.persist.as_deref(),
            &cfg.tmpfs_size,
            cfg.userxattr,
        )?;
    }

    let handle = spawn_container(&cfg.ids, |report| container_init(cfg, report))?;
    supervise(handle, pgrp)
}

/// Entry point of the cloned process: pid 1 of the new namespace.
fn container_init(cfg: &Config, report: OwnedFd) -> i32 {
    match container_init_inner(cfg, report) {
        Ok(code) => code,
        Err(e) => {
            error!("container bring-up failed: {:#}", e);
            1
        }
    }
}

fn container_init_inner(cfg: &Config, report: OwnedFd) -> Result<i32> {
    match cfg.mode {
        ExecutionMode::Unprivileged => {
            // Only now do we hold (mapped) root, so the world is mounted
            // from inside.
            mount_the_world(
                &cfg.rootfs,
                &cfg.mounts,
                cfg.ids.dst_uid,
                cfg.ids.dst_gid,
                cfg.persist.as_deref(),
                &cfg.tmpfs_size,
                cfg.userxattr,
            )?;
        }
        ExecutionMode::Privileged => {
            // The world was mounted outside; drop to the mapped identity.
            setuid(cfg.ids.dst_uid).context("setuid inside the namespace")?;
            setgid(cfg.ids.dst_gid).context("setgid inside the namespace")?;

            // The procfs mounted before the clone shows the old pid
            // namespace; mount a fresh one over it.
            mount_procfs(&cfg.rootfs, cfg.ids.dst_uid, cfg.ids.dst_gid)?;
        }
    }

    if let Some(hostname) = &cfg.hostname {
        sethostname(hostname).context("setting hostname")?;
    }

    sandbox_main(cfg, report)
}

/// Switch the filesystem root. `pivot_root(".", ".")` stacks the old root
/// under the new one so a single lazy detach removes it; when pivoting is
/// refused (we are already inside a sandbox), fall back to chroot and give
/// up on nesting.
fn enter_rootfs(root: &Path) -> Result<()> {
    let root = if root.as_os_str().is_empty() {
        Path::new("/")
    } else {
        root
    };
    debug!("entering rootfs at {}", root.display());

    chdir(root).with_context(|| format!("chdir to rootfs {}", root.display()))?;
    match pivot_root(".", ".") {
        Ok(()) => {
            // "." is now the old root mount, the first mount stacked here.
            umount2(".", MntFlags::MNT_DETACH).context("detaching the old root")?;
            chdir("/").context("chdir to the new root")?;
            debug!("pivot_root succeeded and unmounted old root");
        }
        Err(e) => {
            chroot(root).context("chroot fallback")?;
            debug!(
                "pivot_root refused with {}, chroot used instead; nested sandboxing unavailable",
                e
            );
        }
    }
    Ok(())
}

/// Enter the rootfs, fork the command, and serve as its init: reap orphans,
/// forward signals, and report the command's fate through `report`.
fn sandbox_main(cfg: &Config, report: OwnedFd) -> Result<i32> {
    enter_rootfs(&cfg.rootfs)?;

    if let Some(cwd) = &cfg.cwd {
        mkpath(cwd)?;
        chdir(cwd.as_path()).with_context(|| format!("chdir to {}", cwd.display()))?;
    }

    // Block SIGCHLD before forking so a command that exits immediately
    // cannot slip its notification past the reaper loop.
    let mut waitset = SigSet::empty();
    waitset.add(Signal::SIGCHLD);
    signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&waitset), None)
        .context("blocking SIGCHLD")?;

    let argv: Vec<CString> = cfg
        .command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .context("command contains a NUL byte")?;

    let target = match unsafe { fork() }.context("forking the command")? {
        ForkResult::Child => {
            // The command should not start with SIGCHLD blocked.
            let _ = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&waitset), None);
            debug!("about to run {:?}", cfg.command);
            if let Err(e) = execv(&argv[0], &argv) {
                eprintln!("ERROR: failed to run {}: {}", cfg.command[0], e);
            }
            process::exit(1);
        }
        ForkResult::Parent { child } => child,
    };

    install_forwarding(target)?;
    reap_until_target_exits(target, &waitset, &report)
}

/// The init loop: wake on SIGCHLD, reap everything reapable, and report once
/// the command itself is gone. Orphans adopted by this pid 1 are consumed
/// silently.
fn reap_until_target_exits(target: Pid, waitset: &SigSet, report: &OwnedFd) -> Result<i32> {
    loop {
        waitset.wait().context("waiting for SIGCHLD")?;

        loop {
            match waitpid(None::<Pid>, None) {
                Ok(WaitStatus::Exited(pid, code)) if pid == target => {
                    return report_exit(report, code as u32);
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) if pid == target => {
                    return report_exit(report, 256 + sig as u32);
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(e).context("reaping children"),
            }
        }
    }
}

fn report_exit(report: &OwnedFd, code: u32) -> Result<i32> {
    debug!("reporting exit code {}", code);
    let bytes = code.to_ne_bytes();
    let n = write(report, &bytes).context("reporting exit status")?;
    ensure!(n == bytes.len(), "short write on exit status report");
    Ok(0)
}

/// Wait out the container-init and translate its report: plain exit codes
/// pass through, signal deaths are re-raised on this process.
fn supervise(handle: ContainerHandle, pgrp: Pid) -> Result<i32> {
    let status = waitpid(handle.pid, None).context("waiting for the container-init")?;

    // Hand the terminal back to the original foreground process group. Not
    // having a terminal at all is fine.
    let _ = unsafe { signal::signal(Signal::SIGTTOU, SigHandler::SigIgn) };
    unsafe {
        libc::tcsetpgrp(0, pgrp.as_raw());
    }

    match status {
        WaitStatus::Exited(_, 0) => {}
        WaitStatus::Exited(_, code) => {
            bail!("container-init exited uncleanly (exit code: {})", code)
        }
        WaitStatus::Signaled(_, sig, _) => {
            bail!("container-init exited uncleanly (signal: {})", sig)
        }
        other => bail!("container-init exited uncleanly ({:?})", other),
    }

    let mut buf = [0u8; 4];
    let mut pipe = std::fs::File::from(handle.report_pipe);
    pipe.read_exact(&mut buf)
        .context("reading the command's exit status")?;
    let code = u32::from_ne_bytes(buf);

    if code >= 256 {
        // The command died of a signal; die the same way so our caller sees
        // an identical fate.
        let sig = Signal::try_from((code - 256) as i32).context("decoding fatal signal")?;
        debug!("command died of {}; re-raising", sig);
        unsafe { signal::signal(sig, SigHandler::SigDfl) }
            .context("restoring default signal disposition")?;
        raise(sig).context("re-raising fatal signal")?;
        bail!("survived re-raised {}", sig);
    }

    debug!("command exited with code {}", code);
    Ok(code as i32)
}
