//! Probe whether this kernel + filesystem combination can support burrow:
//! overlayfs mounted from inside an unprivileged user namespace, with
//! cross-directory rename working on the result (the operation package
//! managers lean on; a kernel without it fails installs with EXDEV).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::mount::umount;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{getgid, getuid, Gid, Uid};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use burrow::config;
use burrow::fsutil::{is_dir, mkpath, rmrf};
use burrow::mounts::{mount_overlay, mount_tmpfs};
use burrow::sandbox;
use burrow::userns::IdMapping;

#[derive(Parser, Debug)]
#[command(
    name = "burrow-probe",
    version = burrow::VERSION,
    about = "Probe kernel support for overlayfs inside user namespaces"
)]
struct Cli {
    /// Mount the probe overlay with the userxattr option
    #[arg(long)]
    userxattr: bool,

    /// Back the probe work area with a small tmpfs
    #[arg(long)]
    tmpfs: bool,

    /// UID to appear as inside the namespace
    #[arg(long, default_value_t = 0)]
    uid: u32,

    /// GID to appear as inside the namespace
    #[arg(long, default_value_t = 0)]
    gid: u32,

    /// Narrate each probe step on stderr
    #[arg(long)]
    verbose: bool,

    /// Root filesystem directory to overlay
    #[arg(value_name = "ROOTFS_DIR")]
    rootfs: PathBuf,

    /// Existing directory to hold the probe work area
    #[arg(value_name = "WORK_PARENT_DIR")]
    work_parent: PathBuf,
}

fn main() {
    config::load_config_file();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let ids = IdMapping {
        src_uid: getuid(),
        src_gid: getgid(),
        dst_uid: Uid::from_raw(cli.uid),
        dst_gid: Gid::from_raw(cli.gid),
    };

    let handle = sandbox::spawn_container(&ids, |report| {
        drop(report);
        match probe(&cli.rootfs, &cli.work_parent, cli.tmpfs, cli.userxattr) {
            Ok(true) => {
                debug!("probe of {} successful", cli.work_parent.display());
                0
            }
            Ok(false) => 1,
            Err(e) => {
                tracing::error!("{:#}", e);
                1
            }
        }
    })?;

    match waitpid(handle.pid, None).context("waiting for the probe child")? {
        WaitStatus::Exited(_, code) => Ok(code),
        other => bail!("probe child did not exit cleanly ({:?})", other),
    }
}

/// Runs inside the freshly mapped namespace. Returns whether every probed
/// feature is available.
fn probe(rootfs: &Path, work_parent: &Path, use_tmpfs: bool, userxattr: bool) -> Result<bool> {
    if !is_dir(work_parent)? {
        bail!(
            "work parent directory does not exist ({})",
            work_parent.display()
        );
    }
    let probe_dir = work_parent.join(".probe");

    if use_tmpfs {
        mkpath(&probe_dir)?;
        mount_tmpfs(&probe_dir, "1M")?;
    }

    let mut supported = mount_overlay(rootfs, rootfs, "probe", &probe_dir, userxattr)?;

    if supported {
        // Rename a directory across overlay layers. This is what decides
        // whether this kernel's combination of userxattr and redirect_dir
        // can handle real package installs.
        let src = rootfs.join("src");
        let dst = rootfs.join("dst");
        mkpath(&src)?;
        match fs::rename(&src, &dst) {
            Ok(()) => debug!("cross-directory rename passed"),
            Err(e) => {
                debug!("cross-directory rename failed: {}", e);
                supported = false;
            }
        }

        umount(rootfs).with_context(|| format!("unmounting {}", rootfs.display()))?;
    }

    if use_tmpfs {
        umount(&probe_dir)
            .with_context(|| format!("unmounting {}", probe_dir.display()))?;
    }
    rmrf(&probe_dir);

    Ok(supported)
}
