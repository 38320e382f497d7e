//! Launcher configuration: the parsed mount list, identity mapping, and
//! execution mode, plus an optional `/etc/burrow/burrow.conf` seed file.
//!
//! The conf file holds simple `KEY=VALUE` lines. Comments (`#`) and blank
//! lines are ignored, and environment variables always win over file values,
//! so the file can only supply defaults.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Result};
use nix::unistd::{geteuid, getgid, getuid, Gid, Uid};
use thiserror::Error;

use crate::userns::IdMapping;

/// Default config file path, works on any Linux distribution.
const DEFAULT_CONFIG_PATH: &str = "/etc/burrow/burrow.conf";

/// Environment variable that pins the execution mode regardless of euid.
pub const FORCE_SANDBOX_MODE: &str = "FORCE_SANDBOX_MODE";

/// How a user-requested mount behaves inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Plain bind mount; writes land on the host path.
    ReadWrite,
    /// Bind mount remounted read-only.
    ReadOnly,
    /// Read-only bind shadowed by a writable overlay.
    Overlayed,
}

impl FromStr for MountKind {
    type Err = MountSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rw" => Ok(MountKind::ReadWrite),
            "ro" => Ok(MountKind::ReadOnly),
            "ov" => Ok(MountKind::Overlayed),
            other => Err(MountSpecError::UnknownKind(other.to_string())),
        }
    }
}

/// One `--mount from:to[:kind]` request, order-preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Absolute host path.
    pub outside_path: PathBuf,
    /// Path relative to the container root (leading slashes tolerated).
    pub mount_point: String,
    pub kind: MountKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MountSpecError {
    #[error("mount spec {0:?} has no ':' separating host path and mount point")]
    MissingSeparator(String),
    #[error("outside path {0:?} must be absolute")]
    OutsideNotAbsolute(String),
    #[error("unknown mount kind {0:?} (expected rw, ro, or ov)")]
    UnknownKind(String),
}

impl FromStr for MountSpec {
    type Err = MountSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, rest) = s
            .split_once(':')
            .ok_or_else(|| MountSpecError::MissingSeparator(s.to_string()))?;
        if !from.starts_with('/') {
            return Err(MountSpecError::OutsideNotAbsolute(from.to_string()));
        }
        let (to, kind) = match rest.split_once(':') {
            Some((to, kind)) => (to, kind.parse()?),
            None => (rest, MountKind::ReadWrite),
        };
        Ok(MountSpec {
            outside_path: PathBuf::from(from),
            mount_point: to.to_string(),
            kind,
        })
    }
}

/// Whether mounts happen before the clone (as real root) or after it (with
/// the mapped root inside the user namespace).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Privileged,
    Unprivileged,
}

impl ExecutionMode {
    /// Pick the mode from `FORCE_SANDBOX_MODE`, falling back to the
    /// effective uid. When the variable is absent we also export
    /// `unprivileged` for our children: inside the sandbox the mapped
    /// identity always has what unprivileged mode needs, and a nested
    /// launcher must not re-derive the mode from a euid that only looks
    /// like root.
    pub fn resolve() -> Result<ExecutionMode> {
        match std::env::var(FORCE_SANDBOX_MODE) {
            Ok(value) => match value.as_str() {
                "privileged" => Ok(ExecutionMode::Privileged),
                "unprivileged" => Ok(ExecutionMode::Unprivileged),
                other => bail!("unknown {} value {:?}", FORCE_SANDBOX_MODE, other),
            },
            Err(_) => {
                std::env::set_var(FORCE_SANDBOX_MODE, "unprivileged");
                if geteuid().is_root() {
                    Ok(ExecutionMode::Privileged)
                } else {
                    Ok(ExecutionMode::Unprivileged)
                }
            }
        }
    }
}

/// Determine the outside identity to map into the sandbox. Under sudo the
/// real uid/gid are root's, so `SUDO_UID`/`SUDO_GID` win when present and
/// non-empty. Both variables are then scrubbed from the environment so a
/// nested sandbox doesn't inherit ids that mean nothing in its namespace.
pub fn resolve_outside_ids() -> (Uid, Gid) {
    let mut uid = getuid();
    let mut gid = getgid();

    if let Ok(value) = std::env::var("SUDO_UID") {
        if !value.is_empty() {
            if let Ok(parsed) = value.parse::<u32>() {
                uid = Uid::from_raw(parsed);
            }
        }
    }
    if let Ok(value) = std::env::var("SUDO_GID") {
        if !value.is_empty() {
            if let Ok(parsed) = value.parse::<u32>() {
                gid = Gid::from_raw(parsed);
            }
        }
    }

    std::env::remove_var("SUDO_UID");
    std::env::remove_var("SUDO_GID");

    (uid, gid)
}

/// Everything the launcher needs, immutable once built.
#[derive(Debug)]
pub struct Config {
    /// Root filesystem image directory (trailing slash stripped).
    pub rootfs: PathBuf,
    /// Directory to change to after the root switch.
    pub cwd: Option<PathBuf>,
    /// Host directory receiving overlay upper/work state, or `None` for a
    /// throwaway tmpfs.
    pub persist: Option<PathBuf>,
    /// Passed verbatim to the tmpfs `size=` option.
    pub tmpfs_size: String,
    pub ids: IdMapping,
    pub hostname: Option<String>,
    pub userxattr: bool,
    pub mode: ExecutionMode,
    /// User mounts, in the order they were requested.
    pub mounts: Vec<MountSpec>,
    /// The command vector to execute inside (entrypoint already prepended).
    pub command: Vec<String>,
}

/// Strip one trailing `/` from a rootfs argument; an empty result means the
/// filesystem root itself.
pub fn normalize_rootfs(raw: &str) -> PathBuf {
    PathBuf::from(raw.strip_suffix('/').unwrap_or(raw))
}

/// Load defaults from the burrow config file.
///
/// Search order:
/// 1. `BURROW_CONFIG` env var (explicit path override)
/// 2. `/etc/burrow/burrow.conf`
///
/// For each `KEY=VALUE` line, sets the environment variable only if it is
/// not already set. Silently returns if the file doesn't exist.
pub fn load_config_file() {
    let path = std::env::var("BURROW_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return, // File doesn't exist or unreadable — silently continue
    };

    for line in contents.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        // Split on first '=' only (values may contain '=')
        if let Some((key, value)) = trimmed.split_once('=') {
            let key = key.trim();
            let value = value.trim();

            if key.is_empty() {
                continue;
            }

            if std::env::var(key).is_err() {
                std::env::set_var(key, value);
            }
        }
    }
}
