//! Small filesystem helpers used throughout sandbox construction.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::{lstat, stat, Mode, SFlag};
use nix::unistd::close;
use tracing::warn;

/// Create `path` and all missing ancestors with mode 0777. Calling this on
/// an existing directory is fine.
pub fn mkpath(path: &Path) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o777)
        .create(path)
        .with_context(|| format!("creating directory {}", path.display()))
}

/// Create an empty file at `path` if absent. `EISDIR` is ignored so this is
/// safe to call on an existing directory; bind mounting uses that to shape
/// the mountpoint after the source's inode type.
pub fn touch(path: &Path) -> Result<()> {
    match open(
        path,
        OFlag::O_RDONLY | OFlag::O_CREAT,
        Mode::S_IRUSR | Mode::S_IRGRP | Mode::S_IROTH,
    ) {
        Ok(fd) => {
            let _ = close(fd);
            Ok(())
        }
        Err(Errno::EISDIR) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("touching {}", path.display())),
    }
}

fn file_type(mode: nix::libc::mode_t) -> SFlag {
    SFlag::from_bits_truncate(mode & SFlag::S_IFMT.bits())
}

/// Whether `path` is a directory. Missing paths (and paths with a non-dir
/// component) are not an error; anything else is.
pub fn is_dir(path: &Path) -> Result<bool> {
    match stat(path) {
        Ok(st) => Ok(file_type(st.st_mode) == SFlag::S_IFDIR),
        Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
    }
}

/// Whether `path` itself is a symlink (the link is not followed).
pub fn is_link(path: &Path) -> Result<bool> {
    match lstat(path) {
        Ok(st) => Ok(file_type(st.st_mode) == SFlag::S_IFLNK),
        Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("lstat {}", path.display())),
    }
}

/// Depth-first recursive removal that never follows symlinks. Individual
/// failures are logged and skipped so one stubborn entry doesn't keep the
/// rest of the tree around.
pub fn rmrf(path: &Path) {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    if meta.is_dir() {
        match fs::read_dir(path) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    rmrf(&entry.path());
                }
            }
            Err(e) => warn!("failed to list {}: {}", path.display(), e),
        }
        if let Err(e) = fs::remove_dir(path) {
            warn!("failed to remove {}: {}", path.display(), e);
        }
    } else if let Err(e) = fs::remove_file(path) {
        warn!("failed to remove {}: {}", path.display(), e);
    }
}

// One-byte-at-a-time hash based on Murmur's mix.
fn string_hash(s: &str, mut h: u32) -> u32 {
    for &byte in s.as_bytes() {
        h ^= u32::from(byte);
        h = h.wrapping_mul(0x5bd1_e995);
        h ^= h >> 15;
    }
    h
}

/// `"<leaf>-<hex>"` where the hex digest covers the whole path, so two mount
/// points sharing a leaf name still get distinct overlay state directories.
pub fn hashed_basename(path: &str) -> String {
    let leaf = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    format!("{}-{:x}", leaf, string_hash(path, 0x5f37_59df))
}
