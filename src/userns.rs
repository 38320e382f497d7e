//! Writing UID/GID maps into another process's user namespace.

use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context, Result};
use nix::unistd::{Gid, Pid, Uid};
use tracing::debug;

/// The one-to-one identity mapping a sandbox runs under: the outside
/// (host-visible) uid/gid and the identity it appears as inside.
#[derive(Debug, Clone, Copy)]
pub struct IdMapping {
    pub src_uid: Uid,
    pub src_gid: Gid,
    pub dst_uid: Uid,
    pub dst_gid: Gid,
}

fn write_proc_file(pid: Pid, name: &str, contents: &[u8]) -> Result<()> {
    let path = format!("/proc/{}/{}", pid, name);
    let mut file = OpenOptions::new()
        .write(true)
        .open(&path)
        .with_context(|| format!("opening {}", path))?;
    file.write_all(contents)
        .with_context(|| format!("writing {}", path))
}

/// Configure the user namespace of `pid` so that `src_uid:src_gid` outside
/// appears as `dst_uid:dst_gid` inside.
///
/// The kernel demands this exact sequence from an unprivileged writer:
/// `uid_map`, then `setgroups = deny`, then `gid_map`. The target process
/// must be waiting for us; once these files are written its release byte can
/// be sent.
pub fn configure_user_namespace(pid: Pid, ids: &IdMapping) -> Result<()> {
    debug!(
        "mapping {}:{} to {}:{} within container namespace of pid {}",
        ids.src_uid, ids.src_gid, ids.dst_uid, ids.dst_gid, pid
    );

    let uid_map = format!("{}\t{}\t1\n", ids.dst_uid, ids.src_uid);
    write_proc_file(pid, "uid_map", uid_map.as_bytes())?;

    write_proc_file(pid, "setgroups", b"deny\0")?;

    let gid_map = format!("{}\t{}\t1", ids.dst_gid, ids.src_gid);
    write_proc_file(pid, "gid_map", gid_map.as_bytes())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_mapping_lines() {
        // The map files are picky about their format; pin it down.
        let ids = IdMapping {
            src_uid: Uid::from_raw(1000),
            src_gid: Gid::from_raw(1000),
            dst_uid: Uid::from_raw(0),
            dst_gid: Gid::from_raw(0),
        };
        let uid_map = format!("{}\t{}\t1\n", ids.dst_uid, ids.src_uid);
        assert_eq!(uid_map, "0\t1000\t1\n");
        let gid_map = format!("{}\t{}\t1", ids.dst_gid, ids.src_gid);
        assert_eq!(gid_map, "0\t1000\t1");
    }

    #[test]
    fn test_write_proc_file_missing_pid_fails() {
        let ids = IdMapping {
            src_uid: Uid::from_raw(1000),
            src_gid: Gid::from_raw(1000),
            dst_uid: Uid::from_raw(0),
            dst_gid: Gid::from_raw(0),
        };
        // No such pid: the open must fail, not silently succeed.
        assert!(configure_user_namespace(Pid::from_raw(-2), &ids).is_err());
    }
}
