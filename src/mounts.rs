//! Mount construction primitives: bind mounts with locked-flag preservation,
//! overlayfs, procfs, tmpfs, and the curated `/dev`.
//!
//! Every mount here is all-or-nothing: a failure aborts container bring-up,
//! and whatever was already mounted vanishes with the mount namespace. The
//! one exception is [`mount_overlay`], which reports an overlayfs refusal as
//! `Ok(false)` so the probe can tell "unsupported kernel" from "broken call".

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::mount::{mount, MsFlags};
use nix::sys::stat::stat;
use nix::unistd::{chown, Gid, Uid};
use tracing::{debug, warn};

use crate::fsutil::{is_dir, is_link, mkpath, touch};

/// Interpret a path whose empty form means the filesystem root.
pub(crate) fn or_root(path: &Path) -> &Path {
    if path.as_os_str().is_empty() {
        Path::new("/")
    } else {
        path
    }
}

/// Decode the octal escapes (`\040` for space, etc.) that the kernel uses in
/// `/proc/self/mounts` fields.
fn unescape_mounts_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3 {
                if let Ok(code) = u8::from_str_radix(&digits, 8) {
                    out.push(code as char);
                    chars.nth(2);
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// The mount flags the kernel refuses to clear during a bind remount. A
/// read-only remount must re-assert whichever of these the source carries.
fn locked_flags_from_options(options: &str) -> MsFlags {
    let mut flags = MsFlags::empty();
    for opt in options.split(',') {
        match opt {
            "nodev" => flags |= MsFlags::MS_NODEV,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            _ => {}
        }
    }
    flags
}

/// One `/proc/self/mounts` entry, reduced to the fields we care about.
struct MountEntry {
    dir: PathBuf,
    options: String,
}

fn parse_mounts_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let dir = fields.next()?;
            let _fstype = fields.next()?;
            let options = fields.next()?;
            Some(MountEntry {
                dir: PathBuf::from(unescape_mounts_field(dir)),
                options: options.to_string(),
            })
        })
        .collect()
}

/// Find the locked flags of the mount carrying `source`, by matching the
/// device number of `source` against the mount table.
fn locked_mount_flags(source: &Path) -> Result<MsFlags> {
    let src_stat =
        stat(source).with_context(|| format!("stat bind source {}", source.display()))?;

    let table = fs::read_to_string("/proc/self/mounts").context("reading /proc/self/mounts")?;
    for entry in parse_mounts_table(&table) {
        // We may not be allowed to stat every mountpoint; skip those and
        // hope the mount we want is one we can see.
        match stat(&entry.dir) {
            Ok(dir_stat) if dir_stat.st_dev == src_stat.st_dev => {
                return Ok(locked_flags_from_options(&entry.options));
            }
            _ => continue,
        }
    }

    bail!(
        "no mount table entry matches the device of {}",
        source.display()
    )
}

/// Bind-mount `src` onto `dest`, creating `dest` with the inode type of the
/// source (directory or file). With `read_only`, performs the separate
/// remount the kernel requires, re-asserting the source mount's locked flags.
pub fn bind_mount(src: &Path, dest: &Path, read_only: bool) -> Result<()> {
    // A symlink source confuses the bind, so collapse it first. If that
    // fails we warn and try the mount with the path as given.
    let mut resolved_src = src.to_path_buf();
    if is_link(src)? {
        match fs::canonicalize(src) {
            Ok(real) => resolved_src = real,
            Err(e) => warn!("unable to resolve {}: {}", src.display(), e),
        }
    }

    debug!(
        "bind-mounting {} over {} ({})",
        resolved_src.display(),
        dest.display(),
        if read_only { "read-only" } else { "read-write" }
    );

    if is_dir(&resolved_src)? {
        mkpath(dest)?;
    } else {
        touch(dest)?;
    }

    // MS_REC because the source may itself contain sub-mounts.
    mount(
        Some(&resolved_src),
        dest,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .with_context(|| {
        format!(
            "bind-mounting {} to {}",
            resolved_src.display(),
            dest.display()
        )
    })?;

    if read_only {
        let locked = locked_mount_flags(&resolved_src)?;
        mount(
            Some(&resolved_src),
            dest,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | locked,
            None::<&str>,
        )
        .with_context(|| format!("remounting {} read-only", dest.display()))?;
    }

    Ok(())
}

fn overlay_options(lower: &Path, upper: &Path, work: &Path, userxattr: bool) -> String {
    format!(
        "lowerdir={},upperdir={},workdir={}{}",
        lower.display(),
        upper.display(),
        work.display(),
        if userxattr { ",userxattr" } else { "" }
    )
}

/// Mount an overlayfs of `lower` at `dest`, keeping modifications under
/// `<work_dir>/upper/<name>` and `<work_dir>/work/<name>`. The common case
/// `lower == dest` shadows a directory with a writable view whose changes
/// live (and die) with the work directory.
///
/// Returns `Ok(false)` when the kernel rejects the mount itself, so callers
/// can probe for overlayfs-in-userns support.
pub fn mount_overlay(
    lower: &Path,
    dest: &Path,
    name: &str,
    work_dir: &Path,
    userxattr: bool,
) -> Result<bool> {
    let upper = work_dir.join("upper").join(name);
    let work = work_dir.join("work").join(name);
    mkpath(&upper)?;
    mkpath(&work)?;

    let lower = or_root(lower);
    let dest = or_root(dest);
    let options = overlay_options(lower, &upper, &work, userxattr);
    debug!("mounting overlay at {} ({})", dest.display(), options);

    match mount(
        Some("overlay"),
        dest,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    ) {
        Ok(()) => Ok(true),
        Err(e) => {
            debug!(
                "overlay mount at {} refused: {} (options: {})",
                dest.display(),
                e,
                options
            );
            Ok(false)
        }
    }
}

/// Mount procfs at `<root>/proc` and hand the mountpoint to `uid:gid` so it
/// doesn't show up as owned by nobody inside. The chown may be refused on a
/// procfs we don't own, which is fine.
pub fn mount_procfs(root: &Path, uid: Uid, gid: Gid) -> Result<()> {
    let path = or_root(root).join("proc");
    debug!("mounting procfs at {}", path.display());
    mount(
        Some("proc"),
        &path,
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .with_context(|| format!("mounting procfs at {}", path.display()))?;

    let _ = chown(&path, Some(uid), Some(gid));
    Ok(())
}

/// Mount a tmpfs of the given `size=` at `dest`.
pub fn mount_tmpfs(dest: &Path, size: &str) -> Result<()> {
    let options = format!("size={}", size);
    debug!("mounting tmpfs at {} ({})", dest.display(), options);
    mount(
        Some("tmpfs"),
        dest,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .with_context(|| format!("mounting tmpfs at {}", dest.display()))
}

/// Bind a host path into the sandbox at the same location, if it exists on
/// the host at all.
pub fn bind_host_node(root: &Path, name: &str, read_only: bool) -> Result<()> {
    let host = Path::new(name);
    if !host.exists() {
        return Ok(());
    }
    let dest = root.join(name.trim_start_matches('/'));
    bind_mount(host, &dest, read_only)
}

/// Populate `<root>/dev` with the handful of nodes a sandboxed build needs:
/// bind mounts of the host character devices plus /dev/shm, a read-only
/// /sys, and a fresh devpts with its ptmx exposed at /dev/ptmx.
pub fn mount_dev(root: &Path) -> Result<()> {
    bind_host_node(root, "/dev/null", false)?;
    bind_host_node(root, "/dev/tty", false)?;
    bind_host_node(root, "/dev/zero", false)?;
    bind_host_node(root, "/dev/random", false)?;
    bind_host_node(root, "/dev/urandom", false)?;
    bind_host_node(root, "/dev/shm", false)?;
    bind_host_node(root, "/sys", true)?;

    let pts = root.join("dev/pts");
    mkpath(&pts)?;
    mount(
        Some("devpts"),
        &pts,
        Some("devpts"),
        MsFlags::empty(),
        Some("ptmxmode=0666"),
    )
    .with_context(|| format!("mounting devpts at {}", pts.display()))?;

    bind_mount(&pts.join("ptmx"), &root.join("dev/ptmx"), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_mounts_field() {
        assert_eq!(unescape_mounts_field("/plain/path"), "/plain/path");
        assert_eq!(unescape_mounts_field("/with\\040space"), "/with space");
        assert_eq!(unescape_mounts_field("/tab\\011here"), "/tab\there");
        assert_eq!(unescape_mounts_field("/back\\134slash"), "/back\\slash");
        // A lone backslash or short escape passes through unharmed
        assert_eq!(unescape_mounts_field("/odd\\4x"), "/odd\\4x");
    }

    #[test]
    fn test_locked_flags_from_options() {
        assert_eq!(locked_flags_from_options("rw"), MsFlags::empty());
        assert_eq!(
            locked_flags_from_options("rw,nosuid,nodev,noexec,relatime"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME
        );
        assert_eq!(
            locked_flags_from_options("ro,noatime,nodiratime"),
            MsFlags::MS_NOATIME | MsFlags::MS_NODIRATIME
        );
        // Unknown options are not locked flags
        assert_eq!(
            locked_flags_from_options("rw,seclabel,size=16G"),
            MsFlags::empty()
        );
    }

    #[test]
    fn test_parse_mounts_table() {
        let table = "sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0\n\
                     tmpfs /run tmpfs rw,nosuid,nodev,size=1G 0 0\n\
                     /dev/sda1 /mnt/with\\040space ext4 rw,relatime 0 0\n\
                     malformed-line\n";
        let entries = parse_mounts_table(table);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].dir, Path::new("/sys"));
        assert_eq!(entries[0].options, "rw,nosuid,nodev,noexec,relatime");
        assert_eq!(entries[2].dir, Path::new("/mnt/with space"));
    }

    #[test]
    fn test_locked_mount_flags_of_root() {
        // Whatever the flags are, the root filesystem must have an entry.
        let flags = locked_mount_flags(Path::new("/")).unwrap();
        let known = MsFlags::MS_NODEV
            | MsFlags::MS_NOSUID
            | MsFlags::MS_NOEXEC
            | MsFlags::MS_NOATIME
            | MsFlags::MS_NODIRATIME
            | MsFlags::MS_RELATIME;
        assert!(known.contains(flags));
    }

    #[test]
    fn test_overlay_options_shape() {
        let opts = overlay_options(
            Path::new("/lower"),
            Path::new("/work/upper/rootfs"),
            Path::new("/work/work/rootfs"),
            false,
        );
        assert_eq!(
            opts,
            "lowerdir=/lower,upperdir=/work/upper/rootfs,workdir=/work/work/rootfs"
        );

        let opts = overlay_options(
            Path::new("/l"),
            Path::new("/u"),
            Path::new("/w"),
            true,
        );
        assert!(opts.ends_with(",userxattr"));
    }

    #[test]
    fn test_or_root() {
        assert_eq!(or_root(Path::new("")), Path::new("/"));
        assert_eq!(or_root(Path::new("/srv/rootfs")), Path::new("/srv/rootfs"));
    }
}
