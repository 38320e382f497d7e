//! The full sandbox mount sequence: rootfs overlay, user mounts in their
//! declared order, procfs, and the curated `/dev`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::unistd::{chown, Gid, Uid};
use tracing::debug;

use crate::config::{MountKind, MountSpec};
use crate::fsutil::hashed_basename;
use crate::mounts::{bind_mount, mount_dev, mount_overlay, mount_procfs, mount_tmpfs};

/// Host directory pressed into service as the overlay work area when no
/// `--persist` directory was given. It must already exist, and nothing may
/// need its original content between here and the moment the rootfs overlay
/// shadows it; `/bin` satisfies both on any host this program can run on.
const EPHEMERAL_WORK_DIR: &str = "/bin";

/// Build the container's entire mount tree under `root`.
///
/// With a `persist` directory the overlay upper/work state lands there and
/// survives the sandbox; without one, a tmpfs of `tmpfs_size` backs the
/// overlays and every modification dies with the mount namespace. In the
/// tmpfs case `userxattr` is unusable and is switched off.
pub fn mount_the_world(
    root: &Path,
    mounts: &[MountSpec],
    uid: Uid,
    gid: Gid,
    persist: Option<&Path>,
    tmpfs_size: &str,
    userxattr: bool,
) -> Result<()> {
    let root = crate::mounts::or_root(root);

    let (work_dir, userxattr) = match persist {
        Some(dir) => (dir, userxattr),
        None => {
            let dir = Path::new(EPHEMERAL_WORK_DIR);
            mount_tmpfs(dir, tmpfs_size)?;
            (dir, false)
        }
    };
    debug!("overlay work directory at {}", work_dir.display());

    // Overlay the rootfs over itself first: mountpoints for everything that
    // follows are created in the overlay's upper layer, never in the image.
    if !mount_overlay(root, root, "rootfs", work_dir, userxattr)? {
        bail!("kernel refused the rootfs overlay at {}", root.display());
    }
    chown(root, Some(uid), Some(gid))
        .with_context(|| format!("chowning rootfs at {}", root.display()))?;

    for spec in mounts {
        let inside = spec.mount_point.trim_start_matches('/');
        let dest = root.join(inside);

        let read_only = matches!(spec.kind, MountKind::ReadOnly | MountKind::Overlayed);
        bind_mount(&spec.outside_path, &dest, read_only)?;

        // Overlayed mounts get their own writable view, keyed by a name that
        // stays unique even when two mount points share a leaf.
        if spec.kind == MountKind::Overlayed {
            let bname = hashed_basename(&spec.mount_point);
            if !mount_overlay(&dest, &dest, &bname, work_dir, userxattr)? {
                bail!("kernel refused the overlay at {}", dest.display());
            }
            chown(&dest, Some(uid), Some(gid))
                .with_context(|| format!("chowning overlay at {}", dest.display()))?;
        }
    }

    mount_procfs(root, uid, gid)?;
    mount_dev(root)
}
