//! Probe binary behavior. These only need a plain directory as the probed
//! rootfs; the sandbox binaries' busybox rootfs is not required.

#[cfg(target_os = "linux")]
mod probe_tests {
    use std::fs;
    use std::path::Path;
    use std::process::{Command, Output};
    use tempfile::TempDir;

    fn probe_bin() -> &'static str {
        env!("CARGO_BIN_EXE_burrow-probe")
    }

    fn run_probe(rootfs: &Path, work: &Path, tmpfs: bool) -> Output {
        let mut cmd = Command::new(probe_bin());
        if tmpfs {
            cmd.arg("--tmpfs");
        }
        cmd.arg(rootfs)
            .arg(work)
            .output()
            .expect("failed to run burrow-probe")
    }

    /// `None` (skip) when this kernel can't pass the probe at all; otherwise
    /// the temp dir to build further cases in.
    fn setup() -> Option<TempDir> {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        let work = tmp.path().join("work");
        fs::create_dir_all(&rootfs).unwrap();
        fs::create_dir_all(&work).unwrap();

        let gate = run_probe(&rootfs, &work, true);
        if !gate.status.success() {
            eprintln!(
                "skipping: probe reports no overlayfs-in-userns support: {}",
                String::from_utf8_lossy(&gate.stderr)
            );
            return None;
        }
        Some(tmp)
    }

    #[test]
    fn test_probe_succeeds_with_and_without_tmpfs() {
        let Some(tmp) = setup() else { return };
        let rootfs = tmp.path().join("rootfs");
        let work = tmp.path().join("work");

        let with_tmpfs = run_probe(&rootfs, &work, true);
        assert_eq!(with_tmpfs.status.code(), Some(0));

        let without_tmpfs = run_probe(&rootfs, &work, false);
        assert_eq!(
            without_tmpfs.status.code(),
            Some(0),
            "stderr: {}",
            String::from_utf8_lossy(&without_tmpfs.stderr)
        );
    }

    #[test]
    fn test_probe_cleans_up_its_work_area() {
        let Some(tmp) = setup() else { return };
        let rootfs = tmp.path().join("rootfs");
        let work = tmp.path().join("work");

        let output = run_probe(&rootfs, &work, false);
        assert_eq!(output.status.code(), Some(0));
        assert!(
            !work.join(".probe").exists(),
            ".probe work area must be removed after the run"
        );
        // The probed rootfs is left untouched: the rename happened in the
        // overlay, not the image.
        assert!(!rootfs.join("src").exists());
        assert!(!rootfs.join("dst").exists());
    }

    #[test]
    fn test_probe_fails_for_missing_work_parent() {
        let Some(tmp) = setup() else { return };
        let rootfs = tmp.path().join("rootfs");

        let output = run_probe(&rootfs, Path::new("/nonexistent-burrow-work"), false);
        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            stderr.contains("work parent"),
            "missing work parent should be diagnosed, got: {}",
            stderr
        );
    }
}
