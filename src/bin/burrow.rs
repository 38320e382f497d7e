use anyhow::Result;
use clap::Parser;
use nix::unistd::{Gid, Uid};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use burrow::config::{self, Config, ExecutionMode, MountSpec};
use burrow::sandbox;
use burrow::userns::IdMapping;

#[derive(Parser, Debug)]
#[command(
    name = "burrow",
    version = burrow::VERSION,
    about = "Run a command inside a freshly built user-namespace sandbox"
)]
struct Cli {
    /// Root filesystem image directory
    #[arg(long, value_name = "DIR")]
    rootfs: String,

    /// Directory to cd into once the sandbox is entered (created if needed)
    #[arg(long, value_name = "DIR")]
    cd: Option<PathBuf>,

    /// Mount a host path into the sandbox: <from>:<to>[:rw|ro|ov]
    #[arg(long = "mount", value_name = "FROM:TO[:KIND]")]
    mounts: Vec<String>,

    /// Keep overlay modifications in this host directory across runs
    #[arg(long, value_name = "DIR")]
    persist: Option<PathBuf>,

    /// Executable to prepend to the command vector
    #[arg(long, value_name = "EXE")]
    entrypoint: Option<String>,

    /// UID to appear as inside the sandbox
    #[arg(long, default_value_t = 0)]
    uid: u32,

    /// GID to appear as inside the sandbox
    #[arg(long, default_value_t = 0)]
    gid: u32,

    /// size= option for the tmpfs backing ephemeral overlay state
    #[arg(long, value_name = "SIZE", default_value = "1G")]
    tmpfs_size: String,

    /// Mount overlays with the userxattr option
    #[arg(long)]
    userxattr: bool,

    /// UTS hostname inside the sandbox
    #[arg(long, value_name = "NAME")]
    hostname: Option<String>,

    /// Narrate each bring-up step on stderr
    #[arg(long)]
    verbose: bool,

    /// Command to run inside the sandbox
    #[arg(value_name = "CMD", required = true, trailing_var_arg = true)]
    command: Vec<String>,
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

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mode = ExecutionMode::resolve()?;
    debug!("running in {:?} container mode", mode);

    // Must happen before any child exists: the SUDO_* variables are
    // consumed here and scrubbed from the inherited environment.
    let (src_uid, src_gid) = config::resolve_outside_ids();

    let mut mounts = Vec::new();
    for raw in &cli.mounts {
        match raw.parse::<MountSpec>() {
            Ok(spec) => {
                debug!(
                    "parsed --mount as {:?} -> {:?} ({:?})",
                    spec.outside_path, spec.mount_point, spec.kind
                );
                mounts.push(spec);
            }
            Err(e) => eprintln!("ERROR: {}  Ignoring...", e),
        }
    }

    let mut command = cli.command;
    if let Some(entrypoint) = cli.entrypoint {
        command.insert(0, entrypoint);
    }

    let cfg = Config {
        rootfs: config::normalize_rootfs(&cli.rootfs),
        cwd: cli.cd,
        persist: cli.persist,
        tmpfs_size: cli.tmpfs_size,
        ids: IdMapping {
            src_uid,
            src_gid,
            dst_uid: Uid::from_raw(cli.uid),
            dst_gid: Gid::from_raw(cli.gid),
        },
        hostname: cli.hostname,
        userxattr: cli.userxattr,
        mode,
        mounts,
        command,
    };

    sandbox::run(&cfg)
}
