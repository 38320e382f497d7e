//! Shared machinery for the `burrow` sandbox launcher and its companion
//! `burrow-probe` kernel-feature probe.
//!
//! Both binaries build on the same primitives: filesystem helpers, mount
//! construction, user-namespace ID mapping, signal forwarding, and the
//! two-process clone rendezvous that brings a container up.

pub mod config;
pub mod fsutil;
pub mod mounts;
pub mod sandbox;
pub mod signals;
pub mod userns;
pub mod world;

/// Version string reported by `--version` of both binaries.
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    " ",
    env!("BUILD_DATE"),
    ")"
);
