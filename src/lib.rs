//! Builds installation payloads for fabric control and worker nodes.
//!
//! Versioned artifacts are pulled from an OCI registry into a local cache,
//! assembled into a per-node staging tree and emitted as one of:
//!
//! - **manual**: `<kind>--<name>--install.tgz` plus an Ignition `.ign`
//! - **usb**: a raw GPT disk image with an `ESP` and a `FABINSTALL` FAT32
//!   partition
//! - **iso**: an ISO9660 image with Rock Ridge names and an El Torito EFI entry
//!
//! # Architecture
//!
//! ```text
//! bin/fab-installer
//!     │
//!     └── builder ── gate (fingerprint, skip, clean, persist)
//!             │
//!             ├── assemble ── cache ── registry (OCI over HTTP)
//!             ├── output (manual .tgz) + bootcfg (.ign)
//!             └── disk ── layout, gpt, fat, iso9660, tree
//! ```
//!
//! Nothing here needs root or host tools: partition tables and filesystems
//! are written directly into image files.

pub mod assemble;
pub mod bootcfg;
pub mod builder;
pub mod cache;
pub mod config;
pub mod disk;
pub mod error;
pub mod fsutil;
pub mod gate;
pub mod output;
pub mod target;

#[cfg(test)]
mod testutil;

pub use builder::{BuildOutcome, Builder};
pub use target::{BuildMode, BuildTarget, NodeKind};
