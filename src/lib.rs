#![doc = include_str!("../README.md")]

pub mod cache;
pub mod capture;
pub mod cidr;
pub mod decode;
pub mod engine;
pub mod filter;
pub mod services;
pub mod tree;

use serde::Serialize;

use std::path::PathBuf;

// Re-export the surface a typical caller touches.
pub use cache::{Cache, CacheHeader, Decision, Side, read_comment};
pub use capture::{FrameSource, MemorySource, PcapFileSource};
pub use cidr::CidrSet;
pub use engine::{AutoKind, Config, Engine, Mode, Pass};
pub use filter::{FilterSpec, Polarity};
pub use services::{ServicePortTable, Transport};
pub use tree::{HostRole, IpTree};

/// Everything that can abort a run.
///
/// Every error is fatal to the invocation: nothing is retried, and no
/// partial cache is ever written. Either a complete cache reaches disk or
/// none does.
#[derive(Debug, Clone, Serialize)]
pub enum PrepError {
    /// Invalid option combination or value.
    Config { message: String },

    /// A CIDR token that does not parse as `a.b.c.d/p`.
    InvalidCidr { token: String },

    /// A `--include`/`--exclude` spec that does not parse.
    InvalidFilter { spec: String, reason: String },

    /// A classification regex that does not compile.
    InvalidRegex { pattern: String, message: String },

    /// Services file could not be opened or read.
    ServicesFile { path: PathBuf, message: String },

    /// Capture file could not be opened.
    CaptureOpen { path: PathBuf, message: String },

    /// Capture file stopped being readable mid-pass.
    CaptureRead { message: String },

    /// BPF expression rejected by the compiler.
    BpfCompile { expr: String, message: String },

    /// The capture delivered zero packets; the filter was too restrictive
    /// or the file is empty.
    EmptyCapture,

    /// Router-mode learning found no server networks to aggregate.
    NoServerNetworks,

    /// A cache file with a bad magic, version or length.
    CacheFormat { message: String },

    /// Output cache could not be written.
    CacheWrite { path: PathBuf, message: String },

    /// Cache file could not be read back.
    CacheRead { path: PathBuf, message: String },
}

impl std::fmt::Display for PrepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrepError::Config { message } => write!(f, "configuration error: {message}"),
            PrepError::InvalidCidr { token } => write!(f, "invalid CIDR {token:?}"),
            PrepError::InvalidFilter { spec, reason } => {
                write!(f, "invalid filter {spec:?}: {reason}")
            }
            PrepError::InvalidRegex { pattern, message } => {
                write!(f, "invalid regex {pattern:?}: {message}")
            }
            PrepError::ServicesFile { path, message } => {
                write!(f, "cannot read services file {}: {message}", path.display())
            }
            PrepError::CaptureOpen { path, message } => {
                write!(f, "cannot open capture {}: {message}", path.display())
            }
            PrepError::CaptureRead { message } => write!(f, "capture read failed: {message}"),
            PrepError::BpfCompile { expr, message } => {
                write!(f, "cannot compile BPF filter {expr:?}: {message}")
            }
            PrepError::EmptyCapture => {
                write!(f, "no packets were processed; filter too limiting?")
            }
            PrepError::NoServerNetworks => {
                write!(f, "unable to build a valid list of server networks")
            }
            PrepError::CacheFormat { message } => write!(f, "bad cache file: {message}"),
            PrepError::CacheWrite { path, message } => {
                write!(f, "cannot write cache {}: {message}", path.display())
            }
            PrepError::CacheRead { path, message } => {
                write!(f, "cannot read cache {}: {message}", path.display())
            }
        }
    }
}

impl std::error::Error for PrepError {}
