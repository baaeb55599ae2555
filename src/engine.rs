//! Tunnel engine boundary
//!
//! The packet engine is an opaque native dependency consumed through a
//! narrow start/stop/stats interface. All platform marshaling (fd passing,
//! native library loading) stays behind this trait; this crate never
//! reimplements packet forwarding.

use crate::error::Result;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Cumulative counters reported by the engine for one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

/// The embedded tunnel engine: bridges the virtual interface fd to a local
/// SOCKS5 endpoint.
pub trait TunnelEngine: Send + Sync {
    /// Start the engine bound to an already-established interface fd.
    /// The config file is guaranteed by the caller to exist, be readable,
    /// and be non-empty; its schema is owned by the configuration layer.
    fn start(&self, config_path: &Path, fd: RawFd) -> Result<()>;

    /// Stop the engine. Must be safe to call when not started.
    fn stop(&self);

    /// Current cumulative counters, or None when unavailable (e.g. the
    /// engine is mid-restart). A None reading is benign.
    fn stats(&self) -> Option<EngineCounters>;
}
