//! Tunbridge - Tunnel/Proxy Process-Supervision Core
//!
//! This library is the supervision core of a SOCKS5-backed VPN client. It
//! owns the hard parts of the client runtime:
//! - Virtual network interface construction and teardown
//! - Driving an embedded tunnel engine bound to the interface fd
//! - Launching and supervising the external SOCKS5 proxy subprocess with
//!   crash detection and bounded auto-restart
//! - Traffic statistics aggregation on a fixed polling cadence
//! - An ordered, idempotent connect/disconnect state machine
//!
//! ## What Your Application Must Implement
//! - The tunnel engine itself (packet forwarding between the interface and
//!   the SOCKS5 endpoint) - injected through the [`engine::TunnelEngine`]
//!   trait
//! - The SOCKS5 proxy binary (an external black box launched by the
//!   supervisor)
//! - Configuration UI, persistence beyond the small state file this crate
//!   reads/writes, and route/policy resolution

pub mod config;
pub mod engine;
pub mod error;
pub mod interface;
pub mod service;
pub mod settings;
pub mod stats;
pub mod supervisor;

// Re-export core types for the embedding application
pub use config::{
    AppEntry, ProxyConfig, ProxyMode, RoutingPolicy, ServerEntry, StatsConfig, SupervisorConfig,
    TunnelConfig,
};
pub use engine::{EngineCounters, TunnelEngine};
pub use error::{Result, TunnelError};
pub use interface::{InterfaceHandle, InterfaceProvisioner, VirtualInterfaceBuilder};
pub use service::{Command, ServiceEvent, ServiceOrchestrator, ServiceState, SessionSpec};
pub use settings::{PersistedState, SettingsStore};
pub use stats::{StatsAggregator, TrafficSnapshot};
pub use supervisor::{LaunchOutcome, ProxyProcessSupervisor, SupervisorEvent, SupervisorState};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
