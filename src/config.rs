//! Configuration model for the tunnel supervision core
//!
//! TOML-based parsing and validation in three parts: the virtual interface
//! config, the routing policy (proxy mode, excluded routes, per-app
//! entries), and the SOCKS5 proxy config handed to the supervisor. All
//! values are resolved by the embedding application; this crate only
//! validates and consumes them.

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Fallback IPv4 resolver applied when the policy DNS string is empty
pub const DEFAULT_DNS_V4: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
/// Fallback IPv6 resolver applied when the policy DNS string is empty
pub const DEFAULT_DNS_V6: Ipv6Addr = Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111);

/// Virtual interface configuration, immutable for the lifetime of one
/// connect/disconnect session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Interface name
    #[serde(default = "default_interface_name")]
    pub interface_name: String,
    /// MTU value
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Open the interface in multi-queue mode
    #[serde(default)]
    pub multi_queue: bool,
    /// IPv4 interface address (None disables IPv4 on the interface)
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 interface address (None disables IPv6 on the interface)
    pub ipv6: Option<Ipv6Addr>,
    /// IPv4 DNS server; empty string falls back to [`DEFAULT_DNS_V4`]
    #[serde(default)]
    pub dns_v4: String,
    /// IPv6 DNS server; empty string falls back to [`DEFAULT_DNS_V6`]
    #[serde(default)]
    pub dns_v6: String,
    /// Script to run after the interface is up
    pub post_up_script: Option<PathBuf>,
    /// Script to run before the interface is torn down
    pub pre_down_script: Option<PathBuf>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            interface_name: default_interface_name(),
            mtu: default_mtu(),
            multi_queue: false,
            ipv4: Some(Ipv4Addr::new(198, 18, 0, 1)),
            ipv6: None,
            dns_v4: String::new(),
            dns_v6: String::new(),
            post_up_script: None,
            pre_down_script: None,
        }
    }
}

impl TunnelConfig {
    /// Validate the interface configuration
    pub fn validate(&self) -> Result<()> {
        if self.interface_name.is_empty() {
            return Err(TunnelError::ConfigInvalid(
                "Interface name cannot be empty".to_string(),
            ));
        }
        if self.mtu < 576 || self.mtu > 9000 {
            return Err(TunnelError::ConfigInvalid(
                "MTU must be between 576 and 9000".to_string(),
            ));
        }
        if self.ipv4.is_none() && self.ipv6.is_none() {
            return Err(TunnelError::ConfigInvalid(
                "At least one of IPv4/IPv6 must be enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// How device traffic is split between the tunnel and the direct path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// All apps go through the tunnel
    #[default]
    Global,
    /// Listed apps bypass the tunnel; everything else is tunneled
    Bypass,
    /// Only listed apps are tunneled
    OnlyProxy,
}

/// One per-app routing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntry {
    /// Package or process identifier
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Routing policy for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub mode: ProxyMode,
    /// IP or CIDR strings routed around the interface; malformed entries
    /// are skipped at plan time, never fatal
    #[serde(default)]
    pub excluded_routes: Vec<String>,
    /// Per-app entries interpreted according to `mode`
    #[serde(default)]
    pub apps: Vec<AppEntry>,
    /// The running application's own identifier. In Bypass mode it is
    /// always excluded; in OnlyProxy mode with an empty allow-set it is
    /// excluded as well so the device keeps direct connectivity.
    #[serde(default)]
    pub self_id: String,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Global,
            excluded_routes: Vec::new(),
            apps: Vec::new(),
            self_id: String::new(),
        }
    }
}

/// One upstream SOCKS5 server descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub address: String,
    pub port: u16,
    /// Encryption method name, passed through to the proxy binary
    pub method: String,
    pub password: String,
    /// Optional plugin name, resolved to an absolute binary path at launch
    pub plugin: Option<String>,
    pub plugin_opts: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Configuration for the external SOCKS5 proxy subprocess
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Local listen address for the SOCKS5 endpoint
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    /// When off, at most one server entry may be enabled
    #[serde(default)]
    pub load_balance: bool,
    /// Route local-region addresses around the proxy via an ACL file
    #[serde(default)]
    pub exclude_local_routes: bool,
    /// Verbose logging knob passed to the proxy binary
    #[serde(default)]
    pub verbose: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            servers: Vec::new(),
            load_balance: false,
            exclude_local_routes: false,
            verbose: false,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| TunnelError::ConfigInvalid(format!("Failed to read config file: {e}")))?;
        <Self as FromStr>::from_str(&contents)
    }

    /// Server entries that are currently enabled
    pub fn enabled_servers(&self) -> Vec<&ServerEntry> {
        self.servers.iter().filter(|s| s.enabled).collect()
    }

    /// Validate the proxy configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(TunnelError::ConfigInvalid(
                "Proxy listen port cannot be zero".to_string(),
            ));
        }
        for server in &self.servers {
            if server.address.is_empty() {
                return Err(TunnelError::ConfigInvalid(
                    "Server address cannot be empty".to_string(),
                ));
            }
            if server.port == 0 {
                return Err(TunnelError::ConfigInvalid(
                    "Server port cannot be zero".to_string(),
                ));
            }
        }
        if !self.load_balance && self.enabled_servers().len() > 1 {
            return Err(TunnelError::ConfigInvalid(
                "At most one server may be enabled when load balancing is off".to_string(),
            ));
        }
        Ok(())
    }
}

impl FromStr for ProxyConfig {
    type Err = TunnelError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TunnelError::ConfigInvalid(format!("Failed to parse TOML: {e}")))
    }
}

/// Restart policy knobs for the proxy supervisor. The defaults match the
/// shipped behavior; embedders may tune them.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Unexpected exits tolerated before escalating to a fatal failure
    pub restart_limit: u32,
    /// Fixed delay between relaunches
    pub restart_backoff: Duration,
    /// How long `stop()` waits after a terminate before force-killing
    pub kill_grace: Duration,
    /// Directory holding plugin binaries shipped with the application
    pub native_lib_dir: PathBuf,
    /// Private working directory for generated config and the ACL file
    pub work_dir: PathBuf,
    /// Bundled ACL asset, extracted to `work_dir` on first use
    pub acl_asset: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_limit: 3,
            restart_backoff: Duration::from_secs(1),
            kill_grace: Duration::from_secs(2),
            native_lib_dir: PathBuf::from("."),
            work_dir: std::env::temp_dir(),
            acl_asset: None,
        }
    }
}

/// Stats polling knobs. Defaults match the shipped behavior.
#[derive(Debug, Clone, Copy)]
pub struct StatsConfig {
    /// Fixed polling interval
    pub interval: Duration,
    /// Byte rates below this are reported as zero to suppress idle noise
    pub min_rate: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            min_rate: 50,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_interface_name() -> String {
    "tun0".to_string()
}

fn default_mtu() -> u16 {
    1500
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    1080
}
