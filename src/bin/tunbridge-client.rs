//! Tunbridge driver binary
//!
//! Brings one tunnel session up from a TOML file and keeps it up until
//! Ctrl+C. Ships with a null engine (no packet forwarding), so this binary
//! exercises interface construction, proxy supervision, and the stats
//! plumbing; a real deployment injects its own [`TunnelEngine`].

use log::{error, info, warn};
use std::env;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tunbridge::{
    Command, EngineCounters, ProxyConfig, ProxyProcessSupervisor, Result, RoutingPolicy,
    ServiceOrchestrator, SessionSpec, SettingsStore, StatsConfig, SupervisorConfig, TunnelConfig,
    TunnelEngine, VirtualInterfaceBuilder,
};

/// Engine stand-in that forwards nothing. Lets the driver run the full
/// session lifecycle without a native engine library.
struct NullEngine;

impl TunnelEngine for NullEngine {
    fn start(&self, config_path: &Path, fd: RawFd) -> Result<()> {
        info!(
            "Null engine started (config {}, fd {fd}); no packets will be forwarded",
            config_path.display()
        );
        Ok(())
    }

    fn stop(&self) {
        info!("Null engine stopped");
    }

    fn stats(&self) -> Option<EngineCounters> {
        None
    }
}

/// Top-level file layout consumed by this binary
#[derive(Debug, serde::Deserialize)]
struct ClientConfig {
    /// Engine config handed through to the engine untouched
    engine_config: PathBuf,
    /// The external SOCKS5 proxy binary to supervise
    proxy_binary: PathBuf,
    /// Where the small enabled/auto-reconnect state file lives
    #[serde(default = "default_state_file")]
    state_file: PathBuf,
    #[serde(default)]
    tunnel: TunnelConfig,
    #[serde(default)]
    routing: RoutingPolicy,
    #[serde(default)]
    proxy: ProxyConfig,
}

fn default_state_file() -> PathBuf {
    std::env::temp_dir().join("tunbridge-state.toml")
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting tunbridge v{}", tunbridge::VERSION);

    let args: Vec<String> = env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("tunbridge.toml");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Cannot load {config_path}: {e}");
            process::exit(1);
        }
    };
    info!("Loaded configuration from {config_path}");

    let (supervisor, supervisor_events) = ProxyProcessSupervisor::new(
        config.proxy_binary.clone(),
        SupervisorConfig::default(),
    );
    let orchestrator = Arc::new(ServiceOrchestrator::new(
        Arc::new(NullEngine),
        VirtualInterfaceBuilder::new(),
        supervisor,
        SettingsStore::new(config.state_file.clone()),
        StatsConfig::default(),
    ));

    let (commands, command_rx) = mpsc::channel(8);
    let driver = tokio::spawn(Arc::clone(&orchestrator).run(command_rx, supervisor_events));

    let spec = SessionSpec {
        engine_config: config.engine_config,
        tunnel: config.tunnel,
        routing: config.routing,
        proxy: config.proxy,
    };
    if commands.send(Command::Connect(Box::new(spec))).await.is_err() {
        error!("Orchestrator is gone before the session could start");
        process::exit(1);
    }

    info!("Session requested; press Ctrl+C to disconnect");
    let mut stats = orchestrator.subscribe_stats();
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Signal handler failed: {e}");
                }
                info!("Shutdown signal received");
                break;
            }
            changed = stats.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = *stats.borrow_and_update();
                info!("traffic: {snapshot}");
            }
        }
    }

    // Dropping the command channel tears the session down in order
    drop(commands);
    if let Err(e) = driver.await {
        error!("Orchestrator task ended abnormally: {e}");
    }
    info!("Tunbridge client stopped");
}

fn load_config(path: &str) -> Result<ClientConfig> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}
