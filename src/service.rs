//! Service orchestration
//!
//! The orchestrator owns the session lifecycle: it drives the interface
//! builder, the engine boundary, the proxy supervisor, the stats polling
//! task and the persisted settings through a single connect/disconnect
//! state machine. Commands arrive over an mpsc channel; state changes and
//! failures are published over a broadcast channel; traffic snapshots are
//! published over a watch channel so late subscribers always see the most
//! recent value.

use crate::config::{ProxyConfig, RoutingPolicy, StatsConfig, TunnelConfig};
use crate::engine::TunnelEngine;
use crate::error::{Result, TunnelError};
use crate::interface::{InterfaceHandle, VirtualInterfaceBuilder};
use crate::settings::SettingsStore;
use crate::stats::{StatsAggregator, TrafficSnapshot};
use crate::supervisor::{LaunchOutcome, ProxyProcessSupervisor, SupervisorEvent};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// How long `connect` waits for the settings store to settle before
/// giving up on the session.
const SETTINGS_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of the tunnel service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    /// A required collaborator failed mid-start; transitional, always
    /// followed by `Stopped`
    Failed,
}

/// Events published to embedding code over the broadcast channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    StateChanged(ServiceState),
    Connected,
    Disconnected,
    /// The proxy subprocess exhausted its restart budget; the session has
    /// been torn down
    ProxyFatal { attempts: u32 },
}

/// Commands consumed by [`ServiceOrchestrator::run`]
#[derive(Debug)]
pub enum Command {
    Connect(Box<SessionSpec>),
    Disconnect,
}

/// Everything needed to bring one session up
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Engine config file handed through to [`TunnelEngine::start`];
    /// validated for existence and readability before any OS object is
    /// created
    pub engine_config: PathBuf,
    pub tunnel: TunnelConfig,
    pub routing: RoutingPolicy,
    pub proxy: ProxyConfig,
}

/// Live resources of one established session
struct Session {
    interface: InterfaceHandle,
    stats_task: JoinHandle<()>,
    connected_since: Instant,
}

/// Owns and sequences every session collaborator.
pub struct ServiceOrchestrator {
    engine: Arc<dyn TunnelEngine>,
    builder: VirtualInterfaceBuilder,
    supervisor: ProxyProcessSupervisor,
    settings: SettingsStore,
    stats_config: StatsConfig,
    state: Mutex<ServiceState>,
    session: tokio::sync::Mutex<Option<Session>>,
    stats_tx: watch::Sender<TrafficSnapshot>,
    events_tx: broadcast::Sender<ServiceEvent>,
}

impl ServiceOrchestrator {
    pub fn new(
        engine: Arc<dyn TunnelEngine>,
        builder: VirtualInterfaceBuilder,
        supervisor: ProxyProcessSupervisor,
        settings: SettingsStore,
        stats_config: StatsConfig,
    ) -> Self {
        let (stats_tx, _) = watch::channel(TrafficSnapshot::default());
        let (events_tx, _) = broadcast::channel(32);
        Self {
            engine,
            builder,
            supervisor,
            settings,
            stats_config,
            state: Mutex::new(ServiceState::Stopped),
            session: tokio::sync::Mutex::new(None),
            stats_tx,
            events_tx,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Most recent traffic snapshot (all-zero before the first poll)
    pub fn latest_stats(&self) -> TrafficSnapshot {
        *self.stats_tx.borrow()
    }

    /// Subscribe to traffic snapshots; the receiver immediately sees the
    /// latest value
    pub fn subscribe_stats(&self) -> watch::Receiver<TrafficSnapshot> {
        self.stats_tx.subscribe()
    }

    /// Subscribe to lifecycle events. The channel is bounded; a subscriber
    /// that lags is skipped, never blocks the orchestrator.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events_tx.subscribe()
    }

    /// How long the current session has been up
    pub async fn connected_duration(&self) -> Option<Duration> {
        let session = self.session.lock().await;
        session.as_ref().map(|s| s.connected_since.elapsed())
    }

    fn set_state(&self, state: ServiceState) {
        *self.state.lock().unwrap() = state;
        let _ = self.events_tx.send(ServiceEvent::StateChanged(state));
    }

    /// Bring a session up. Idempotent: a connect while starting or running
    /// is a logged no-op, never a duplicated session.
    ///
    /// The proxy subprocess is best-effort: a session with no usable server
    /// or a failed proxy launch still reaches `Running` with the tunnel up.
    pub async fn connect(&self, spec: SessionSpec) -> Result<()> {
        // Check-and-transition under one lock so two racing connects can
        // never both proceed to build a session
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, ServiceState::Starting | ServiceState::Running) {
                log::info!("Connect ignored: session already {:?}", *state);
                return Ok(());
            }
            *state = ServiceState::Starting;
        }
        let _ = self
            .events_tx
            .send(ServiceEvent::StateChanged(ServiceState::Starting));
        log::info!("Starting tunnel session on {}", spec.tunnel.interface_name);

        // Never start against half-written configuration
        if let Err(e) = self.settings.wait_settled(SETTINGS_SETTLE_TIMEOUT).await {
            self.set_state(ServiceState::Stopped);
            return Err(e);
        }
        if let Err(e) = spec.proxy.validate() {
            self.set_state(ServiceState::Stopped);
            return Err(e);
        }

        let mut interface = match self
            .builder
            .build(&spec.tunnel, &spec.routing, &spec.engine_config)
        {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Interface construction failed: {e}");
                self.set_state(ServiceState::Failed);
                self.set_state(ServiceState::Stopped);
                return Err(e);
            }
        };
        let Some(fd) = interface.raw_fd() else {
            self.set_state(ServiceState::Stopped);
            return Err(TunnelError::InvalidState(
                "Provisioner returned a closed handle".to_string(),
            ));
        };

        if let Err(e) = self.engine.start(&spec.engine_config, fd) {
            log::error!("Engine start failed: {e}");
            // The engine never took ownership; release the interface here
            interface.close();
            self.set_state(ServiceState::Failed);
            self.set_state(ServiceState::Stopped);
            return Err(e);
        }

        // Proxy launch problems degrade the session, they don't abort it
        match self.supervisor.start(&spec.proxy).await {
            Ok(LaunchOutcome::Started) => {}
            Ok(LaunchOutcome::NoUsableServer) => {
                log::info!("Session up without a proxy: no usable server")
            }
            Err(e) => log::warn!("Session up without a proxy: {e}"),
        }

        let stats_task = self.spawn_stats_task();

        let mut session = self.session.lock().await;
        *session = Some(Session {
            interface,
            stats_task,
            connected_since: Instant::now(),
        });
        drop(session);

        if let Err(e) = self.settings.set_enabled(true).await {
            log::warn!("Failed to persist enabled state: {e}");
        }
        self.set_state(ServiceState::Running);
        let _ = self.events_tx.send(ServiceEvent::Connected);
        log::info!("Tunnel session established");
        Ok(())
    }

    /// Tear the session down. Idempotent, and every step is best-effort: a
    /// failing step is logged and the remaining steps still run, so a
    /// partial failure never leaks the interface fd. Also the handler for
    /// an external permission revoke.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ServiceState::Stopped => return,
                ServiceState::Stopping => {
                    log::debug!("Disconnect ignored: teardown already in progress");
                    return;
                }
                _ => *state = ServiceState::Stopping,
            }
        }
        let _ = self
            .events_tx
            .send(ServiceEvent::StateChanged(ServiceState::Stopping));
        log::info!("Stopping tunnel session");

        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            // Fixed order: stats polling first so no poll observes a
            // stopping engine, then engine, then proxy, then the fd.
            // A poll already past its tick can still be running after
            // abort(), so wait for the task to actually finish.
            session.stats_task.abort();
            let _ = session.stats_task.await;
            self.engine.stop();
            self.supervisor.stop().await;
            session.interface.close();
        } else {
            // State said otherwise; release collaborators anyway
            self.engine.stop();
            self.supervisor.stop().await;
        }
        self.stats_tx.send_replace(TrafficSnapshot::default());

        if let Err(e) = self.settings.set_enabled(false).await {
            log::warn!("Failed to persist disabled state: {e}");
        }
        self.set_state(ServiceState::Stopped);
        let _ = self.events_tx.send(ServiceEvent::Disconnected);
        log::info!("Tunnel session stopped");
    }

    /// Reconcile with the OS view of the transport. A session believed
    /// running whose underlying transport is gone is force-torn-down, and a
    /// stale persisted `enabled` flag with no transport (e.g. after a
    /// process restart) is cleared so boot logic stops reconnecting into a
    /// dead session.
    pub async fn check_transport(&self, transport_active: bool) {
        if transport_active {
            return;
        }
        if self.state() == ServiceState::Running {
            log::warn!("Transport lost while running; forcing teardown");
            self.disconnect().await;
            return;
        }
        match self.settings.load().await {
            Ok(persisted) if persisted.enabled => {
                log::warn!("Persisted enabled flag with no active transport; clearing");
                if let Err(e) = self.settings.set_enabled(false).await {
                    log::warn!("Failed to clear persisted enabled state: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Could not read persisted state during transport check: {e}"),
        }
    }

    fn spawn_stats_task(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let tx = self.stats_tx.clone();
        let mut aggregator = StatsAggregator::new(self.stats_config);
        let interval = self.stats_config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = aggregator.poll(engine.stats());
                tx.send_replace(snapshot);
            }
        })
    }

    /// Drive the orchestrator: consume commands and supervisor events until
    /// the command channel closes, then tear down.
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<Command>,
        mut supervisor_events: mpsc::UnboundedReceiver<SupervisorEvent>,
    ) {
        let mut events_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect(spec)) => {
                        if let Err(e) = self.connect(*spec).await {
                            log::error!("Connect failed: {e}");
                        }
                    }
                    Some(Command::Disconnect) => self.disconnect().await,
                    None => {
                        self.disconnect().await;
                        return;
                    }
                },
                event = supervisor_events.recv(), if events_open => match event {
                    Some(SupervisorEvent::Exited { attempt, code }) => {
                        log::warn!("Proxy crash {attempt} (exit code {code:?})");
                    }
                    Some(SupervisorEvent::Fatal { attempts }) => {
                        let error = TunnelError::ProxyFatal { attempts };
                        log::error!("{error}; tearing session down");
                        self.disconnect().await;
                        let _ = self.events_tx.send(ServiceEvent::ProxyFatal { attempts });
                    }
                    None => events_open = false,
                },
            }
        }
    }
}
