//! SOCKS5 proxy subprocess supervision
//!
//! The supervisor launches the external proxy binary with a generated,
//! process-private config file, drains its merged output so the pipe can
//! never block the child, and watches for unexpected exits. A crash is
//! retried a bounded number of times with a fixed backoff; past the limit
//! the supervisor gives up and reports a fatal failure to the orchestrator,
//! which is expected to tear the whole session down.
//!
//! State machine: Idle -> Launching -> Running -> (Exited ->
//! RestartPending -> Launching)* -> Stopped.

use crate::config::{ProxyConfig, ServerEntry, SupervisorConfig};
use crate::error::{Result, TunnelError};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Result of a `start` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The proxy subprocess was spawned and is being supervised
    Started,
    /// No server entry is enabled; nothing was spawned. This is a normal,
    /// reported condition, not a failure.
    NoUsableServer,
}

/// Supervision lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    #[default]
    Idle,
    Launching,
    Running,
    RestartPending,
    Stopped,
}

/// Events published to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The subprocess exited unexpectedly; a relaunch is pending
    Exited { attempt: u32, code: Option<i32> },
    /// The restart limit was exceeded; the supervisor has given up
    Fatal { attempts: u32 },
}

struct Inner {
    state: Mutex<SupervisorState>,
    intentional_stop: AtomicBool,
    restart_count: AtomicU32,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Inner {
    fn set_state(&self, state: SupervisorState) {
        *self.state.lock().unwrap() = state;
    }

    fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap()
    }
}

/// Launches and supervises the external SOCKS5 proxy subprocess.
pub struct ProxyProcessSupervisor {
    binary: PathBuf,
    config: SupervisorConfig,
    inner: Arc<Inner>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProxyProcessSupervisor {
    /// Create a supervisor for the given proxy binary. Returns the
    /// supervisor plus the event receiver the orchestrator listens on.
    pub fn new(
        binary: impl Into<PathBuf>,
        config: SupervisorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                binary: binary.into(),
                config,
                inner: Arc::new(Inner {
                    state: Mutex::new(SupervisorState::Idle),
                    intentional_stop: AtomicBool::new(false),
                    restart_count: AtomicU32::new(0),
                    events,
                }),
                shutdown: Mutex::new(None),
                task: tokio::sync::Mutex::new(None),
            },
            receiver,
        )
    }

    /// Current lifecycle state
    pub fn state(&self) -> SupervisorState {
        self.inner.state()
    }

    /// Whether a supervised subprocess is currently believed alive
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            SupervisorState::Launching | SupervisorState::Running | SupervisorState::RestartPending
        )
    }

    /// Launch attempts made since the last `start` (initial launch included
    /// once a crash has been observed)
    pub fn restart_count(&self) -> u32 {
        self.inner.restart_count.load(Ordering::SeqCst)
    }

    /// Launch the proxy subprocess and begin supervising it.
    ///
    /// Returns `NoUsableServer` without spawning when no server entry is
    /// enabled. A spawn failure (binary missing or not executable) is
    /// returned as `ProxyLaunchFailed` immediately and does not engage the
    /// restart policy; only post-launch crashes are retried.
    pub async fn start(&self, proxy_config: &ProxyConfig) -> Result<LaunchOutcome> {
        if self.is_running() {
            return Err(TunnelError::InvalidState(
                "Proxy supervisor already running".to_string(),
            ));
        }

        // Each start begins with a fresh restart budget
        self.inner.intentional_stop.store(false, Ordering::SeqCst);
        self.inner.restart_count.store(0, Ordering::SeqCst);

        if proxy_config.enabled_servers().is_empty() {
            log::info!("No enabled proxy server; skipping proxy launch");
            self.inner.set_state(SupervisorState::Idle);
            return Ok(LaunchOutcome::NoUsableServer);
        }

        self.inner.set_state(SupervisorState::Launching);
        let launch = launch_proxy(&self.binary, proxy_config, &self.config).map_err(|e| {
            self.inner.set_state(SupervisorState::Idle);
            e
        })?;
        self.inner.set_state(SupervisorState::Running);
        log::info!(
            "Proxy process launched (pid {:?})",
            launch.child.id()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);

        let task = tokio::spawn(supervise(
            Arc::clone(&self.inner),
            self.binary.clone(),
            self.config.clone(),
            proxy_config.clone(),
            launch,
            shutdown_rx,
        ));
        *self.task.lock().await = Some(task);

        Ok(LaunchOutcome::Started)
    }

    /// Stop the subprocess and the supervision task. Idempotent: the first
    /// call terminates everything, subsequent calls are no-ops.
    pub async fn stop(&self) {
        self.inner.intentional_stop.store(true, Ordering::SeqCst);

        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Proxy supervision task ended abnormally: {e}");
            }
        }
        self.inner.set_state(SupervisorState::Stopped);
    }
}

/// Everything tied to one subprocess instance. The config temp file must
/// outlive the child that reads it; both are discarded together on restart.
struct Launch {
    child: Child,
    _config_file: NamedTempFile,
}

async fn supervise(
    inner: Arc<Inner>,
    binary: PathBuf,
    config: SupervisorConfig,
    proxy_config: ProxyConfig,
    mut launch: Launch,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let status = tokio::select! {
            status = launch.child.wait() => Some(status),
            _ = wait_shutdown(&mut shutdown) => None,
        };

        let Some(status) = status else {
            // Intentional stop: terminate, bounded wait, then force-kill
            terminate_child(&mut launch.child, config.kill_grace).await;
            inner.set_state(SupervisorState::Stopped);
            return;
        };

        if inner.intentional_stop.load(Ordering::SeqCst) {
            inner.set_state(SupervisorState::Stopped);
            return;
        }

        // Unexpected exit while believed running: this is a crash
        let code = status.ok().and_then(|s| s.code());
        let attempt = inner.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!(
            "Proxy process exited unexpectedly (code {:?}, crash {attempt} of {})",
            code,
            config.restart_limit
        );

        if attempt > config.restart_limit {
            log::error!("Proxy restart limit exceeded; giving up");
            inner.set_state(SupervisorState::Stopped);
            let _ = inner.events.send(SupervisorEvent::Fatal {
                attempts: attempt,
            });
            return;
        }
        let _ = inner.events.send(SupervisorEvent::Exited { attempt, code });

        inner.set_state(SupervisorState::RestartPending);
        tokio::select! {
            _ = tokio::time::sleep(config.restart_backoff) => {}
            _ = wait_shutdown(&mut shutdown) => {
                inner.set_state(SupervisorState::Stopped);
                return;
            }
        }

        // Re-serialize the config for every relaunch so retries pick up
        // policy updates, and discard the previous process resources.
        inner.set_state(SupervisorState::Launching);
        match launch_proxy(&binary, &proxy_config, &config) {
            Ok(next) => {
                launch = next;
                inner.set_state(SupervisorState::Running);
                log::info!("Proxy process relaunched (pid {:?})", launch.child.id());
            }
            Err(e) => {
                log::error!("Proxy relaunch failed: {e}");
                inner.set_state(SupervisorState::Stopped);
                let _ = inner.events.send(SupervisorEvent::Fatal { attempts: attempt });
                return;
            }
        }
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Terminate then force-kill the child through its first-class process
/// handle.
async fn terminate_child(child: &mut Child, grace: std::time::Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => log::debug!("Proxy process terminated ({status})"),
        Ok(Err(e)) => log::warn!("Waiting for proxy process failed: {e}"),
        Err(_) => {
            log::warn!("Proxy process ignored terminate; force-killing");
            if let Err(e) = child.kill().await {
                log::warn!("Force-kill failed: {e}");
            }
        }
    }
}

/// Serialized form consumed by the proxy binary
#[derive(Debug, Serialize)]
struct ProxyFileConfig {
    local_address: String,
    local_port: u16,
    servers: Vec<ProxyFileServer>,
    load_balance: bool,
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct ProxyFileServer {
    address: String,
    port: u16,
    method: String,
    password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin_opts: Option<String>,
}

fn launch_proxy(
    binary: &Path,
    proxy_config: &ProxyConfig,
    config: &SupervisorConfig,
) -> Result<Launch> {
    let config_file = write_proxy_config(proxy_config, config)?;

    let mut command = Command::new(binary);
    command
        .arg("-c")
        .arg(config_file.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if proxy_config.exclude_local_routes {
        match ensure_acl_file(config) {
            Ok(Some(acl)) => {
                command.arg("--acl").arg(acl);
            }
            Ok(None) => log::warn!("Local-route exclusion requested but no ACL asset bundled"),
            Err(e) => log::warn!("ACL file unavailable, continuing without it: {e}"),
        }
    }

    let mut child = command.spawn().map_err(|e| {
        TunnelError::ProxyLaunchFailed(format!("{}: {e}", binary.display()))
    })?;

    // Drain merged output continuously so the pipe never blocks the child
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_output(stdout, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_output(stderr, "stderr"));
    }

    Ok(Launch {
        child,
        _config_file: config_file,
    })
}

/// Write the effective proxy configuration to a fresh process-private temp
/// file. Called immediately before each launch, never reused across
/// launches.
fn write_proxy_config(
    proxy_config: &ProxyConfig,
    config: &SupervisorConfig,
) -> Result<NamedTempFile> {
    let servers = proxy_config
        .enabled_servers()
        .into_iter()
        .map(|s| ProxyFileServer {
            address: s.address.clone(),
            port: s.port,
            method: s.method.clone(),
            password: s.password.clone(),
            plugin: resolve_plugin(s, &config.native_lib_dir),
            plugin_opts: s.plugin_opts.clone(),
        })
        .collect();

    let file_config = ProxyFileConfig {
        local_address: proxy_config.listen_address.clone(),
        local_port: proxy_config.listen_port,
        servers,
        load_balance: proxy_config.load_balance,
        verbose: proxy_config.verbose,
    };

    fs::create_dir_all(&config.work_dir)?;
    let mut file = tempfile::Builder::new()
        .prefix("proxy-")
        .suffix(".json")
        .tempfile_in(&config.work_dir)?;
    file.write_all(serde_json::to_string_pretty(&file_config)?.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Resolve a plugin name against the native-library directory. A bare name
/// that resolves to an existing binary is rewritten to its absolute path; a
/// bare name with no matching binary is dropped and the proxy launches
/// without it. Explicit paths pass through untouched.
fn resolve_plugin(server: &ServerEntry, native_lib_dir: &Path) -> Option<String> {
    let name = server.plugin.as_deref()?;
    if name.is_empty() {
        return None;
    }
    if name.contains(std::path::MAIN_SEPARATOR) {
        return Some(name.to_string());
    }
    let candidate = native_lib_dir.join(name);
    if candidate.is_file() {
        Some(candidate.to_string_lossy().into_owned())
    } else {
        log::warn!(
            "Plugin '{name}' not found in {}; launching without it",
            native_lib_dir.display()
        );
        None
    }
}

/// Extract the bundled ACL asset into private storage once; an existing
/// non-empty copy is the cached instance.
fn ensure_acl_file(config: &SupervisorConfig) -> Result<Option<PathBuf>> {
    let Some(asset) = &config.acl_asset else {
        return Ok(None);
    };
    let dest = config.work_dir.join("bypass.acl");
    let cached = fs::metadata(&dest).map(|m| m.len() > 0).unwrap_or(false);
    if !cached {
        fs::create_dir_all(&config.work_dir)?;
        fs::copy(asset, &dest)?;
        log::debug!("ACL asset extracted to {}", dest.display());
    }
    Ok(Some(dest))
}

/// Read the child's output line by line. Content is discarded except for
/// severity-worthy lines.
async fn drain_output<R: AsyncRead + Unpin>(stream: R, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let lowered = line.to_ascii_lowercase();
        if lowered.contains("error") || lowered.contains("fatal") || lowered.contains("panic") {
            log::warn!("proxy {name}: {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn server(enabled: bool) -> ServerEntry {
        ServerEntry {
            address: "server.example.com".to_string(),
            port: 8388,
            method: "chacha20-ietf-poly1305".to_string(),
            password: "pw".to_string(),
            plugin: None,
            plugin_opts: None,
            enabled,
        }
    }

    fn proxy_config(servers: Vec<ServerEntry>) -> ProxyConfig {
        ProxyConfig {
            servers,
            ..ProxyConfig::default()
        }
    }

    /// A stub "proxy binary": a shell script that ignores its arguments.
    fn stub_binary(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("proxy-stub.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_config(dir: &Path) -> SupervisorConfig {
        SupervisorConfig {
            restart_backoff: Duration::from_millis(20),
            kill_grace: Duration::from_millis(200),
            native_lib_dir: dir.to_path_buf(),
            work_dir: dir.join("work"),
            ..SupervisorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_no_usable_server() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _events) =
            ProxyProcessSupervisor::new(dir.path().join("absent"), test_config(dir.path()));

        let outcome = supervisor
            .start(&proxy_config(vec![server(false)]))
            .await
            .unwrap();
        assert_eq!(outcome, LaunchOutcome::NoUsableServer);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure_does_not_engage_restart_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, mut events) =
            ProxyProcessSupervisor::new(dir.path().join("no-such-binary"), test_config(dir.path()));

        let err = supervisor
            .start(&proxy_config(vec![server(true)]))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::ProxyLaunchFailed(_)));
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.restart_count(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_crash_loop_hits_restart_bound() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(dir.path(), "exit 1");
        let (supervisor, mut events) =
            ProxyProcessSupervisor::new(binary, test_config(dir.path()));

        let outcome = supervisor
            .start(&proxy_config(vec![server(true)]))
            .await
            .unwrap();
        assert_eq!(outcome, LaunchOutcome::Started);

        // Three crash notifications, then the fatal escalation: exactly
        // restart_limit retries, restart_limit + 1 total launches.
        let mut exits = 0;
        loop {
            match tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("supervisor went quiet")
                .expect("event channel closed")
            {
                SupervisorEvent::Exited { attempt, .. } => {
                    exits += 1;
                    assert_eq!(attempt, exits);
                }
                SupervisorEvent::Fatal { attempts } => {
                    assert_eq!(exits, 3);
                    assert_eq!(attempts, 4);
                    break;
                }
            }
        }
        // Allow the supervision task to record its final state
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(dir.path(), "sleep 30");
        let (supervisor, mut events) =
            ProxyProcessSupervisor::new(binary, test_config(dir.path()));

        supervisor
            .start(&proxy_config(vec![server(true)]))
            .await
            .unwrap();
        assert!(supervisor.is_running());

        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        // An intentional stop is not a crash: no events, no restart
        assert!(events.try_recv().is_err());

        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_cancels_restart_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(dir.path(), "exit 1");
        let mut config = test_config(dir.path());
        config.restart_backoff = Duration::from_secs(30);
        let (supervisor, mut events) = ProxyProcessSupervisor::new(binary, config);

        supervisor
            .start(&proxy_config(vec![server(true)]))
            .await
            .unwrap();

        // Wait for the first crash, which parks the task in its backoff
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SupervisorEvent::Exited { attempt: 1, .. }));

        // stop() must return promptly instead of waiting out the backoff
        tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .expect("stop blocked on restart backoff");
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[test]
    fn test_resolve_plugin_rewrites_known_name() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_path = dir.path().join("v2ray-plugin");
        fs::write(&plugin_path, "#!/bin/sh\n").unwrap();

        let mut entry = server(true);
        entry.plugin = Some("v2ray-plugin".to_string());
        let resolved = resolve_plugin(&entry, dir.path()).unwrap();
        assert_eq!(resolved, plugin_path.to_string_lossy());

        // A bare name with no matching binary is dropped
        entry.plugin = Some("missing-plugin".to_string());
        assert!(resolve_plugin(&entry, dir.path()).is_none());

        // An explicit path is not second-guessed
        let explicit = dir.path().join("custom-plugin").to_string_lossy().into_owned();
        entry.plugin = Some(explicit.clone());
        assert_eq!(resolve_plugin(&entry, dir.path()).unwrap(), explicit);

        entry.plugin = None;
        assert!(resolve_plugin(&entry, dir.path()).is_none());
    }

    #[test]
    fn test_config_file_written_per_launch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let proxy = proxy_config(vec![server(true), server(false)]);

        let file = write_proxy_config(&proxy, &config).unwrap();
        let contents = fs::read_to_string(file.path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();

        // Only enabled servers are serialized
        assert_eq!(parsed["servers"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["local_port"], 1080);
        assert_eq!(parsed["servers"][0]["address"], "server.example.com");

        // A second launch gets its own private file
        let second = write_proxy_config(&proxy, &config).unwrap();
        assert_ne!(file.path(), second.path());
    }

    #[test]
    fn test_acl_extracted_once_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let asset = dir.path().join("bundled.acl");
        fs::write(&asset, "[bypass_all]\n").unwrap();

        let mut config = test_config(dir.path());
        config.acl_asset = Some(asset.clone());

        let first = ensure_acl_file(&config).unwrap().unwrap();
        assert_eq!(fs::read_to_string(&first).unwrap(), "[bypass_all]\n");

        // Mutate the extracted copy; the cached instance wins on reuse
        fs::write(&first, "modified\n").unwrap();
        let second = ensure_acl_file(&config).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&second).unwrap(), "modified\n");
    }

    #[test]
    fn test_acl_absent_asset() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(ensure_acl_file(&config).unwrap().is_none());
    }
}
