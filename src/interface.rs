//! Virtual interface construction and teardown
//!
//! The builder turns a [`TunnelConfig`] and [`RoutingPolicy`] into an
//! [`InterfacePlan`] (addresses, routes, DNS, app filter), validates the
//! engine config file backing the session, and asks a provisioner to
//! establish the OS interface. The returned [`InterfaceHandle`] is the sole
//! owner of the interface fd; closing it is the only release action and is
//! idempotent.

use crate::config::{ProxyMode, RoutingPolicy, TunnelConfig, DEFAULT_DNS_V4, DEFAULT_DNS_V6};
use crate::error::{Result, TunnelError};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::BTreeSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Which applications' sockets bypass the virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppFilter {
    /// No per-app filtering; all traffic goes through the interface
    None,
    /// Listed apps bypass the interface
    Exclude(BTreeSet<String>),
    /// Only listed apps go through the interface
    Allow(BTreeSet<String>),
}

/// IPv4 leg of the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanV4 {
    pub address: Ipv4Addr,
    pub dns: Ipv4Addr,
}

/// IPv6 leg of the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanV6 {
    pub address: Ipv6Addr,
    pub dns: Ipv6Addr,
}

/// Fully-resolved interface construction plan. Pure data: computing it
/// performs no OS calls, so the policy semantics are testable without
/// privileges.
#[derive(Debug, Clone)]
pub struct InterfacePlan {
    pub interface_name: String,
    pub mtu: u16,
    pub multi_queue: bool,
    pub v4: Option<PlanV4>,
    pub v6: Option<PlanV6>,
    /// Routes carried around the interface; already parsed and validated
    pub excluded: Vec<IpNet>,
    pub app_filter: AppFilter,
}

impl InterfacePlan {
    /// Compute the plan from config and policy.
    ///
    /// Malformed excluded-route entries are logged and skipped; they never
    /// abort interface construction.
    pub fn compute(config: &TunnelConfig, policy: &RoutingPolicy) -> Result<Self> {
        config.validate()?;

        let v4 = config.ipv4.map(|address| PlanV4 {
            address,
            dns: if config.dns_v4.is_empty() {
                DEFAULT_DNS_V4
            } else {
                config
                    .dns_v4
                    .parse()
                    .inspect_err(|e| {
                        log::warn!(
                            "Invalid IPv4 DNS '{}' ({e}), using default resolver",
                            config.dns_v4
                        );
                    })
                    .unwrap_or(DEFAULT_DNS_V4)
            },
        });

        let v6 = config.ipv6.map(|address| PlanV6 {
            address,
            dns: if config.dns_v6.is_empty() {
                DEFAULT_DNS_V6
            } else {
                config
                    .dns_v6
                    .parse()
                    .inspect_err(|e| {
                        log::warn!(
                            "Invalid IPv6 DNS '{}' ({e}), using default resolver",
                            config.dns_v6
                        );
                    })
                    .unwrap_or(DEFAULT_DNS_V6)
            },
        });

        let mut excluded = Vec::new();
        for entry in &policy.excluded_routes {
            match parse_excluded_route(entry) {
                Some(net) => excluded.push(net),
                None => log::warn!("Skipping malformed excluded route '{entry}'"),
            }
        }

        Ok(Self {
            interface_name: config.interface_name.clone(),
            mtu: config.mtu,
            multi_queue: config.multi_queue,
            v4,
            v6,
            excluded,
            app_filter: resolve_app_filter(policy),
        })
    }
}

/// Parse one excluded-route entry. A bare address gets the host-route
/// prefix for its family (32 for IPv4, 128 for IPv6).
fn parse_excluded_route(entry: &str) -> Option<IpNet> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    if entry.contains('/') {
        return entry.parse::<IpNet>().ok();
    }
    match entry.parse::<IpAddr>().ok()? {
        IpAddr::V4(addr) => Some(IpNet::V4(Ipv4Net::new(addr, 32).ok()?)),
        IpAddr::V6(addr) => Some(IpNet::V6(Ipv6Net::new(addr, 128).ok()?)),
    }
}

/// Apply the three-mode per-app semantics.
///
/// Bypass always excludes the running application itself. OnlyProxy with an
/// empty allow-set falls back to excluding the running application so the
/// device keeps direct connectivity instead of blackholing.
fn resolve_app_filter(policy: &RoutingPolicy) -> AppFilter {
    let enabled: BTreeSet<String> = policy
        .apps
        .iter()
        .filter(|a| a.enabled)
        .map(|a| a.id.clone())
        .collect();

    match policy.mode {
        ProxyMode::Global => AppFilter::None,
        ProxyMode::Bypass => {
            let mut set = enabled;
            if !policy.self_id.is_empty() {
                set.insert(policy.self_id.clone());
            }
            AppFilter::Exclude(set)
        }
        ProxyMode::OnlyProxy => {
            if enabled.is_empty() {
                let mut set = BTreeSet::new();
                if !policy.self_id.is_empty() {
                    set.insert(policy.self_id.clone());
                }
                AppFilter::Exclude(set)
            } else {
                AppFilter::Allow(enabled)
            }
        }
    }
}

/// Exclusively-owned handle to the established interface fd.
///
/// Closing the fd is the sole release action; a second `close()` is a
/// no-op. The optional pre-down script runs once, before the fd is closed.
#[derive(Debug)]
pub struct InterfaceHandle {
    fd: Option<RawFd>,
    pre_down_script: Option<PathBuf>,
}

impl InterfaceHandle {
    /// Wrap an already-open, non-blocking fd
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd: Some(fd),
            pre_down_script: None,
        }
    }

    pub fn with_pre_down_script(mut self, script: Option<PathBuf>) -> Self {
        self.pre_down_script = script;
        self
    }

    /// The raw fd, while open
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Release the interface. Idempotent.
    pub fn close(&mut self) {
        let Some(fd) = self.fd.take() else {
            return;
        };
        if let Some(script) = self.pre_down_script.take() {
            run_script(&script, "pre-down");
        }
        #[cfg(unix)]
        unsafe {
            if libc::close(fd) != 0 {
                log::warn!(
                    "Closing interface fd {fd} failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
        log::debug!("Interface fd {fd} released");
    }
}

impl Drop for InterfaceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_script(script: &Path, stage: &str) {
    match std::process::Command::new(script).status() {
        Ok(status) if status.success() => {}
        Ok(status) => log::warn!("{stage} script {} exited with {status}", script.display()),
        Err(e) => log::warn!("{stage} script {} failed to run: {e}", script.display()),
    }
}

/// OS-facing half of interface construction, injected so plan semantics
/// stay testable and all privileged code sits in one place.
pub trait InterfaceProvisioner: Send + Sync {
    /// Establish the interface described by the plan and return an open,
    /// non-blocking fd bound to it.
    fn establish(&self, plan: &InterfacePlan) -> Result<InterfaceHandle>;
}

/// Constructs and tears down the OS-level virtual interface.
pub struct VirtualInterfaceBuilder {
    provisioner: Box<dyn InterfaceProvisioner>,
}

impl VirtualInterfaceBuilder {
    /// Builder backed by the platform TUN provisioner
    #[cfg(unix)]
    pub fn new() -> Self {
        Self {
            provisioner: Box::new(platform::TunProvisioner),
        }
    }

    /// Builder backed by a custom provisioner (tests, alternate platforms)
    pub fn with_provisioner(provisioner: Box<dyn InterfaceProvisioner>) -> Self {
        Self { provisioner }
    }

    /// Build the interface for one session.
    ///
    /// Fails fast with `ConfigInvalid` before any OS object is created if
    /// the engine config file backing the session is missing, unreadable,
    /// or empty.
    pub fn build(
        &self,
        config: &TunnelConfig,
        policy: &RoutingPolicy,
        engine_config: &Path,
    ) -> Result<InterfaceHandle> {
        validate_engine_config(engine_config)?;

        let plan = InterfacePlan::compute(config, policy)?;
        log::info!(
            "Establishing interface {} (mtu {}, v4 {}, v6 {}, {} excluded routes)",
            plan.interface_name,
            plan.mtu,
            plan.v4.is_some(),
            plan.v6.is_some(),
            plan.excluded.len()
        );

        let handle = self
            .provisioner
            .establish(&plan)?
            .with_pre_down_script(config.pre_down_script.clone());

        if let Some(script) = &config.post_up_script {
            run_script(script, "post-up");
        }

        Ok(handle)
    }
}

#[cfg(unix)]
impl Default for VirtualInterfaceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check the engine config file exists, is readable, and is non-empty.
fn validate_engine_config(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|e| {
        TunnelError::ConfigInvalid(format!("Engine config {} unavailable: {e}", path.display()))
    })?;
    if metadata.len() == 0 {
        return Err(TunnelError::ConfigInvalid(format!(
            "Engine config {} is empty",
            path.display()
        )));
    }
    fs::File::open(path).map_err(|e| {
        TunnelError::ConfigInvalid(format!("Engine config {} unreadable: {e}", path.display()))
    })?;
    Ok(())
}

#[cfg(unix)]
mod platform {
    //! Default TUN-backed provisioner for unix targets.

    use super::{InterfaceHandle, InterfacePlan, InterfaceProvisioner};
    use crate::error::{Result, TunnelError};
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::process::Command;

    pub struct TunProvisioner;

    impl InterfaceProvisioner for TunProvisioner {
        fn establish(&self, plan: &InterfacePlan) -> Result<InterfaceHandle> {
            let mut config = tun::Configuration::default();
            config.name(&plan.interface_name).mtu(i32::from(plan.mtu));
            if plan.multi_queue {
                config.queues(2);
            }
            if let Some(v4) = &plan.v4 {
                config.address(v4.address).up();
            }

            let device = tun::create(&config).map_err(|e| {
                TunnelError::InterfaceEstablishFailed(format!(
                    "TUN device {}: {e}",
                    plan.interface_name
                ))
            })?;

            let fd = device.as_raw_fd();
            // On failure the device wrapper still owns the fd and its Drop
            // releases it exactly once
            set_nonblocking(fd)?;

            apply_routes(plan);

            // The fd keeps the non-persistent TUN device alive; ownership
            // moves to the handle, so the device wrapper must not close it.
            // Forget only after every fallible step has succeeded.
            std::mem::forget(device);
            Ok(InterfaceHandle::new(fd))
        }
    }

    /// Set `O_NONBLOCK` on a borrowed fd. Never closes the fd; the caller
    /// keeps ownership on both paths.
    fn set_nonblocking(fd: RawFd) -> Result<()> {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(TunnelError::InterfaceEstablishFailed(format!(
                    "fcntl(O_NONBLOCK): {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }

    /// Apply addresses, routes, and DNS with `ip`/`resolvectl`. Failures
    /// here are logged and skipped; the interface itself is already up and
    /// owned by the fd.
    fn apply_routes(plan: &InterfacePlan) {
        if let Some(v6) = &plan.v6 {
            let addr = format!("{}/128", v6.address);
            run_cmd("ip", &["-6", "addr", "add", &addr, "dev", &plan.interface_name]);
            run_cmd("ip", &["-6", "route", "add", "::/0", "dev", &plan.interface_name]);
        }
        if plan.v4.is_some() {
            run_cmd("ip", &["route", "add", "0.0.0.0/0", "dev", &plan.interface_name]);
        }
        for net in &plan.excluded {
            run_cmd(
                "ip",
                &["route", "add", "throw", &net.to_string(), "dev", &plan.interface_name],
            );
        }
        if let Some(v4) = &plan.v4 {
            run_cmd(
                "resolvectl",
                &["dns", &plan.interface_name, &v4.dns.to_string()],
            );
        }
        if let Some(v6) = &plan.v6 {
            run_cmd(
                "resolvectl",
                &["dns", &plan.interface_name, &v6.dns.to_string()],
            );
        }
    }

    fn run_cmd(program: &str, args: &[&str]) {
        match Command::new(program).args(args).output() {
            Ok(out) if out.status.success() => {}
            Ok(out) => log::warn!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => log::warn!("{program} {} failed: {e}", args.join(" ")),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::set_nonblocking;
        use std::os::unix::io::AsRawFd;

        #[test]
        fn test_set_nonblocking_leaves_fd_with_caller() {
            let file = tempfile::tempfile().unwrap();
            let fd = file.as_raw_fd();
            set_nonblocking(fd).unwrap();
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                assert_ne!(flags & libc::O_NONBLOCK, 0);
                // `file` still owns the fd; its eventual drop is the only close.
                assert_ne!(libc::fcntl(fd, libc::F_GETFD), -1);
            }
        }

        #[test]
        fn test_set_nonblocking_rejects_bad_fd_without_side_effects() {
            assert!(set_nonblocking(-1).is_err());
        }
    }
}
