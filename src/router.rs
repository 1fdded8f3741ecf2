//! The router façade: one object owning the tunnel's addresses, routes,
//! bypass routes and DNS.
//!
//! Lifecycle is `up` → any number of `set` → `close`. `set` reconciles the
//! host towards the requested [`RouterConfig`], touching only what changed
//! since the last successful `set`. `set(None)` means "tear everything
//! down" and is the same as `set(Some(&RouterConfig::shutdown()))`.
//!
//! `close` only stops the route monitor. DNS is left as-is; the caller
//! reverts it with `set(None)` first, or with [`cleanup`] after a crash.

use crate::config::{DnsConfig, NetfilterMode, RouterConfig, RouterOptions};
use crate::dns::DnsManager;
use crate::error::{NetError, Result};
use crate::monitor::{MonitorHandle, RouteChangeSource, RouteMonitor};
use crate::os::{Gateway, NetworkPrimitives, TunnelHandle};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

/// Host network configuration for one tunnel.
pub trait Router: Send {
    /// Arms the router: starts route monitoring and pins bypass routes.
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Closed`] after [`close`](Self::close), or the
    /// monitor registration failure.
    fn up(&mut self) -> Result<()>;

    /// Reconciles the host with `config`; `None` tears everything down.
    ///
    /// Route changes are not rolled back when DNS fails.
    ///
    /// # Errors
    ///
    /// Returns the first address, route or DNS failure, or
    /// [`NetError::Closed`] after [`close`](Self::close).
    fn set(&mut self, config: Option<&RouterConfig>) -> Result<()>;

    /// Stops route monitoring. Idempotent. Does not revert DNS.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for implementations that must
    /// release OS resources.
    fn close(&mut self) -> Result<()>;
}

/// Opens a route-change source when the router comes up.
type SourceFactory = Box<dyn Fn() -> Result<Box<dyn RouteChangeSource>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Up,
    Closed,
}

/// What the last `set` left on the host.
#[derive(Debug, Default)]
struct Applied {
    addrs: Vec<IpNet>,
    routes: Vec<IpNet>,
    dns: Option<DnsConfig>,
    netfilter: NetfilterMode,
}

/// Host routes that keep the tunnel's own transport off the tunnel.
///
/// Shared between `set` and the route monitor callback.
struct Bypass {
    net: Arc<dyn NetworkPrimitives>,
    tunnel: String,
    endpoints: Vec<IpAddr>,
    pinned: HashMap<IpAddr, Gateway>,
}

impl Bypass {
    /// Points every endpoint at the current non-tunnel default route.
    ///
    /// Unchanged pins are left alone, so our own route writes do not feed
    /// back into the monitor.
    fn reassert(&mut self) -> Result<()> {
        for ep in self.endpoints.clone() {
            let Some(gateway) = self.net.default_route(ep.is_ipv6(), &self.tunnel)? else {
                tracing::debug!(
                    endpoint = %ep,
                    "No default route outside the tunnel, skipping bypass"
                );
                continue;
            };
            if self.pinned.get(&ep) == Some(&gateway) {
                continue;
            }
            self.net.pin_host_route(ep, &gateway)?;
            tracing::info!(endpoint = %ep, gateway = %gateway, "Pinned bypass route");
            self.pinned.insert(ep, gateway);
        }
        Ok(())
    }

    fn set_endpoints(&mut self, endpoints: &[IpAddr]) -> Result<()> {
        let stale: Vec<IpAddr> = self
            .pinned
            .keys()
            .filter(|ep| !endpoints.contains(ep))
            .copied()
            .collect();
        for ep in stale {
            self.net.unpin_host_route(ep)?;
            self.pinned.remove(&ep);
            tracing::info!(endpoint = %ep, "Removed bypass route");
        }
        self.endpoints = endpoints.to_vec();
        Ok(())
    }
}

fn lock(bypass: &Mutex<Bypass>) -> std::sync::MutexGuard<'_, Bypass> {
    bypass.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entries of `old` missing from `new`, and entries of `new` missing from
/// `old`, each in input order.
fn diff(old: &[IpNet], new: &[IpNet]) -> (Vec<IpNet>, Vec<IpNet>) {
    let removed = old.iter().filter(|n| !new.contains(n)).copied().collect();
    let added = new.iter().filter(|n| !old.contains(n)).copied().collect();
    (removed, added)
}

/// [`Router`] built from [`NetworkPrimitives`], a [`DnsManager`] and a
/// route-change source.
pub struct SystemRouter {
    tunnel: TunnelHandle,
    net: Arc<dyn NetworkPrimitives>,
    dns: DnsManager,
    watch: SourceFactory,
    bypass: Arc<Mutex<Bypass>>,
    monitor: Option<MonitorHandle>,
    state: State,
    applied: Applied,
}

impl SystemRouter {
    /// Assembles a router. Nothing touches the host until [`Router::up`] or
    /// [`Router::set`].
    #[must_use]
    pub fn new(
        tunnel: TunnelHandle,
        net: Arc<dyn NetworkPrimitives>,
        dns: DnsManager,
        watch: impl Fn() -> Result<Box<dyn RouteChangeSource>> + Send + 'static,
    ) -> Self {
        let bypass = Bypass {
            net: net.clone(),
            tunnel: tunnel.name.clone(),
            endpoints: Vec::new(),
            pinned: HashMap::new(),
        };
        Self {
            tunnel,
            net,
            dns,
            watch: Box::new(watch),
            bypass: Arc::new(Mutex::new(bypass)),
            monitor: None,
            state: State::Created,
            applied: Applied::default(),
        }
    }

    /// Returns `true` between `up` and `close`.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.state == State::Up
    }

    fn remove_stale_routes(&mut self, routes: &[IpNet]) {
        let (removed, _) = diff(&self.applied.routes, routes);
        for dst in removed {
            if let Err(e) = self.net.del_route(&self.tunnel, dst) {
                tracing::warn!(route = %dst, error = %e, "Failed to remove route");
            }
            self.applied.routes.retain(|r| *r != dst);
        }
    }

    fn add_new_routes(&mut self, routes: &[IpNet]) -> Result<()> {
        let (_, added) = diff(&self.applied.routes, routes);
        for dst in added {
            self.net.add_route(&self.tunnel, dst)?;
            tracing::debug!(route = %dst, "Added route");
            self.applied.routes.push(dst);
        }
        Ok(())
    }

    fn remove_stale_addresses(&mut self, addrs: &[IpNet]) {
        let (removed, _) = diff(&self.applied.addrs, addrs);
        for addr in removed {
            if let Err(e) = self.net.del_address(&self.tunnel, addr) {
                tracing::warn!(addr = %addr, error = %e, "Failed to remove address");
            }
            self.applied.addrs.retain(|a| *a != addr);
        }
    }

    fn add_new_addresses(&mut self, addrs: &[IpNet]) -> Result<()> {
        let (_, added) = diff(&self.applied.addrs, addrs);
        for addr in added {
            self.net.add_address(&self.tunnel, addr)?;
            tracing::debug!(addr = %addr, "Added address");
            self.applied.addrs.push(addr);
        }
        Ok(())
    }

    fn sync_dns(&mut self, dns: &DnsConfig) -> Result<()> {
        if self.applied.dns.as_ref() == Some(dns) {
            tracing::debug!("DNS unchanged");
            return Ok(());
        }
        let result = if dns.is_empty() {
            self.dns.down()
        } else {
            self.dns.up(dns)
        };
        match result {
            Ok(()) => {
                self.applied.dns = Some(dns.clone());
                Ok(())
            }
            Err(e) => {
                self.applied.dns = None;
                Err(e)
            }
        }
    }
}

impl Router for SystemRouter {
    fn up(&mut self) -> Result<()> {
        match self.state {
            State::Closed => return Err(NetError::Closed),
            State::Up => return Ok(()),
            State::Created => {}
        }

        let source = (self.watch)()?;
        let bypass = self.bypass.clone();
        let handle = RouteMonitor::register(source, move || lock(&bypass).reassert())?;
        self.monitor = Some(handle);
        self.state = State::Up;
        tracing::info!(interface = %self.tunnel.name, index = self.tunnel.index, "Router up");
        Ok(())
    }

    fn set(&mut self, config: Option<&RouterConfig>) -> Result<()> {
        if self.state == State::Closed {
            return Err(NetError::Closed);
        }
        let shutdown;
        let config = if let Some(config) = config {
            config
        } else {
            shutdown = RouterConfig::shutdown();
            &shutdown
        };

        // Routes leave before the addresses they may depend on, and arrive
        // after them.
        self.remove_stale_routes(&config.routes);
        self.remove_stale_addresses(&config.local_addrs);
        self.add_new_addresses(&config.local_addrs)?;
        self.add_new_routes(&config.routes)?;

        {
            let mut bypass = lock(&self.bypass);
            bypass.set_endpoints(&config.bypass)?;
            if self.monitor.is_some() {
                bypass.reassert()?;
            }
        }

        if config.netfilter_mode != self.applied.netfilter {
            tracing::info!(
                from = %self.applied.netfilter,
                to = %config.netfilter_mode,
                "Netfilter mode changed"
            );
            self.applied.netfilter = config.netfilter_mode;
        }

        self.sync_dns(&config.dns)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.unregister();
        }
        if self.state != State::Closed {
            self.state = State::Closed;
            tracing::info!(
                interface = %self.tunnel.name,
                index = self.tunnel.index,
                "Router closed"
            );
        }
        Ok(())
    }
}

impl Drop for SystemRouter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// [`Router`] for platforms without host configuration support: every
/// operation is logged and otherwise ignored, so a tunnel can still run.
#[derive(Debug)]
pub struct NoopRouter {
    tunnel: TunnelHandle,
    closed: bool,
}

impl NoopRouter {
    /// Creates a router that changes nothing on the host.
    #[must_use]
    pub const fn new(tunnel: TunnelHandle) -> Self {
        Self {
            tunnel,
            closed: false,
        }
    }
}

impl Router for NoopRouter {
    fn up(&mut self) -> Result<()> {
        if self.closed {
            return Err(NetError::Closed);
        }
        tracing::info!(
            interface = %self.tunnel.name,
            index = self.tunnel.index,
            "Router up (no-op)"
        );
        Ok(())
    }

    fn set(&mut self, config: Option<&RouterConfig>) -> Result<()> {
        if self.closed {
            return Err(NetError::Closed);
        }
        tracing::info!(
            interface = %self.tunnel.name,
            config = ?config,
            "Router set (no-op)"
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            tracing::info!(interface = %self.tunnel.name, "Router closed (no-op)");
        }
        Ok(())
    }
}

/// Creates the platform router for `tunnel`: iproute2 and netlink on Linux,
/// `ifconfig`/`route` and `PF_ROUTE` on macOS and the BSDs, a
/// [`NoopRouter`] elsewhere.
///
/// # Errors
///
/// Currently infallible; platform setup may fail in the future.
pub fn new_router(tunnel: TunnelHandle, options: RouterOptions) -> Result<Box<dyn Router>> {
    platform::new_router(tunnel, options)
}

/// Best-effort removal of DNS state a crashed process left behind for
/// `interface`. Failures are logged, never returned.
pub fn cleanup(interface: &str, options: &RouterOptions) {
    let Some(dns) = platform::dns_manager(options, interface) else {
        return;
    };

    match dns.direct().cleanup_orphaned() {
        Ok(true) => tracing::info!("Restored resolver file left by a dead process"),
        Ok(false) => {}
        Err(e) => tracing::warn!(error = %e, "Failed to clean up resolver file"),
    }
    if let Err(e) = dns.down() {
        tracing::warn!(interface = %interface, error = %e, "Failed to revert DNS during cleanup");
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::{Router, SystemRouter};
    use crate::command::{CommandRunner, SystemRunner};
    use crate::config::RouterOptions;
    use crate::dns::{DnsHost, DnsManager};
    use crate::error::Result;
    use crate::monitor::{RouteChangeSource, RoutingSocket};
    use crate::os::{IpRoute2, TunnelHandle};
    use crate::resolved::SystemResolvedBus;
    use crate::util::SystemInterfaces;
    use std::sync::Arc;

    fn host(options: &RouterOptions) -> DnsHost {
        DnsHost {
            runner: Arc::new(SystemRunner::new(options.command_timeout)),
            bus: Arc::new(SystemResolvedBus::new(options.bus_timeout)),
            interfaces: Arc::new(SystemInterfaces),
        }
    }

    #[allow(clippy::unnecessary_wraps)]
    pub fn dns_manager(options: &RouterOptions, interface: &str) -> Option<DnsManager> {
        Some(DnsManager::new(host(options), options.clone(), interface))
    }

    #[allow(clippy::unnecessary_wraps)]
    pub fn new_router(tunnel: TunnelHandle, options: RouterOptions) -> Result<Box<dyn Router>> {
        let host = host(&options);
        let runner: Arc<dyn CommandRunner> = host.runner.clone();
        let dns = DnsManager::new(host, options, tunnel.name.clone());
        Ok(Box::new(SystemRouter::new(
            tunnel,
            Arc::new(IpRoute2::new(runner)),
            dns,
            || Ok(Box::new(RoutingSocket::open()?) as Box<dyn RouteChangeSource>),
        )))
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
mod platform {
    use super::{Router, SystemRouter};
    use crate::command::{CommandRunner, SystemRunner};
    use crate::config::RouterOptions;
    use crate::dns::{DnsHost, DnsManager};
    use crate::error::Result;
    use crate::monitor::{RouteChangeSource, RoutingSocket};
    use crate::os::{BsdRoute, TunnelHandle};
    use crate::resolved::UnavailableBus;
    use crate::util::SystemInterfaces;
    use std::sync::Arc;

    fn host(options: &RouterOptions) -> DnsHost {
        DnsHost {
            runner: Arc::new(SystemRunner::new(options.command_timeout)),
            bus: Arc::new(UnavailableBus),
            interfaces: Arc::new(SystemInterfaces),
        }
    }

    #[allow(clippy::unnecessary_wraps)]
    pub fn dns_manager(options: &RouterOptions, interface: &str) -> Option<DnsManager> {
        Some(DnsManager::new(host(options), options.clone(), interface))
    }

    #[allow(clippy::unnecessary_wraps)]
    pub fn new_router(tunnel: TunnelHandle, options: RouterOptions) -> Result<Box<dyn Router>> {
        let host = host(&options);
        let runner: Arc<dyn CommandRunner> = host.runner.clone();
        let dns = DnsManager::new(host, options, tunnel.name.clone());
        Ok(Box::new(SystemRouter::new(
            tunnel,
            Arc::new(BsdRoute::new(runner)),
            dns,
            || Ok(Box::new(RoutingSocket::open()?) as Box<dyn RouteChangeSource>),
        )))
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
)))]
mod platform {
    use super::{NoopRouter, Router};
    use crate::config::RouterOptions;
    use crate::dns::DnsManager;
    use crate::error::Result;
    use crate::os::TunnelHandle;

    pub const fn dns_manager(_: &RouterOptions, _: &str) -> Option<DnsManager> {
        None
    }

    #[allow(clippy::unnecessary_wraps)]
    pub fn new_router(tunnel: TunnelHandle, _: RouterOptions) -> Result<Box<dyn Router>> {
        tracing::info!(interface = %tunnel.name, "No host router for this platform, using no-op");
        Ok(Box::new(NoopRouter::new(tunnel)))
    }
}
