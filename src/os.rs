//! Routing-table and interface-address primitives.
//!
//! The router only needs a handful of operations; each platform provides
//! them through its native tooling, run with the same bounded
//! [`CommandRunner`] as the DNS path.

use crate::command::{CommandLine, CommandRunner, run_checked};
use crate::error::Result;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// The tunnel interface, as created by the tun collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    /// Interface name, e.g. `tun0` or `utun4`.
    pub name: String,
    /// OS interface index.
    pub index: u32,
}

impl TunnelHandle {
    /// Creates a handle.
    #[must_use]
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

/// A default route: next hop (if any) and egress interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    /// Next-hop address; `None` for point-to-point links.
    pub via: Option<IpAddr>,
    /// Egress interface name.
    pub dev: String,
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.via {
            Some(via) => write!(f, "via {via} dev {}", self.dev),
            None => write!(f, "dev {}", self.dev),
        }
    }
}

/// Primitive OS operations the router composes.
pub trait NetworkPrimitives: Send + Sync {
    /// Assigns `addr` to the tunnel interface.
    ///
    /// # Errors
    ///
    /// Returns the underlying command or syscall failure.
    fn add_address(&self, tun: &TunnelHandle, addr: IpNet) -> Result<()>;

    /// Removes `addr` from the tunnel interface.
    ///
    /// # Errors
    ///
    /// Returns the underlying command or syscall failure.
    fn del_address(&self, tun: &TunnelHandle, addr: IpNet) -> Result<()>;

    /// Routes `dst` into the tunnel interface.
    ///
    /// # Errors
    ///
    /// Returns the underlying command or syscall failure.
    fn add_route(&self, tun: &TunnelHandle, dst: IpNet) -> Result<()>;

    /// Removes the tunnel route for `dst`.
    ///
    /// # Errors
    ///
    /// Returns the underlying command or syscall failure.
    fn del_route(&self, tun: &TunnelHandle, dst: IpNet) -> Result<()>;

    /// The current default route for the address family of `v6`, ignoring
    /// routes through `exclude`.
    ///
    /// # Errors
    ///
    /// Returns the underlying command or syscall failure.
    fn default_route(&self, v6: bool, exclude: &str) -> Result<Option<Gateway>>;

    /// Installs or replaces a host route for `dst` through `gateway`.
    ///
    /// # Errors
    ///
    /// Returns the underlying command or syscall failure.
    fn pin_host_route(&self, dst: IpAddr, gateway: &Gateway) -> Result<()>;

    /// Removes the host route for `dst`. Succeeds if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns the underlying command or syscall failure.
    fn unpin_host_route(&self, dst: IpAddr) -> Result<()>;
}

fn host_prefix(dst: IpAddr) -> IpNet {
    IpNet::from(dst)
}

/// Linux primitives through iproute2.
#[derive(Clone)]
pub struct IpRoute2 {
    runner: Arc<dyn CommandRunner>,
}

impl IpRoute2 {
    /// Creates primitives that run `ip` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn ip(&self, args: &[String]) -> Result<String> {
        run_checked(self.runner.as_ref(), &CommandLine::new("ip", args.iter().cloned()))
    }
}

/// Picks the first `default` line not leaving through `exclude` from
/// `ip route show default` output.
fn parse_ip_default(output: &str, exclude: &str) -> Option<Gateway> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&"default") {
            return None;
        }
        let value = |key: &str| {
            fields
                .windows(2)
                .find(|w| w[0] == key)
                .map(|w| w[1])
        };
        let dev = value("dev")?;
        if dev == exclude {
            return None;
        }
        Some(Gateway {
            via: value("via").and_then(|v| v.parse().ok()),
            dev: dev.to_string(),
        })
    })
}

impl NetworkPrimitives for IpRoute2 {
    fn add_address(&self, tun: &TunnelHandle, addr: IpNet) -> Result<()> {
        self.ip(&args(["addr", "replace", &addr.to_string(), "dev", &tun.name]))
            .map(drop)
    }

    fn del_address(&self, tun: &TunnelHandle, addr: IpNet) -> Result<()> {
        self.ip(&args(["addr", "del", &addr.to_string(), "dev", &tun.name]))
            .map(drop)
    }

    fn add_route(&self, tun: &TunnelHandle, dst: IpNet) -> Result<()> {
        self.ip(&args(["route", "replace", &dst.to_string(), "dev", &tun.name]))
            .map(drop)
    }

    fn del_route(&self, tun: &TunnelHandle, dst: IpNet) -> Result<()> {
        self.ip(&args(["route", "del", &dst.to_string(), "dev", &tun.name]))
            .map(drop)
    }

    fn default_route(&self, v6: bool, exclude: &str) -> Result<Option<Gateway>> {
        let family = if v6 { "-6" } else { "-4" };
        let out = self.ip(&args([family, "route", "show", "default"]))?;
        Ok(parse_ip_default(&out, exclude))
    }

    fn pin_host_route(&self, dst: IpAddr, gateway: &Gateway) -> Result<()> {
        let dst = host_prefix(dst).to_string();
        let mut cmd = args(["route", "replace", &dst]);
        if let Some(via) = gateway.via {
            cmd.extend(args(["via", &via.to_string()]));
        }
        cmd.extend(args(["dev", &gateway.dev]));
        self.ip(&cmd).map(drop)
    }

    fn unpin_host_route(&self, dst: IpAddr) -> Result<()> {
        let dst = host_prefix(dst).to_string();
        let out = self
            .runner
            .run(&CommandLine::new("ip", ["route", "del", dst.as_str()]))?;
        // ESRCH: already gone.
        if out.success() || out.output.contains("No such process") {
            Ok(())
        } else {
            Err(crate::NetError::Command {
                command: format!("ip route del {dst}"),
                output: out.output.trim().to_string(),
            })
        }
    }
}

/// macOS and BSD primitives through `ifconfig` and `route`.
#[derive(Clone)]
pub struct BsdRoute {
    runner: Arc<dyn CommandRunner>,
}

impl BsdRoute {
    /// Creates primitives that run `ifconfig`/`route` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn run(&self, program: &str, argv: Vec<String>) -> Result<String> {
        run_checked(self.runner.as_ref(), &CommandLine::new(program, argv))
    }
}

/// Reads `gateway:` and `interface:` from `route -n get default`.
fn parse_route_get(output: &str, exclude: &str) -> Option<Gateway> {
    let field = |key: &str| {
        output.lines().find_map(|line| {
            let (k, v) = line.trim().split_once(':')?;
            (k.trim() == key).then(|| v.trim().to_string())
        })
    };
    let dev = field("interface")?;
    if dev == exclude {
        return None;
    }
    Some(Gateway {
        via: field("gateway").and_then(|v| v.parse().ok()),
        dev,
    })
}

impl NetworkPrimitives for BsdRoute {
    fn add_address(&self, tun: &TunnelHandle, addr: IpNet) -> Result<()> {
        let argv = match addr {
            // utun is point-to-point: the local address doubles as peer.
            IpNet::V4(net) => args([
                &tun.name,
                "inet",
                &net.to_string(),
                &net.addr().to_string(),
                "alias",
            ]),
            IpNet::V6(net) => args([&tun.name, "inet6", &net.to_string(), "alias"]),
        };
        self.run("ifconfig", argv).map(drop)
    }

    fn del_address(&self, tun: &TunnelHandle, addr: IpNet) -> Result<()> {
        let family = if addr.addr().is_ipv6() { "inet6" } else { "inet" };
        self.run(
            "ifconfig",
            args([&tun.name, family, &addr.addr().to_string(), "-alias"]),
        )
        .map(drop)
    }

    fn add_route(&self, tun: &TunnelHandle, dst: IpNet) -> Result<()> {
        let family = if dst.addr().is_ipv6() { "-inet6" } else { "-inet" };
        self.run(
            "route",
            args(["-q", "-n", "add", family, &dst.to_string(), "-interface", &tun.name]),
        )
        .map(drop)
    }

    fn del_route(&self, tun: &TunnelHandle, dst: IpNet) -> Result<()> {
        let family = if dst.addr().is_ipv6() { "-inet6" } else { "-inet" };
        self.run(
            "route",
            args(["-q", "-n", "delete", family, &dst.to_string(), "-interface", &tun.name]),
        )
        .map(drop)
    }

    fn default_route(&self, v6: bool, exclude: &str) -> Result<Option<Gateway>> {
        let family = if v6 { "-inet6" } else { "-inet" };
        let out = self.runner.run(&CommandLine::new(
            "route",
            ["-n", "get", family, "default"],
        ))?;
        // No default route is an ordinary answer, not a failure.
        Ok(out.success().then(|| parse_route_get(&out.output, exclude)).flatten())
    }

    fn pin_host_route(&self, dst: IpAddr, gateway: &Gateway) -> Result<()> {
        // `route add` refuses to replace; clear any previous pin first.
        if let Err(e) = self.unpin_host_route(dst) {
            tracing::debug!(endpoint = %dst, error = %e, "Stale host route not removed");
        }
        let dst = dst.to_string();
        let argv = match gateway.via {
            Some(via) => args(["-q", "-n", "add", "-host", &dst, &via.to_string()]),
            None => args(["-q", "-n", "add", "-host", &dst, "-interface", &gateway.dev]),
        };
        self.run("route", argv).map(drop)
    }

    fn unpin_host_route(&self, dst: IpAddr) -> Result<()> {
        let dst = dst.to_string();
        let out = self.runner.run(&CommandLine::new(
            "route",
            ["-q", "-n", "delete", "-host", dst.as_str()],
        ))?;
        if out.success() || out.output.contains("not in table") {
            Ok(())
        } else {
            Err(crate::NetError::Command {
                command: format!("route -q -n delete -host {dst}"),
                output: out.output.trim().to_string(),
            })
        }
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}
