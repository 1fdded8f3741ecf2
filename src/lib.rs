//! # tun-netcfg
//!
//! Host network configuration for a VPN tunnel: addresses, routes, bypass
//! routes for the tunnel's own transport, and DNS.
//!
//! DNS is pushed into whichever mechanism owns the host's resolver:
//! systemd-resolved over D-Bus, openresolv or legacy `resolvconf`, or the
//! resolver file itself. The owner is detected on every apply and every
//! revert, so a revert lands where ownership lies at that moment.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tun_netcfg::{DnsConfig, RouterConfig, RouterOptions, TunnelHandle, new_router};
//!
//! let options = RouterOptions::from_env()?;
//! let mut router = new_router(TunnelHandle::new("tun0", 9), options)?;
//! router.up()?;
//!
//! router.set(Some(&RouterConfig {
//!     local_addrs: vec!["100.64.0.2/32".parse()?],
//!     routes: vec!["100.64.0.0/10".parse()?],
//!     bypass: vec!["203.0.113.7".parse()?],
//!     dns: DnsConfig::new(["100.100.100.100".parse()?]).with_domains(["corp.example"]),
//!     ..RouterConfig::default()
//! }))?;
//!
//! // Tear down, then stop monitoring.
//! router.set(None)?;
//! router.close()?;
//! ```
//!
//! ## Crash recovery
//!
//! The direct backend stamps the resolver file with the writer's PID. On
//! next startup, [`cleanup`] restores a file whose writer is gone and
//! withdraws DNS from whatever backend now owns it:
//!
//! ```rust,ignore
//! tun_netcfg::cleanup("tun0", &RouterOptions::default());
//! ```
//!
//! ## Permissions
//!
//! Everything that changes the host requires root (or `CAP_NET_ADMIN` plus
//! write access to the resolver file on Linux). The caller is responsible
//! for privilege elevation.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod config;
pub mod detect;
pub mod direct;
pub mod dns;
pub mod error;
pub mod monitor;
pub mod os;
pub mod resolvconf;
pub mod resolved;
pub mod router;
pub mod util;

pub use command::{CommandLine, CommandOutput, CommandRunner, SystemRunner};
pub use config::{DnsConfig, NetfilterMode, RouterConfig, RouterOptions};
pub use detect::{Detector, DnsBackend, ResolvconfImpl};
pub use direct::DirectApplier;
pub use dns::{DnsApplier, DnsHost, DnsManager};
pub use error::{NetError, Result};
pub use monitor::{MonitorHandle, RouteChangeSource, RouteEvents, RouteMonitor, RoutingSocket};
pub use os::{Gateway, NetworkPrimitives, TunnelHandle};
pub use resolvconf::ResolvconfApplier;
pub use resolved::{ResolvedApplier, ResolvedBus};
pub use router::{NoopRouter, Router, SystemRouter, cleanup, new_router};
pub use util::{Interfaces, SystemInterfaces};
