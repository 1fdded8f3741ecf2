//! Configuration values: what to apply, and how to reach the host.

use crate::detect::DnsBackend;
use crate::error::{NetError, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default resolver file.
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Name of the record submitted to resolvconf.
///
/// The `tun` prefix matches the `tun*` rule of the legacy implementation's
/// interface-order, which places the record ahead of physical interfaces.
pub const DEFAULT_RECORD_NAME: &str = "tun-netcfg.inet";

/// Bound on every subprocess and bus round-trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Nameservers and search domains for the tunnel.
///
/// # Example
///
/// ```
/// use tun_netcfg::DnsConfig;
///
/// let config = DnsConfig::new(["100.100.100.100".parse::<std::net::IpAddr>().unwrap()])
///     .with_domains(["corp.example"]);
///
/// assert_eq!(
///     config.to_resolv_conf(),
///     "nameserver 100.100.100.100\nsearch corp.example\n"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Nameservers, in preference order.
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,

    /// Search domains, in order.
    #[serde(default)]
    pub domains: Vec<String>,
}

impl DnsConfig {
    /// Creates a config with the given nameservers and no search domains.
    #[must_use]
    pub fn new(nameservers: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            nameservers: nameservers.into_iter().collect(),
            domains: Vec::new(),
        }
    }

    /// Replaces the search domains.
    #[must_use]
    pub fn with_domains<S: Into<String>>(mut self, domains: impl IntoIterator<Item = S>) -> Self {
        self.domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Returns `true` if there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty() && self.domains.is_empty()
    }

    /// Parses resolver-file syntax.
    ///
    /// `nameserver` lines with an unparseable address are skipped, later
    /// `search` lines replace earlier ones, and `#`/`;` lines are comments.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut config = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    if let Some(ip) = fields.next().and_then(|f| f.parse().ok()) {
                        config.nameservers.push(ip);
                    }
                }
                Some("search") => {
                    config.domains = fields.map(str::to_string).collect();
                }
                _ => {}
            }
        }
        config
    }

    /// Renders resolver-file syntax: one `nameserver` line per server and a
    /// single `search` line when there are domains.
    #[must_use]
    pub fn to_resolv_conf(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for ns in &self.nameservers {
            let _ = writeln!(out, "nameserver {ns}");
        }
        if !self.domains.is_empty() {
            let _ = writeln!(out, "search {}", self.domains.join(" "));
        }
        out
    }
}

/// How much the host firewall should be managed for the tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetfilterMode {
    /// Leave the firewall alone.
    #[default]
    Off,
    /// Install rules but do not divert traffic into them.
    NoDivert,
    /// Install and divert.
    On,
}

impl fmt::Display for NetfilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::NoDivert => "nodivert",
            Self::On => "on",
        })
    }
}

impl FromStr for NetfilterMode {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(Self::Off),
            "nodivert" => Ok(Self::NoDivert),
            "on" => Ok(Self::On),
            other => Err(NetError::InvalidConfig(format!(
                "unknown netfilter mode {other:?}"
            ))),
        }
    }
}

/// Desired state of the tunnel interface, produced by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Addresses assigned to the tunnel interface.
    #[serde(default)]
    pub local_addrs: Vec<IpNet>,

    /// Prefixes routed into the tunnel.
    #[serde(default)]
    pub routes: Vec<IpNet>,

    /// Relay and peer endpoints that must keep using the pre-tunnel default
    /// route.
    #[serde(default)]
    pub bypass: Vec<IpAddr>,

    /// DNS to apply while the tunnel is up.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Firewall management intent.
    #[serde(default)]
    pub netfilter_mode: NetfilterMode,
}

impl RouterConfig {
    /// The configuration applied when the caller passes `None`: no
    /// addresses, no routes, no bypass endpoints, no DNS.
    #[must_use]
    pub fn shutdown() -> Self {
        Self::default()
    }
}

/// Host-side knobs: file locations, timeouts and overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterOptions {
    /// Resolver file read by detection and written in direct mode.
    pub resolv_conf: PathBuf,

    /// Deadline for each external command.
    pub command_timeout: Duration,

    /// Deadline for each bus call.
    pub bus_timeout: Duration,

    /// Record name submitted to resolvconf.
    pub record_name: String,

    /// Pins a DNS backend and skips detection.
    pub dns_backend: Option<DnsBackend>,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            resolv_conf: PathBuf::from(DEFAULT_RESOLV_CONF),
            command_timeout: DEFAULT_TIMEOUT,
            bus_timeout: DEFAULT_TIMEOUT,
            record_name: DEFAULT_RECORD_NAME.to_string(),
            dns_backend: None,
        }
    }
}

impl RouterOptions {
    /// Environment variable pinning the DNS backend.
    pub const ENV_DNS_BACKEND: &'static str = "TUN_NETCFG_DNS_BACKEND";
    /// Environment variable overriding the resolver file path.
    pub const ENV_RESOLV_CONF: &'static str = "TUN_NETCFG_RESOLV_CONF";
    /// Environment variable overriding both timeouts, in milliseconds.
    pub const ENV_TIMEOUT_MS: &'static str = "TUN_NETCFG_TIMEOUT_MS";

    /// Reads overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::InvalidConfig`] if a variable is set to an
    /// unparseable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`, starting from the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::InvalidConfig`] if a value cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();
        if let Some(backend) = lookup(Self::ENV_DNS_BACKEND) {
            options.dns_backend = Some(backend.parse()?);
        }
        if let Some(path) = lookup(Self::ENV_RESOLV_CONF) {
            options.resolv_conf = PathBuf::from(path);
        }
        if let Some(ms) = lookup(Self::ENV_TIMEOUT_MS) {
            let ms: u64 = ms.parse().map_err(|_| {
                NetError::InvalidConfig(format!("{}: not a number: {ms:?}", Self::ENV_TIMEOUT_MS))
            })?;
            options.command_timeout = Duration::from_millis(ms);
            options.bus_timeout = Duration::from_millis(ms);
        }
        Ok(options)
    }

    /// Overrides the resolver file path (useful for testing).
    #[must_use]
    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    /// Overrides the resolvconf record name.
    #[must_use]
    pub fn with_record_name(mut self, name: impl Into<String>) -> Self {
        self.record_name = name.into();
        self
    }

    /// Pins the DNS backend.
    #[must_use]
    pub const fn with_dns_backend(mut self, backend: DnsBackend) -> Self {
        self.dns_backend = Some(backend);
        self
    }

    /// Sets the command and bus deadlines.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self.bus_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parse_reads_nameservers_and_search() {
        let c = DnsConfig::parse(
            "# Generated by resolvconf\n; old-style comment\nnameserver 10.0.0.1\nnameserver fd7a::53\nnameserver bogus\nsearch a.example b.example\noptions edns0\n",
        );
        assert_eq!(
            c.nameservers,
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "fd7a::53".parse::<IpAddr>().unwrap()
            ]
        );
        assert_eq!(c.domains, vec!["a.example", "b.example"]);
    }

    #[test]
    fn render_omits_empty_search() {
        let c = DnsConfig::new(["1.1.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(c.to_resolv_conf(), "nameserver 1.1.1.1\n");
        assert_eq!(DnsConfig::default().to_resolv_conf(), "");
    }

    #[test]
    fn rendered_content_parses_back() {
        let c = DnsConfig::new([
            "100.100.100.100".parse::<IpAddr>().unwrap(),
            "fd7a:115c::53".parse::<IpAddr>().unwrap(),
        ])
        .with_domains(["ts.example", "corp.example"]);
        assert_eq!(DnsConfig::parse(&c.to_resolv_conf()), c);
    }

    #[test]
    fn shutdown_is_empty() {
        let s = RouterConfig::shutdown();
        assert!(s.dns.is_empty());
        assert!(s.routes.is_empty() && s.local_addrs.is_empty() && s.bypass.is_empty());
        assert_eq!(s.netfilter_mode, NetfilterMode::Off);
    }

    #[test]
    fn netfilter_mode_text_forms() {
        for mode in [NetfilterMode::Off, NetfilterMode::NoDivert, NetfilterMode::On] {
            assert_eq!(mode.to_string().parse::<NetfilterMode>().unwrap(), mode);
        }
        assert!("divert".parse::<NetfilterMode>().is_err());
    }

    #[test]
    fn router_config_deserializes_with_defaults() {
        let c: RouterConfig = serde_json::from_str(
            r#"{"local_addrs":["100.64.0.2/32"],"dns":{"nameservers":["100.100.100.100"]},"netfilter_mode":"nodivert"}"#,
        )
        .unwrap();
        assert_eq!(c.local_addrs, vec!["100.64.0.2/32".parse::<IpNet>().unwrap()]);
        assert!(c.routes.is_empty());
        assert!(c.dns.domains.is_empty());
        assert_eq!(c.netfilter_mode, NetfilterMode::NoDivert);
    }

    #[test]
    fn options_from_lookup() {
        let env: HashMap<&str, &str> = [
            (RouterOptions::ENV_DNS_BACKEND, "resolvconf-legacy"),
            (RouterOptions::ENV_RESOLV_CONF, "/tmp/resolv.conf"),
            (RouterOptions::ENV_TIMEOUT_MS, "250"),
        ]
        .into_iter()
        .collect();
        let o = RouterOptions::from_lookup(|k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(o.dns_backend, Some(DnsBackend::LegacyResolvconf));
        assert_eq!(o.resolv_conf, PathBuf::from("/tmp/resolv.conf"));
        assert_eq!(o.command_timeout, Duration::from_millis(250));
        assert_eq!(o.bus_timeout, Duration::from_millis(250));
    }

    #[test]
    fn options_from_empty_lookup_are_defaults() {
        assert_eq!(RouterOptions::from_lookup(|_| None).unwrap(), RouterOptions::default());
    }

    #[test]
    fn options_reject_bad_values() {
        let bad_timeout = RouterOptions::from_lookup(|k| {
            (k == RouterOptions::ENV_TIMEOUT_MS).then(|| "soon".into())
        });
        assert!(bad_timeout.is_err());
        let bad_backend = RouterOptions::from_lookup(|k| {
            (k == RouterOptions::ENV_DNS_BACKEND).then(|| "nscd".into())
        });
        assert!(bad_backend.is_err());
    }
}
