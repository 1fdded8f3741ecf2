//! Discovers which mechanism currently owns the system resolver.
//!
//! Ownership is proven by evidence in the live resolver file, not by the
//! mere presence of a binary: resolvconf may be installed but unused, and the
//! `resolvconf` shim shipped with systemd-resolved does not honor exclusive
//! mode. Each call takes a fresh snapshot; two calls may disagree if another
//! program changed ownership in between.

use crate::command::{CommandLine, CommandRunner};
use crate::config::DnsConfig;
use crate::error::NetError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Address of the systemd-resolved stub listener. Hard-coded in resolved.
pub const RESOLVED_STUB: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 53));

/// Exit status the legacy resolvconf uses for unknown flags.
const LEGACY_UNKNOWN_FLAG_EXIT: i32 = 99;

/// The DNS control mechanisms this crate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsBackend {
    /// Edit the resolver file directly.
    Direct,
    /// openresolv: supports exclusive mode and interface metrics.
    Openresolv,
    /// The Debian/Ubuntu `resolvconf` package: no exclusive mode, no metrics.
    LegacyResolvconf,
    /// systemd-resolved, driven over D-Bus.
    Resolved,
}

impl DnsBackend {
    /// Textual form used in logs and overrides.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Openresolv => "resolvconf-openresolv",
            Self::LegacyResolvconf => "resolvconf-legacy",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for DnsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DnsBackend {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Direct,
            Self::Openresolv,
            Self::LegacyResolvconf,
            Self::Resolved,
        ]
        .into_iter()
        .find(|b| b.as_str() == s)
        .ok_or_else(|| NetError::InvalidConfig(format!("unknown DNS backend {s:?}")))
    }
}

/// Implementation of the `resolvconf` CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvconfImpl {
    /// openresolv.
    Openresolv,
    /// The legacy Debian implementation.
    Legacy,
}

impl From<ResolvconfImpl> for DnsBackend {
    fn from(imp: ResolvconfImpl) -> Self {
        match imp {
            ResolvconfImpl::Openresolv => Self::Openresolv,
            ResolvconfImpl::Legacy => Self::LegacyResolvconf,
        }
    }
}

/// Inspects the host to pick a [`DnsBackend`].
#[derive(Clone)]
pub struct Detector {
    runner: Arc<dyn CommandRunner>,
    resolv_conf: PathBuf,
}

impl Detector {
    /// Creates a detector reading `resolv_conf` and probing through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, resolv_conf: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            resolv_conf: resolv_conf.into(),
        }
    }

    /// Picks the backend that owns the resolver right now.
    ///
    /// Never fails: without stronger evidence the answer is
    /// [`DnsBackend::Direct`].
    #[must_use]
    pub fn detect(&self) -> DnsBackend {
        let content = std::fs::read_to_string(&self.resolv_conf).ok();

        let backend = if self.resolved_is_active(content.as_deref()) {
            DnsBackend::Resolved
        } else if self.resolvconf_is_active(content.as_deref()) {
            resolvconf_implementation(self.runner.as_ref()).into()
        } else {
            DnsBackend::Direct
        };

        tracing::debug!(
            backend = %backend,
            path = %self.resolv_conf.display(),
            "Detected DNS backend"
        );
        backend
    }

    /// resolved owns DNS only if its stub is the sole nameserver. Otherwise
    /// the file concatenates the servers of every link claiming `~.`,
    /// including the one with the default route, and queries could be
    /// answered (or NXDOMAINed) before reaching the tunnel.
    fn resolved_is_active(&self, content: Option<&str>) -> bool {
        if !self.runner.exists("systemctl") {
            return false;
        }
        let is_active = CommandLine::new("systemctl", ["is-active", "systemd-resolved"]);
        if !self.runner.run(&is_active).is_ok_and(|o| o.success()) {
            return false;
        }
        content.is_some_and(|c| DnsConfig::parse(c).nameservers == [RESOLVED_STUB])
    }

    fn resolvconf_is_active(&self, content: Option<&str>) -> bool {
        self.runner.exists("resolvconf") && content.is_some_and(generated_by_resolvconf)
    }
}

/// Returns `true` if the comment block heading the file mentions resolvconf.
///
/// Scanning stops at the first non-empty line that is not a `#` comment.
#[must_use]
pub fn generated_by_resolvconf(content: &str) -> bool {
    for line in content.lines() {
        if !line.is_empty() && !line.starts_with('#') {
            return false;
        }
        if line.contains("resolvconf") {
            return true;
        }
    }
    false
}

/// Tells the resolvconf implementations apart by passing an unsupported flag.
///
/// The legacy implementation answers an unknown flag with exit status 99;
/// anything else, including a failure to run at all, means openresolv.
#[must_use]
pub fn resolvconf_implementation(runner: &dyn CommandRunner) -> ResolvconfImpl {
    match runner.run(&CommandLine::new("resolvconf", ["-v"])) {
        Ok(out) if out.code == Some(LEGACY_UNKNOWN_FLAG_EXIT) => ResolvconfImpl::Legacy,
        _ => ResolvconfImpl::Openresolv,
    }
}
