//! One `up`/`down` contract over every DNS backend.
//!
//! The manager detects the owning backend on every call. `down` does not
//! reuse the backend `up` chose: resolvconf may have been installed or
//! removed in between, and the revert has to go where ownership lies now.

use crate::command::CommandRunner;
use crate::config::{DnsConfig, RouterOptions};
use crate::detect::{DnsBackend, Detector, ResolvconfImpl};
use crate::direct::DirectApplier;
use crate::error::Result;
use crate::resolvconf::ResolvconfApplier;
use crate::resolved::{ResolvedApplier, ResolvedBus};
use crate::util::Interfaces;
use std::sync::Arc;

/// Pushes a DNS configuration into one mechanism and takes it back out.
///
/// Both operations are idempotent and bounded in time.
pub trait DnsApplier: Send + Sync {
    /// Applies `config`, overwriting whatever this applier applied before.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure: I/O, command, bus or timeout, or
    /// [`NetError::InterfaceNotReady`](crate::NetError::InterfaceNotReady).
    fn up(&self, config: &DnsConfig) -> Result<()>;

    /// Reverts what `up` applied. Succeeds if nothing is applied.
    ///
    /// # Errors
    ///
    /// Same as [`up`](Self::up).
    fn down(&self) -> Result<()>;
}

/// Host collaborators the manager drives.
#[derive(Clone)]
pub struct DnsHost {
    /// Runs `systemctl` and `resolvconf`.
    pub runner: Arc<dyn CommandRunner>,
    /// Reaches systemd-resolved.
    pub bus: Arc<dyn ResolvedBus>,
    /// Resolves the tunnel's interface index.
    pub interfaces: Arc<dyn Interfaces>,
}

/// Detects the active backend and delegates to its applier.
#[derive(Clone)]
pub struct DnsManager {
    host: DnsHost,
    detector: Detector,
    options: RouterOptions,
    interface: String,
}

impl DnsManager {
    /// Creates a manager for the tunnel interface named `interface`.
    #[must_use]
    pub fn new(host: DnsHost, options: RouterOptions, interface: impl Into<String>) -> Self {
        let detector = Detector::new(host.runner.clone(), options.resolv_conf.clone());
        Self {
            host,
            detector,
            options,
            interface: interface.into(),
        }
    }

    /// The backend that would be used right now.
    #[must_use]
    pub fn backend(&self) -> DnsBackend {
        self.options
            .dns_backend
            .unwrap_or_else(|| self.detector.detect())
    }

    /// Detects the backend and applies `config` through it.
    ///
    /// # Errors
    ///
    /// Returns the selected applier's failure.
    pub fn up(&self, config: &DnsConfig) -> Result<()> {
        let backend = self.backend();
        tracing::info!(backend = %backend, interface = %self.interface, "Applying DNS");
        self.applier(backend).up(config)
    }

    /// Detects the backend afresh and reverts through it.
    ///
    /// # Errors
    ///
    /// Returns the selected applier's failure.
    pub fn down(&self) -> Result<()> {
        let backend = self.backend();
        tracing::info!(backend = %backend, interface = %self.interface, "Reverting DNS");
        self.applier(backend).down()
    }

    /// Applier for `backend`, wired to this manager's host collaborators.
    #[must_use]
    pub fn applier(&self, backend: DnsBackend) -> Box<dyn DnsApplier> {
        match backend {
            DnsBackend::Direct => Box::new(self.direct()),
            DnsBackend::Openresolv => Box::new(self.resolvconf(ResolvconfImpl::Openresolv)),
            DnsBackend::LegacyResolvconf => Box::new(self.resolvconf(ResolvconfImpl::Legacy)),
            DnsBackend::Resolved => Box::new(ResolvedApplier::new(
                self.host.bus.clone(),
                self.host.interfaces.clone(),
                self.interface.clone(),
            )),
        }
    }

    /// The direct applier for the configured resolver file.
    #[must_use]
    pub fn direct(&self) -> DirectApplier {
        DirectApplier::new(self.options.resolv_conf.clone())
    }

    fn resolvconf(&self, implementation: ResolvconfImpl) -> ResolvconfApplier {
        ResolvconfApplier::new(
            self.host.runner.clone(),
            implementation,
            self.options.record_name.clone(),
        )
    }
}
