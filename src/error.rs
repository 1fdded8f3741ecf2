//! Error types.

use std::time::Duration;
use thiserror::Error;

/// Result alias for network configuration operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors returned by DNS appliers, the route monitor and the router.
#[derive(Debug, Error)]
pub enum NetError {
    /// Filesystem or socket I/O failed (typically `PermissionDenied` on
    /// `/etc/resolv.conf`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The tunnel interface is not visible to the OS yet. Retry after a
    /// backoff.
    #[error("interface not ready: {interface}")]
    InterfaceNotReady {
        /// Name of the tunnel interface that could not be found.
        interface: String,
    },

    /// An external command exited unsuccessfully.
    #[error("running {command}: {output}")]
    Command {
        /// The command line that was run.
        command: String,
        /// Combined stdout and stderr of the command.
        output: String,
    },

    /// A bounded operation did not finish in time and was cancelled.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// A D-Bus call failed.
    #[error("{method}: {message}")]
    Bus {
        /// The remote method, e.g. `SetLinkDNS`.
        method: &'static str,
        /// The failure reported by the bus library or the peer.
        message: String,
    },

    /// The route-change notification could not be armed.
    #[error("registering route monitor: {0}")]
    MonitorRegistration(String),

    /// Invalid configuration values.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The router was already closed.
    #[error("router is closed")]
    Closed,

    /// No router implementation exists for this platform.
    #[error("unsupported platform: {0}")]
    Unsupported(&'static str),
}

impl NetError {
    /// Returns `true` if the underlying I/O error is `PermissionDenied`.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied)
    }

    /// Returns `true` for transient failures the caller should retry, such as
    /// the tunnel interface not having appeared yet.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::InterfaceNotReady { .. })
    }
}
