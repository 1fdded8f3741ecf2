//! Reacts to routing-table changes while the tunnel is up.
//!
//! Once the tunnel installs its own default route, the tunnel's transport
//! packets to relays and peers would be captured by it and loop back into
//! the tunnel. The router keeps host routes for those endpoints pinned to the
//! pre-tunnel default route, and this module re-runs that pinning whenever
//! the OS reports a route change.
//!
//! A registration is a [`MonitorHandle`]. Dropping it or calling
//! [`MonitorHandle::unregister`] stops the subscription; once `unregister`
//! returns, the callback is not running and will not run again.

use crate::error::{NetError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Upper bound on how long the worker waits before rechecking for
/// unregistration.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of waiting on a [`RouteChangeSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// At least one route changed.
    Changed,
    /// Nothing happened within the timeout.
    Idle,
    /// The source will never report anything again.
    Closed,
}

/// A stream of "a route changed" notifications. The payload is opaque.
pub trait RouteChangeSource: Send {
    /// Blocks for at most `timeout` waiting for a change. Bursts of changes
    /// are coalesced into one [`Wait::Changed`].
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the underlying notification channel fails.
    fn wait(&mut self, timeout: Duration) -> Result<Wait>;
}

/// Feeds a [`ChannelSource`].
#[derive(Debug, Clone)]
pub struct RouteEvents {
    tx: mpsc::Sender<()>,
}

impl RouteEvents {
    /// Reports a route change. Returns `false` once the monitor is gone.
    #[allow(clippy::must_use_candidate)]
    pub fn notify(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// A [`RouteChangeSource`] fed by hand, for embedders that already receive
/// route notifications some other way.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<()>,
}

/// Creates a connected sender and source.
#[must_use]
pub fn channel() -> (RouteEvents, ChannelSource) {
    let (tx, rx) = mpsc::channel();
    (RouteEvents { tx }, ChannelSource { rx })
}

impl RouteChangeSource for ChannelSource {
    fn wait(&mut self, timeout: Duration) -> Result<Wait> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => {
                while self.rx.try_recv().is_ok() {}
                Ok(Wait::Changed)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(Wait::Idle),
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(Wait::Closed),
        }
    }
}

/// Registers route-change callbacks.
pub struct RouteMonitor;

impl RouteMonitor {
    /// Runs `callback` once now, then again after every change reported by
    /// `source`, until the returned handle is unregistered.
    ///
    /// Failures of later invocations are logged; there is no caller left to
    /// return them to.
    ///
    /// # Errors
    ///
    /// Returns the initial invocation's error, or
    /// [`NetError::MonitorRegistration`] if the worker cannot be started.
    pub fn register<F>(mut source: Box<dyn RouteChangeSource>, callback: F) -> Result<MonitorHandle>
    where
        F: Fn() -> Result<()> + Send + 'static,
    {
        callback()?;

        let gate = Arc::new(Mutex::new(true));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let gate = gate.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("route-monitor".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        match source.wait(POLL_INTERVAL) {
                            Ok(Wait::Changed) => {}
                            Ok(Wait::Idle) => continue,
                            Ok(Wait::Closed) => break,
                            Err(e) => {
                                tracing::warn!(error = %e, "Route change source failed");
                                thread::sleep(POLL_INTERVAL);
                                continue;
                            }
                        }

                        let active = gate.lock().unwrap_or_else(PoisonError::into_inner);
                        if !*active {
                            break;
                        }
                        tracing::debug!("Route table changed, re-asserting bypass routes");
                        if let Err(e) = callback() {
                            tracing::warn!(error = %e, "Route monitor callback failed");
                        }
                    }
                    tracing::debug!("Route monitor worker exiting");
                })
                .map_err(|e| NetError::MonitorRegistration(e.to_string()))?
        };

        tracing::info!("Route monitor registered");
        Ok(MonitorHandle {
            gate,
            stop,
            worker: Some(worker),
        })
    }
}

/// A live route-change subscription.
#[derive(Debug)]
pub struct MonitorHandle {
    gate: Arc<Mutex<bool>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stops the subscription. Safe to call more than once.
    ///
    /// Waits for an in-flight callback to finish; no callback starts after
    /// this returns.
    pub fn unregister(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.stop.store(true, Ordering::Release);

        // From inside the callback this thread already holds the gate; the
        // worker sees `stop` as soon as the callback returns.
        if worker.thread().id() == thread::current().id() {
            tracing::info!("Route monitor unregistered from its callback");
            return;
        }

        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = false;
        let _ = worker.join();
        tracing::info!("Route monitor unregistered");
    }

    /// Returns `true` until [`unregister`](Self::unregister) is called.
    #[must_use]
    pub const fn is_registered(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.unregister();
    }
}

pub use socket::RoutingSocket;

/// Kernel route notifications: `NETLINK_ROUTE` on Linux, `PF_ROUTE` on the
/// BSDs and macOS.
mod socket {
    #[cfg(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    use crate::error::{NetError, Result};

    pub use imp::RoutingSocket;

    /// Waits until `fd` is readable. An interrupted wait counts as a timeout.
    #[cfg(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    fn readable(fd: std::os::fd::RawFd, timeout: std::time::Duration) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        // SAFETY: `pfd` is a single valid pollfd.
        let ready = unsafe { libc::poll(&raw mut pfd, 1, ms) };
        if ready < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(e.into());
        }
        Ok(ready > 0)
    }

    #[cfg(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    fn registration_error(what: &str, e: &std::io::Error) -> NetError {
        NetError::MonitorRegistration(format!("{what}: {e}"))
    }

    #[cfg(target_os = "linux")]
    mod imp {
        use super::{readable, registration_error};
        use crate::error::Result;
        use crate::monitor::{RouteChangeSource, Wait};
        use netlink_sys::protocols::NETLINK_ROUTE;
        use netlink_sys::{Socket, SocketAddr};
        use std::os::fd::AsRawFd;
        use std::time::Duration;

        /// A netlink socket subscribed to IPv4 and IPv6 route changes.
        pub struct RoutingSocket {
            socket: Socket,
        }

        impl RoutingSocket {
            /// Opens a non-blocking `NETLINK_ROUTE` socket bound to the
            /// route multicast groups.
            ///
            /// # Errors
            ///
            /// Returns [`NetError::MonitorRegistration`](crate::NetError::MonitorRegistration)
            /// if the socket cannot be created or bound.
            pub fn open() -> Result<Self> {
                let mut socket = Socket::new(NETLINK_ROUTE)
                    .map_err(|e| registration_error("socket(NETLINK_ROUTE)", &e))?;
                #[allow(clippy::cast_sign_loss)]
                let groups = (libc::RTMGRP_IPV4_ROUTE | libc::RTMGRP_IPV6_ROUTE) as u32;
                socket
                    .bind(&SocketAddr::new(0, groups))
                    .map_err(|e| registration_error("bind(NETLINK_ROUTE)", &e))?;
                socket
                    .set_non_blocking(true)
                    .map_err(|e| registration_error("set_non_blocking", &e))?;
                Ok(Self { socket })
            }
        }

        impl RouteChangeSource for RoutingSocket {
            fn wait(&mut self, timeout: Duration) -> Result<Wait> {
                if !readable(self.socket.as_raw_fd(), timeout)? {
                    return Ok(Wait::Idle);
                }
                // Drain the burst; only the fact that something changed matters.
                let mut buf = vec![0u8; 8192];
                while self
                    .socket
                    .recv(&mut &mut buf[..], 0)
                    .is_ok_and(|n| n > 0)
                {}
                Ok(Wait::Changed)
            }
        }
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    mod imp {
        use super::{readable, registration_error};
        use crate::error::Result;
        use crate::monitor::{RouteChangeSource, Wait};
        use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
        use std::time::Duration;

        /// A `PF_ROUTE` raw socket; it receives every routing message.
        #[derive(Debug)]
        pub struct RoutingSocket {
            fd: OwnedFd,
        }

        impl RoutingSocket {
            /// Opens the routing socket.
            ///
            /// # Errors
            ///
            /// Returns [`NetError::MonitorRegistration`](crate::NetError::MonitorRegistration)
            /// if the socket cannot be created.
            pub fn open() -> Result<Self> {
                // SAFETY: plain socket(2) call; the result is checked below.
                let raw = unsafe { libc::socket(libc::PF_ROUTE, libc::SOCK_RAW, libc::AF_UNSPEC) };
                if raw < 0 {
                    let e = std::io::Error::last_os_error();
                    return Err(registration_error("socket(PF_ROUTE)", &e));
                }
                // SAFETY: `raw` is a freshly created descriptor we exclusively own.
                Ok(Self {
                    fd: unsafe { OwnedFd::from_raw_fd(raw) },
                })
            }
        }

        impl RouteChangeSource for RoutingSocket {
            fn wait(&mut self, timeout: Duration) -> Result<Wait> {
                if !readable(self.fd.as_raw_fd(), timeout)? {
                    return Ok(Wait::Idle);
                }
                let mut buf = [0u8; 8192];
                loop {
                    // SAFETY: `buf` is valid for `buf.len()` bytes.
                    let n = unsafe {
                        libc::recv(
                            self.fd.as_raw_fd(),
                            buf.as_mut_ptr().cast(),
                            buf.len(),
                            libc::MSG_DONTWAIT,
                        )
                    };
                    if n <= 0 {
                        break;
                    }
                }
                Ok(Wait::Changed)
            }
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    )))]
    mod imp {
        use crate::error::{NetError, Result};
        use crate::monitor::{RouteChangeSource, Wait};
        use std::time::Duration;

        /// No routing socket on this platform.
        #[derive(Debug)]
        pub struct RoutingSocket;

        impl RoutingSocket {
            /// # Errors
            ///
            /// Always returns [`NetError::Unsupported`].
            pub const fn open() -> Result<Self> {
                Err(NetError::Unsupported("route change notifications"))
            }
        }

        impl RouteChangeSource for RoutingSocket {
            fn wait(&mut self, _timeout: Duration) -> Result<Wait> {
                Ok(Wait::Closed)
            }
        }
    }
}
