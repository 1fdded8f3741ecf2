//! DNS through systemd-resolved's D-Bus API.
//!
//! Per-link configuration is addressed by interface index. `up` issues
//! `SetLinkDNS` then `SetLinkDomains`; `down` issues a single `RevertLink`,
//! which drops both.

use crate::config::DnsConfig;
use crate::dns::DnsApplier;
use crate::error::{NetError, Result};
use crate::util::Interfaces;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// One `(iay)` entry of `SetLinkDNS`: address family and raw address bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(target_os = "linux", derive(zbus::zvariant::Type))]
pub struct LinkNameserver {
    /// `AF_INET` or `AF_INET6`.
    pub family: i32,
    /// 4 or 16 address bytes.
    pub address: Vec<u8>,
}

impl From<IpAddr> for LinkNameserver {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self {
                family: libc::AF_INET,
                address: v4.octets().to_vec(),
            },
            IpAddr::V6(v6) => Self {
                family: libc::AF_INET6,
                address: v6.octets().to_vec(),
            },
        }
    }
}

/// One `(sb)` entry of `SetLinkDomains`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(target_os = "linux", derive(zbus::zvariant::Type))]
pub struct LinkDomain {
    /// Search domain.
    pub domain: String,
    /// `true` restricts the domain to routing lookups; we always send `false`
    /// so it is also used as a search suffix.
    pub routing_only: bool,
}

/// The three `org.freedesktop.resolve1.Manager` methods this crate needs.
///
/// Implementations must bound every call; a hung bus is reported as
/// [`NetError::Timeout`].
pub trait ResolvedBus: Send + Sync {
    /// `SetLinkDNS(ia(iay))`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Bus`] or [`NetError::Timeout`].
    fn set_link_dns(&self, index: i32, servers: &[LinkNameserver]) -> Result<()>;

    /// `SetLinkDomains(ia(sb))`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Bus`] or [`NetError::Timeout`].
    fn set_link_domains(&self, index: i32, domains: &[LinkDomain]) -> Result<()>;

    /// `RevertLink(i)`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Bus`] or [`NetError::Timeout`].
    fn revert_link(&self, index: i32) -> Result<()>;
}

/// Configures the tunnel link in systemd-resolved.
#[derive(Clone)]
pub struct ResolvedApplier {
    bus: Arc<dyn ResolvedBus>,
    interfaces: Arc<dyn Interfaces>,
    interface: String,
}

impl ResolvedApplier {
    /// Creates an applier for the tunnel interface named `interface`.
    #[must_use]
    pub fn new(
        bus: Arc<dyn ResolvedBus>,
        interfaces: Arc<dyn Interfaces>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            interfaces,
            interface: interface.into(),
        }
    }

    fn link_index(&self) -> Result<i32> {
        let index = self
            .interfaces
            .index(&self.interface)?
            .ok_or_else(|| NetError::InterfaceNotReady {
                interface: self.interface.clone(),
            })?;
        i32::try_from(index).map_err(|_| {
            NetError::InvalidConfig(format!("interface index {index} out of range"))
        })
    }
}

impl DnsApplier for ResolvedApplier {
    fn up(&self, config: &DnsConfig) -> Result<()> {
        let index = self.link_index()?;

        let servers: Vec<LinkNameserver> =
            config.nameservers.iter().copied().map(LinkNameserver::from).collect();
        self.bus.set_link_dns(index, &servers)?;

        let domains: Vec<LinkDomain> = config
            .domains
            .iter()
            .map(|domain| LinkDomain {
                domain: domain.clone(),
                routing_only: false,
            })
            .collect();
        self.bus.set_link_domains(index, &domains)?;

        tracing::info!(
            interface = %self.interface,
            index = index,
            nameservers = ?config.nameservers,
            domains = ?config.domains,
            "Configured link DNS in systemd-resolved"
        );
        Ok(())
    }

    fn down(&self) -> Result<()> {
        let index = self.link_index()?;
        self.bus.revert_link(index)?;
        tracing::info!(interface = %self.interface, index = index, "Reverted link DNS");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use system_bus::SystemResolvedBus;

#[cfg(target_os = "linux")]
mod system_bus {
    use super::{LinkDomain, LinkNameserver, ResolvedBus};
    use crate::error::{NetError, Result};
    use std::fmt::Display;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use zbus::proxy;

    /// The `org.freedesktop.resolve1.Manager` methods we call.
    #[proxy(
        default_service = "org.freedesktop.resolve1",
        interface = "org.freedesktop.resolve1.Manager",
        default_path = "/org/freedesktop/resolve1"
    )]
    trait Resolve1Manager {
        #[zbus(name = "SetLinkDNS")]
        fn set_link_dns(&self, ifindex: i32, addresses: &[LinkNameserver]) -> zbus::Result<()>;

        fn set_link_domains(&self, ifindex: i32, domains: &[LinkDomain]) -> zbus::Result<()>;

        fn revert_link(&self, ifindex: i32) -> zbus::Result<()>;
    }

    /// [`ResolvedBus`] over the system D-Bus.
    ///
    /// Each call opens its own connection on a worker thread and is abandoned
    /// after the timeout: bus authentication problems can otherwise hang a
    /// call forever.
    #[derive(Debug, Clone)]
    pub struct SystemResolvedBus {
        timeout: Duration,
    }

    impl SystemResolvedBus {
        /// Creates a bus client whose calls give up after `timeout`.
        #[must_use]
        pub const fn new(timeout: Duration) -> Self {
            Self { timeout }
        }

        fn call<F>(&self, method: &'static str, call: F) -> Result<()>
        where
            F: FnOnce(&Resolve1ManagerProxyBlocking<'_>) -> zbus::Result<()> + Send + 'static,
        {
            bounded(method, self.timeout, move || -> zbus::Result<()> {
                let conn = zbus::blocking::Connection::system()?;
                let proxy = Resolve1ManagerProxyBlocking::new(&conn)?;
                call(&proxy)
            })
        }
    }

    /// Runs `call` on a worker thread and waits at most `timeout` for it.
    fn bounded<F, E>(method: &'static str, timeout: Duration, call: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("resolved-{method}"))
            .spawn(move || {
                let _ = tx.send(call().map_err(|e| e.to_string()));
            })?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(NetError::Bus { method, message }),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(NetError::Timeout {
                operation: method.to_string(),
                timeout,
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(NetError::Bus {
                method,
                message: "bus worker exited without a reply".to_string(),
            }),
        }
    }

    impl ResolvedBus for SystemResolvedBus {
        fn set_link_dns(&self, index: i32, servers: &[LinkNameserver]) -> Result<()> {
            let servers = servers.to_vec();
            self.call("SetLinkDNS", move |p| p.set_link_dns(index, &servers))
        }

        fn set_link_domains(&self, index: i32, domains: &[LinkDomain]) -> Result<()> {
            let domains = domains.to_vec();
            self.call("SetLinkDomains", move |p| p.set_link_domains(index, &domains))
        }

        fn revert_link(&self, index: i32) -> Result<()> {
            self.call("RevertLink", move |p| p.revert_link(index))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::time::Instant;

        #[test]
        fn hung_call_times_out() {
            let started = Instant::now();
            let err = bounded("RevertLink", Duration::from_millis(50), || {
                thread::sleep(Duration::from_secs(2));
                Ok::<(), String>(())
            })
            .unwrap_err();
            assert!(matches!(err, NetError::Timeout { .. }));
            assert!(started.elapsed() < Duration::from_secs(1));
        }

        #[test]
        fn crashed_worker_is_a_bus_error() {
            let call = || -> std::result::Result<(), String> { panic!("connection reset") };
            let err = bounded("SetLinkDNS", Duration::from_secs(5), call).unwrap_err();
            assert!(matches!(err, NetError::Bus { method: "SetLinkDNS", .. }));
        }

        #[test]
        fn failed_call_keeps_message() {
            let err = bounded("SetLinkDomains", Duration::from_secs(5), || {
                Err::<(), _>("Access denied")
            })
            .unwrap_err();
            assert_eq!(err.to_string(), "SetLinkDomains: Access denied");
        }

        #[test]
        fn completed_call_succeeds() {
            bounded("RevertLink", Duration::from_secs(5), || Ok::<(), String>(())).unwrap();
        }
    }
}

/// Stands in for systemd-resolved where it cannot exist.
#[cfg(not(target_os = "linux"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableBus;

#[cfg(not(target_os = "linux"))]
impl ResolvedBus for UnavailableBus {
    fn set_link_dns(&self, _: i32, _: &[LinkNameserver]) -> Result<()> {
        Err(NetError::Unsupported("systemd-resolved"))
    }

    fn set_link_domains(&self, _: i32, _: &[LinkDomain]) -> Result<()> {
        Err(NetError::Unsupported("systemd-resolved"))
    }

    fn revert_link(&self, _: i32) -> Result<()> {
        Err(NetError::Unsupported("systemd-resolved"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Dns(i32, Vec<LinkNameserver>),
        Domains(i32, Vec<LinkDomain>),
        Revert(i32),
    }

    #[derive(Default)]
    struct RecordingBus {
        calls: Mutex<Vec<Call>>,
        fail_domains: bool,
    }

    impl ResolvedBus for RecordingBus {
        fn set_link_dns(&self, index: i32, servers: &[LinkNameserver]) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Dns(index, servers.to_vec()));
            Ok(())
        }

        fn set_link_domains(&self, index: i32, domains: &[LinkDomain]) -> Result<()> {
            if self.fail_domains {
                return Err(NetError::Bus {
                    method: "SetLinkDomains",
                    message: "Access denied".into(),
                });
            }
            self.calls.lock().unwrap().push(Call::Domains(index, domains.to_vec()));
            Ok(())
        }

        fn revert_link(&self, index: i32) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Revert(index));
            Ok(())
        }
    }

    struct OneInterface(Option<u32>);

    impl Interfaces for OneInterface {
        fn index(&self, name: &str) -> Result<Option<u32>> {
            Ok(self.0.filter(|_| name == "tun0"))
        }
    }

    fn applier(bus: &Arc<RecordingBus>, index: Option<u32>) -> ResolvedApplier {
        ResolvedApplier::new(bus.clone(), Arc::new(OneInterface(index)), "tun0")
    }

    #[test]
    fn nameserver_wire_form() {
        let v4 = LinkNameserver::from("100.100.100.100".parse::<IpAddr>().unwrap());
        assert_eq!(v4.family, libc::AF_INET);
        assert_eq!(v4.address, vec![100, 100, 100, 100]);

        let v6 = LinkNameserver::from("fd7a:115c:a1e0::53".parse::<IpAddr>().unwrap());
        assert_eq!(v6.family, libc::AF_INET6);
        assert_eq!(v6.address.len(), 16);
        assert_eq!(v6.address[..2], [0xfd, 0x7a]);
        assert_eq!(v6.address[15], 0x53);
    }

    #[test]
    fn up_sets_servers_then_domains() {
        let bus = Arc::new(RecordingBus::default());
        let config = DnsConfig::new([
            "100.100.100.100".parse::<IpAddr>().unwrap(),
            "fd7a:115c:a1e0::53".parse::<IpAddr>().unwrap(),
        ])
        .with_domains(["corp.example"]);

        applier(&bus, Some(7)).up(&config).unwrap();

        let calls = bus.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        match &calls[0] {
            Call::Dns(7, servers) => {
                assert_eq!(servers[0].family, libc::AF_INET);
                assert_eq!(servers[1].family, libc::AF_INET6);
            }
            other => panic!("unexpected first call {other:?}"),
        }
        assert_eq!(
            calls[1],
            Call::Domains(
                7,
                vec![LinkDomain {
                    domain: "corp.example".into(),
                    routing_only: false
                }]
            )
        );
    }

    #[test]
    fn missing_interface_is_not_ready() {
        let bus = Arc::new(RecordingBus::default());
        let err = applier(&bus, None)
            .up(&DnsConfig::new(["100.100.100.100".parse::<IpAddr>().unwrap()]))
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(bus.calls.lock().unwrap().is_empty());

        assert!(applier(&bus, None).down().unwrap_err().is_retryable());
    }

    #[test]
    fn down_reverts_link_and_is_repeatable() {
        let bus = Arc::new(RecordingBus::default());
        let a = applier(&bus, Some(7));
        a.down().unwrap();
        a.down().unwrap();
        assert_eq!(*bus.calls.lock().unwrap(), vec![Call::Revert(7), Call::Revert(7)]);
    }

    #[test]
    fn bus_failure_is_surfaced() {
        let bus = Arc::new(RecordingBus {
            fail_domains: true,
            ..RecordingBus::default()
        });
        let err = applier(&bus, Some(7))
            .up(&DnsConfig::new(["100.100.100.100".parse::<IpAddr>().unwrap()]))
            .unwrap_err();
        assert_eq!(err.to_string(), "SetLinkDomains: Access denied");
    }
}
