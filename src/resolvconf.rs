//! DNS through the `resolvconf` CLI.
//!
//! The configuration is streamed to `resolvconf -a <record>` in resolver-file
//! syntax. openresolv is asked for metric 0 and exclusive mode, so our record
//! alone decides system DNS. The legacy implementation has neither; queries
//! may still leak to nameservers registered by other interfaces, and fixing
//! that would mean editing their records, which we do not do.

use crate::command::{CommandLine, CommandRunner, run_checked};
use crate::config::DnsConfig;
use crate::detect::ResolvconfImpl;
use crate::dns::DnsApplier;
use crate::error::Result;
use std::sync::Arc;

/// Submits and withdraws a named resolvconf record.
#[derive(Clone)]
pub struct ResolvconfApplier {
    runner: Arc<dyn CommandRunner>,
    implementation: ResolvconfImpl,
    record: String,
}

impl ResolvconfApplier {
    /// Creates an applier for the given implementation and record name.
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        implementation: ResolvconfImpl,
        record: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            implementation,
            record: record.into(),
        }
    }

    fn add_command(&self) -> CommandLine {
        let record = self.record.as_str();
        match self.implementation {
            ResolvconfImpl::Openresolv => {
                CommandLine::new("resolvconf", ["-m", "0", "-x", "-a", record])
            }
            ResolvconfImpl::Legacy => CommandLine::new("resolvconf", ["-a", record]),
        }
    }

    fn delete_command(&self) -> CommandLine {
        let record = self.record.as_str();
        match self.implementation {
            // -f: succeed even if the record does not exist.
            ResolvconfImpl::Openresolv => CommandLine::new("resolvconf", ["-f", "-d", record]),
            // No -f; deleting an absent record already succeeds.
            ResolvconfImpl::Legacy => CommandLine::new("resolvconf", ["-d", record]),
        }
    }
}

impl DnsApplier for ResolvconfApplier {
    fn up(&self, config: &DnsConfig) -> Result<()> {
        let cmd = self.add_command().with_stdin(config.to_resolv_conf());
        run_checked(self.runner.as_ref(), &cmd)?;
        tracing::info!(
            record = %self.record,
            implementation = ?self.implementation,
            nameservers = ?config.nameservers,
            "Submitted resolvconf record"
        );
        Ok(())
    }

    fn down(&self) -> Result<()> {
        run_checked(self.runner.as_ref(), &self.delete_command())?;
        tracing::info!(record = %self.record, "Withdrew resolvconf record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::error::NetError;
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::Mutex;

    /// Emulates a resolvconf that keeps records in memory.
    #[derive(Default)]
    struct FakeResolvconf {
        legacy: bool,
        records: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<CommandLine>>,
    }

    impl CommandRunner for FakeResolvconf {
        fn run(&self, cmd: &CommandLine) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(cmd.clone());
            let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
            let mut records = self.records.lock().unwrap();
            let out = match args.as_slice() {
                [.., "-a", name] => {
                    records.insert((*name).to_string(), cmd.stdin.clone().unwrap_or_default());
                    CommandOutput::new(0, "")
                }
                ["-f", "-d", name] if !self.legacy => {
                    records.remove(*name);
                    CommandOutput::new(0, "")
                }
                ["-d", name] if self.legacy => {
                    records.remove(*name);
                    CommandOutput::new(0, "")
                }
                ["-d", name] => {
                    if records.remove(*name).is_some() {
                        CommandOutput::new(0, "")
                    } else {
                        CommandOutput::new(1, format!("resolvconf: {name}: no such record"))
                    }
                }
                _ => CommandOutput::new(99, "unknown option"),
            };
            Ok(out)
        }

        fn exists(&self, _: &str) -> bool {
            true
        }
    }

    fn applier(fake: &Arc<FakeResolvconf>, implementation: ResolvconfImpl) -> ResolvconfApplier {
        ResolvconfApplier::new(fake.clone(), implementation, "tun-netcfg.inet")
    }

    fn sample() -> DnsConfig {
        DnsConfig::new(["100.100.100.100".parse::<IpAddr>().unwrap()])
            .with_domains(["corp.example"])
    }

    #[test]
    fn openresolv_requests_exclusive_top_priority() {
        let fake = Arc::new(FakeResolvconf::default());
        applier(&fake, ResolvconfImpl::Openresolv).up(&sample()).unwrap();

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls[0].to_string(), "resolvconf -m 0 -x -a tun-netcfg.inet");
        assert_eq!(
            calls[0].stdin.as_deref(),
            Some("nameserver 100.100.100.100\nsearch corp.example\n")
        );
    }

    #[test]
    fn legacy_submits_plain_record() {
        let fake = Arc::new(FakeResolvconf {
            legacy: true,
            ..FakeResolvconf::default()
        });
        applier(&fake, ResolvconfImpl::Legacy).up(&sample()).unwrap();

        assert_eq!(
            fake.calls.lock().unwrap()[0].to_string(),
            "resolvconf -a tun-netcfg.inet"
        );
        assert!(fake.records.lock().unwrap().contains_key("tun-netcfg.inet"));
    }

    #[test]
    fn openresolv_down_forces_and_is_idempotent() {
        let fake = Arc::new(FakeResolvconf::default());
        let a = applier(&fake, ResolvconfImpl::Openresolv);
        a.up(&sample()).unwrap();
        a.down().unwrap();
        a.down().unwrap();

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls[1].to_string(), "resolvconf -f -d tun-netcfg.inet");
        assert!(fake.records.lock().unwrap().is_empty());
    }

    #[test]
    fn legacy_down_without_record_succeeds() {
        let fake = Arc::new(FakeResolvconf {
            legacy: true,
            ..FakeResolvconf::default()
        });
        applier(&fake, ResolvconfImpl::Legacy).down().unwrap();
        assert_eq!(
            fake.calls.lock().unwrap()[0].to_string(),
            "resolvconf -d tun-netcfg.inet"
        );
    }

    #[test]
    fn legacy_down_twice_after_up() {
        let fake = Arc::new(FakeResolvconf {
            legacy: true,
            ..FakeResolvconf::default()
        });
        let a = applier(&fake, ResolvconfImpl::Legacy);
        a.up(&sample()).unwrap();
        a.down().unwrap();
        a.down().unwrap();
    }

    #[test]
    fn failure_carries_command_and_output() {
        // openresolv flags against a tool that only knows the legacy set
        let a = ResolvconfApplier::new(
            Arc::new(FakeResolvconf {
                legacy: true,
                ..FakeResolvconf::default()
            }),
            ResolvconfImpl::Openresolv,
            "tun-netcfg.inet",
        );
        let err = a.down().unwrap_err();
        match err {
            NetError::Command { command, output } => {
                assert_eq!(command, "resolvconf -f -d tun-netcfg.inet");
                assert_eq!(output, "unknown option");
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
