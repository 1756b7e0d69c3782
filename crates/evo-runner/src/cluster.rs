//! Fanning orchestrator runs out onto compute hosts, and keeping an eye on
//! what is running there.
//!
//! Launches are fire-and-forget. The exit code seen here only says whether
//! the session accepted the command; results show up later in the shared
//! data directory.

use std::fmt;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::{Result, RunnerError};
use crate::remote::{RemoteSession, RemoteTransport};

/// A compute host. `weight` is its relative capacity (roughly, cores).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub domain_suffix: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl Host {
    pub fn new(name: impl Into<String>, domain_suffix: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            domain_suffix: domain_suffix.into(),
            weight,
        }
    }

    pub fn address(&self) -> String {
        format!("{}{}", self.name, self.domain_suffix)
    }
}

/// Highest capacity first; equal weights keep their configured order.
pub fn by_capacity(hosts: &[Host]) -> Vec<&Host> {
    let mut ordered: Vec<&Host> = hosts.iter().collect();
    ordered.sort_by(|a, b| b.weight.cmp(&a.weight));
    ordered
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HostOutcome {
    Launched { launched: u32, failed: u32 },
    Surveyed { simulators: usize, evolutions: usize },
    Terminated { signalled: Vec<String> },
    Unreachable { reason: String },
}

impl HostOutcome {
    /// The binary forks two `evolution` processes per simulator.
    pub fn broken_chain(&self) -> bool {
        match self {
            HostOutcome::Surveyed {
                simulators,
                evolutions,
            } => *evolutions != 2 * *simulators,
            _ => false,
        }
    }
}

impl fmt::Display for HostOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostOutcome::Launched { failed: 0, .. } => f.write_str("SUCCESS. DONE."),
            HostOutcome::Launched { launched, failed } => write!(
                f,
                "SUCCESS. {} of {} launches FAILED.",
                failed,
                launched + failed
            ),
            HostOutcome::Surveyed { simulators, .. } => {
                write!(f, "{}", simulators)?;
                if self.broken_chain() {
                    f.write_str(" WARNING: broken process chain.")?;
                }
                Ok(())
            }
            HostOutcome::Terminated { .. } => f.write_str("DONE."),
            HostOutcome::Unreachable { reason } => write!(f, "FAILED. {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostReport {
    pub host: String,
    #[serde(flatten)]
    pub outcome: HostOutcome,
}

impl fmt::Display for HostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " > {}: {}", self.host, self.outcome)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterReport {
    pub hosts: Vec<HostReport>,
    pub cancelled: bool,
}

impl ClusterReport {
    pub fn unreachable(&self) -> usize {
        self.hosts
            .iter()
            .filter(|r| matches!(r.outcome, HostOutcome::Unreachable { .. }))
            .count()
    }

    pub fn total_simulators(&self) -> usize {
        self.hosts
            .iter()
            .map(|r| match r.outcome {
                HostOutcome::Surveyed { simulators, .. } => simulators,
                _ => 0,
            })
            .sum()
    }
}

pub const SIMULATOR_PROCESS: &str = "simloid";
pub const EVOLUTION_PROCESS: &str = "evolution";

pub struct ClusterDistributor<T> {
    transport: T,
    connect_timeout: Duration,
    cancel: CancelToken,
}

impl<T: RemoteTransport> ClusterDistributor<T> {
    pub fn new(transport: T, connect_timeout: Duration) -> Self {
        Self {
            transport,
            connect_timeout,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Visits hosts in capacity order, opening one session per host. An
    /// unreachable host is recorded and skipped.
    fn each_host<F>(&self, hosts: &[Host], mut visit: F) -> ClusterReport
    where
        F: FnMut(&str, &mut dyn RemoteSession) -> HostOutcome,
    {
        let mut report = ClusterReport::default();
        for host in by_capacity(hosts) {
            if self.cancel.is_cancelled() {
                tracing::warn!("cluster operation interrupted");
                report.cancelled = true;
                break;
            }
            let address = host.address();
            let outcome = match self.transport.connect(&address, self.connect_timeout) {
                Ok(mut session) => {
                    tracing::info!(host = %address, "connected");
                    let outcome = visit(&address, session.as_mut());
                    session.close();
                    outcome
                }
                Err(err) => {
                    tracing::warn!(host = %address, "{}", err);
                    let reason = match err {
                        RunnerError::HostUnreachable { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    HostOutcome::Unreachable { reason }
                }
            };
            report.hosts.push(HostReport {
                host: address,
                outcome,
            });
        }
        report
    }

    /// Issues `command` `instances_per_host` times on every host, pausing
    /// `pacing` after each launch.
    pub fn launch(
        &self,
        hosts: &[Host],
        command: &str,
        instances_per_host: u32,
        pacing: Duration,
    ) -> ClusterReport {
        self.each_host(hosts, |address, session| {
            let mut launched = 0;
            let mut failed = 0;
            for instance in 0..instances_per_host {
                if self.cancel.is_cancelled() {
                    break;
                }
                match session.exec(command) {
                    Ok(out) if out.exit_code == 0 => launched += 1,
                    Ok(out) => {
                        tracing::warn!(
                            host = address,
                            instance,
                            exit_code = out.exit_code,
                            stderr = %out.stderr.trim(),
                            "launch rejected"
                        );
                        failed += 1;
                    }
                    Err(err) => {
                        tracing::warn!(host = address, instance, "launch failed: {}", err);
                        failed += 1;
                    }
                }
                if !pacing.is_zero() {
                    thread::sleep(pacing);
                }
            }
            HostOutcome::Launched { launched, failed }
        })
    }

    /// Counts simulator and evolution processes on every host.
    pub fn survey(&self, hosts: &[Host]) -> ClusterReport {
        let report = self.each_host(hosts, |address, session| {
            let counted = count_processes(session, SIMULATOR_PROCESS).and_then(|simulators| {
                Ok(HostOutcome::Surveyed {
                    simulators,
                    evolutions: count_processes(session, EVOLUTION_PROCESS)?,
                })
            });
            counted.unwrap_or_else(|err| {
                tracing::warn!(host = address, "survey failed: {}", err);
                HostOutcome::Unreachable {
                    reason: err.to_string(),
                }
            })
        });
        for host in &report.hosts {
            if host.outcome.broken_chain() {
                tracing::warn!(host = %host.host, "broken process chain");
            }
        }
        report
    }

    /// `pkill -f -9` every name in `process_names` on every host.
    pub fn terminate(&self, hosts: &[Host], process_names: &[String]) -> ClusterReport {
        self.each_host(hosts, |address, session| {
            let mut signalled = Vec::new();
            for name in process_names {
                match session.exec(&format!("pkill -f -9 {}", name)) {
                    // pkill exits 1 when nothing matched
                    Ok(out) if out.exit_code == 0 => signalled.push(name.clone()),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(host = address, process = %name, "{}", err),
                }
            }
            tracing::info!(host = address, ?signalled, "terminated");
            HostOutcome::Terminated { signalled }
        })
    }
}

fn count_processes(session: &mut dyn RemoteSession, name: &str) -> Result<usize> {
    let out = session.exec(&format!("ps -e | grep -c '{}'", name))?;
    let count = out.stdout.trim().parse().unwrap_or_else(|_| {
        tracing::warn!(process = name, output = %out.stdout.trim(), "unexpected process count");
        0
    });
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ExecOutput;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<(String, String)>>>;

    /// Hosts absent from `replies` refuse connections.
    #[derive(Default)]
    struct FakeTransport {
        replies: HashMap<String, HashMap<String, ExecOutput>>,
        connects: RefCell<Vec<String>>,
        log: Log,
    }

    impl FakeTransport {
        fn reachable(mut self, address: &str, replies: &[(&str, &str, i32)]) -> Self {
            let map = replies
                .iter()
                .map(|(cmd, stdout, exit_code)| {
                    (
                        cmd.to_string(),
                        ExecOutput {
                            stdout: stdout.to_string(),
                            stderr: String::new(),
                            exit_code: *exit_code,
                        },
                    )
                })
                .collect();
            self.replies.insert(address.to_string(), map);
            self
        }

        fn commands(&self) -> Vec<(String, String)> {
            self.log.borrow().clone()
        }
    }

    struct FakeSession {
        address: String,
        replies: HashMap<String, ExecOutput>,
        log: Log,
    }

    impl RemoteSession for FakeSession {
        fn exec(&mut self, command: &str) -> Result<ExecOutput> {
            self.log
                .borrow_mut()
                .push((self.address.clone(), command.to_string()));
            Ok(self.replies.get(command).cloned().unwrap_or_default())
        }
    }

    impl RemoteTransport for FakeTransport {
        fn connect(&self, address: &str, _timeout: Duration) -> Result<Box<dyn RemoteSession>> {
            self.connects.borrow_mut().push(address.to_string());
            match self.replies.get(address) {
                Some(replies) => Ok(Box::new(FakeSession {
                    address: address.to_string(),
                    replies: replies.clone(),
                    log: Rc::clone(&self.log),
                })),
                None => Err(RunnerError::HostUnreachable {
                    host: address.to_string(),
                    reason: "connection timed out".to_string(),
                }),
            }
        }
    }

    fn hosts() -> Vec<Host> {
        vec![
            Host::new("gruenau2", ".hu", 16),
            Host::new("gruenau5", ".hu", 120),
            Host::new("gruenau7", ".hu", 64),
        ]
    }

    #[test]
    fn hosts_are_ordered_by_descending_weight() {
        let hosts = hosts();
        let names: Vec<&str> = by_capacity(&hosts).iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["gruenau5", "gruenau7", "gruenau2"]);
    }

    #[test]
    fn one_unreachable_host_does_not_stop_the_launch() {
        let transport = FakeTransport::default()
            .reachable("gruenau5.hu", &[])
            .reachable("gruenau2.hu", &[]);
        let distributor = ClusterDistributor::new(transport, Duration::from_secs(10));
        let report = distributor.launch(&hosts(), "start", 2, Duration::ZERO);

        assert_eq!(report.unreachable(), 1);
        assert_eq!(report.hosts.len(), 3);
        assert_eq!(
            *distributor.transport.connects.borrow(),
            vec!["gruenau5.hu", "gruenau7.hu", "gruenau2.hu"]
        );
        let launches: Vec<String> = distributor
            .transport
            .commands()
            .into_iter()
            .map(|(host, _)| host)
            .collect();
        assert_eq!(
            launches,
            vec!["gruenau5.hu", "gruenau5.hu", "gruenau2.hu", "gruenau2.hu"]
        );
        assert_eq!(report.hosts[0].to_string(), " > gruenau5.hu: SUCCESS. DONE.");
        assert_eq!(
            report.hosts[1].to_string(),
            " > gruenau7.hu: FAILED. connection timed out"
        );
    }

    #[test]
    fn rejected_launches_are_counted_not_raised() {
        let transport = FakeTransport::default().reachable("a", &[("start", "", 1)]);
        let distributor = ClusterDistributor::new(transport, Duration::from_secs(1));
        let report = distributor.launch(&[Host::new("a", "", 1)], "start", 3, Duration::ZERO);
        assert_eq!(
            report.hosts[0].outcome,
            HostOutcome::Launched {
                launched: 0,
                failed: 3
            }
        );
        assert_eq!(report.hosts[0].outcome.to_string(), "SUCCESS. 3 of 3 launches FAILED.");
    }

    #[test]
    fn survey_flags_broken_process_chain() {
        let transport = FakeTransport::default()
            .reachable(
                "a",
                &[
                    ("ps -e | grep -c 'simloid'", "3\n", 0),
                    ("ps -e | grep -c 'evolution'", "6\n", 0),
                ],
            )
            .reachable(
                "b",
                &[
                    ("ps -e | grep -c 'simloid'", "2\n", 0),
                    ("ps -e | grep -c 'evolution'", "3\n", 0),
                ],
            );
        let distributor = ClusterDistributor::new(transport, Duration::from_secs(1));
        let report = distributor.survey(&[Host::new("a", "", 2), Host::new("b", "", 1)]);
        assert!(!report.hosts[0].outcome.broken_chain());
        assert!(report.hosts[1].outcome.broken_chain());
        assert_eq!(report.hosts[1].to_string(), " > b: 2 WARNING: broken process chain.");
        assert_eq!(report.total_simulators(), 5);
    }

    #[test]
    fn terminate_signals_each_process_name() {
        let transport = FakeTransport::default().reachable(
            "a",
            &[("pkill -f -9 simloid", "", 0), ("pkill -f -9 evo", "", 1)],
        );
        let distributor = ClusterDistributor::new(transport, Duration::from_secs(1));
        let names = vec!["evo".to_string(), "simloid".to_string()];
        let report = distributor.terminate(&[Host::new("a", "", 1)], &names);
        assert_eq!(
            report.hosts[0].outcome,
            HostOutcome::Terminated {
                signalled: vec!["simloid".to_string()]
            }
        );
        assert_eq!(distributor.transport.commands().len(), 2);
    }

    #[test]
    fn cancelled_distributor_contacts_no_host() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let transport = FakeTransport::default().reachable("gruenau5.hu", &[]);
        let distributor =
            ClusterDistributor::new(transport, Duration::from_secs(1)).with_cancel(cancel);
        let report = distributor.launch(&hosts(), "start", 1, Duration::ZERO);
        assert!(report.cancelled);
        assert!(report.hosts.is_empty());
        assert!(distributor.transport.connects.borrow().is_empty());
    }
}
