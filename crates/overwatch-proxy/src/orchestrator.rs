//! Orchestrator: lifecycle of N proxy cores from one configuration.
//!
//! Owns the shared singletons (policy engine, session cache, audit sink,
//! shadowing detector, approval handler) and hands them to each core by
//! reference. Cores start concurrently; one server failing to spawn does not
//! stop the rest — it is logged and dropped from the active set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use overwatch_types::config::{OverwatchConfig, ServerConfig, ValidationIssue};
use overwatch_types::records::ProxyStats;
use overwatch_types::traits::ProxyTransport;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::proxy::{ProxyCommand, ProxyCore, ProxyCoreConfig, ProxyCounters, ProxyDeps};

/// Produces the client-side transport for a named server. In production this
/// is the process stdio or an accepted connection; tests substitute channel
/// mocks.
pub type ClientTransportFactory =
    Arc<dyn Fn(&str) -> Box<dyn ProxyTransport> + Send + Sync>;

struct CoreHandle {
    commands: mpsc::Sender<ProxyCommand>,
    counters: Arc<ProxyCounters>,
    task: JoinHandle<()>,
}

pub struct Orchestrator {
    config: OverwatchConfig,
    deps: ProxyDeps,
    client_factory: ClientTransportFactory,
    cores: HashMap<String, CoreHandle>,
}

impl Orchestrator {
    /// Validate the configuration, apply it to the policy engine, and build
    /// an orchestrator with no cores running yet.
    pub fn new(
        config: OverwatchConfig,
        deps: ProxyDeps,
        client_factory: ClientTransportFactory,
    ) -> Result<Self, Vec<ValidationIssue>> {
        deps.policy.load(&config)?;
        Ok(Self {
            config,
            deps,
            client_factory,
            cores: HashMap::new(),
        })
    }

    /// Start every configured server concurrently. Returns the names that
    /// came up; failed servers are logged and skipped.
    pub async fn start(&mut self) -> Vec<String> {
        let names: Vec<String> = self
            .config
            .servers
            .keys()
            .filter(|name| !self.cores.contains_key(*name))
            .cloned()
            .collect();

        let mut set = JoinSet::new();
        for name in names {
            let Some(server) = self.config.servers.get(&name).cloned() else {
                continue;
            };
            let config = core_config(&name, &server, &self.config);
            let deps = self.deps.clone();
            let factory = self.client_factory.clone();
            set.spawn(async move {
                let client = factory(&name);
                let mut core = ProxyCore::new(config, client, deps);
                match core.start_upstream().await {
                    Ok(()) => Ok((name, core)),
                    Err(e) => Err((name, e)),
                }
            });
        }

        let mut started = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok((name, core))) => {
                    info!(server = %name, "proxy core started");
                    self.adopt(name.clone(), core);
                    started.push(name);
                }
                Ok(Err((name, e))) => {
                    error!(server = %name, error = %e, "proxy core failed to start, skipping");
                }
                Err(e) => {
                    error!(error = %e, "proxy start task panicked");
                }
            }
        }
        started.sort();
        started
    }

    /// Start one configured server.
    pub async fn start_single(&mut self, name: &str) -> Result<(), overwatch_types::OverwatchError> {
        if self.cores.contains_key(name) {
            return Err(overwatch_types::OverwatchError::Config(format!(
                "server '{name}' is already running"
            )));
        }
        let server = self.config.servers.get(name).cloned().ok_or_else(|| {
            overwatch_types::OverwatchError::Config(format!("server '{name}' is not configured"))
        })?;

        let config = core_config(name, &server, &self.config);
        let client = (self.client_factory)(name);
        let mut core = ProxyCore::new(config, client, self.deps.clone());
        core.start_upstream().await?;
        info!(server = name, "proxy core started");
        self.adopt(name.to_string(), core);
        Ok(())
    }

    fn adopt(&mut self, name: String, core: ProxyCore) {
        let counters = core.counters();
        let (command_tx, command_rx) = mpsc::channel(8);
        let task = tokio::spawn(core.run(command_rx));
        self.cores.insert(
            name,
            CoreHandle {
                commands: command_tx,
                counters,
                task,
            },
        );
    }

    /// Shut every core down in parallel, swallowing individual failures.
    pub async fn shutdown(&mut self) {
        let mut waits = Vec::new();
        for (name, handle) in self.cores.drain() {
            let (ack_tx, ack_rx) = oneshot::channel();
            match handle.commands.send(ProxyCommand::Shutdown(ack_tx)).await {
                Ok(()) => waits.push((name, ack_rx, handle.task)),
                Err(_) => {
                    // The core already stopped on its own.
                    handle.task.abort();
                }
            }
        }
        for (name, ack, task) in waits {
            if tokio::time::timeout(Duration::from_secs(10), ack)
                .await
                .is_err()
            {
                warn!(server = %name, "core did not acknowledge shutdown, aborting");
                task.abort();
                continue;
            }
            let _ = task.await;
            info!(server = %name, "proxy core stopped");
        }
    }

    /// Shut one core down.
    pub async fn shutdown_server(&mut self, name: &str) -> bool {
        let Some(handle) = self.cores.remove(name) else {
            return false;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if handle.commands.send(ProxyCommand::Shutdown(ack_tx)).await.is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(10), ack_rx).await;
        }
        let _ = handle.task.await;
        info!(server = name, "proxy core stopped");
        true
    }

    /// Names of running cores, sorted.
    pub fn list_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Per-server counters plus the aggregate.
    pub fn stats(&self) -> OrchestratorStats {
        let per_server: HashMap<String, ProxyStats> = self
            .cores
            .iter()
            .map(|(name, handle)| (name.clone(), handle.counters.snapshot()))
            .collect();
        let total = per_server
            .values()
            .fold(ProxyStats::default(), |acc, s| acc.merged(*s));
        OrchestratorStats { per_server, total }
    }
}

/// Aggregated view over all cores.
#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub per_server: HashMap<String, ProxyStats>,
    pub total: ProxyStats,
}

fn core_config(name: &str, server: &ServerConfig, config: &OverwatchConfig) -> ProxyCoreConfig {
    let mut core = ProxyCoreConfig::new(name, server.command.clone().unwrap_or_default());
    core.args = server.args.clone();
    core.env = server.env.clone();
    core.request_timeout = Duration::from_millis(config.defaults.timeout_ms);
    core.breaker = CircuitBreakerConfig::default();
    core
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ChannelApprovalHandler;
    use async_trait::async_trait;
    use overwatch_policy::engine::PolicyEngine;
    use overwatch_policy::session::SessionCache;
    use overwatch_security::audit::InMemoryAuditSink;
    use overwatch_types::errors::OverwatchError;
    use overwatch_types::rpc::JsonRpcMessage;
    use overwatch_types::traits::TransportEvent;

    /// A client transport that stays idle until dropped.
    struct IdleTransport {
        open: mpsc::UnboundedReceiver<TransportEvent>,
        _keepalive: mpsc::UnboundedSender<TransportEvent>,
    }

    impl IdleTransport {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                open: rx,
                _keepalive: tx,
            }
        }
    }

    #[async_trait]
    impl ProxyTransport for IdleTransport {
        async fn send(&mut self, _message: JsonRpcMessage) -> Result<(), OverwatchError> {
            Ok(())
        }
        async fn recv(&mut self) -> Option<TransportEvent> {
            self.open.recv().await
        }
        async fn close(&mut self) {
            self.open.close();
        }
        fn is_connected(&self) -> bool {
            true
        }
    }

    fn deps() -> ProxyDeps {
        let (approval, _rx) = ChannelApprovalHandler::new(4);
        ProxyDeps {
            policy: Arc::new(PolicyEngine::new()),
            sessions: Arc::new(SessionCache::new()),
            audit: Arc::new(InMemoryAuditSink::new()),
            detector: None,
            approval: Arc::new(approval),
        }
    }

    fn idle_factory() -> ClientTransportFactory {
        Arc::new(|_server: &str| Box::new(IdleTransport::new()) as Box<dyn ProxyTransport>)
    }

    fn config(yaml: &str) -> OverwatchConfig {
        OverwatchConfig::from_yaml(yaml).unwrap()
    }

    const TWO_CATS: &str = r#"
version: 1
servers:
  alpha:
    command: "cat"
  beta:
    command: "cat"
"#;

    #[tokio::test]
    async fn test_start_and_shutdown_all() {
        let mut orchestrator =
            Orchestrator::new(config(TWO_CATS), deps(), idle_factory()).unwrap();

        let started = orchestrator.start().await;
        assert_eq!(started, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(orchestrator.list_servers(), vec!["alpha", "beta"]);

        let stats = orchestrator.stats();
        assert_eq!(stats.per_server.len(), 2);
        assert_eq!(stats.total.requests_total, 0);

        orchestrator.shutdown().await;
        assert!(orchestrator.list_servers().is_empty());
    }

    #[tokio::test]
    async fn test_failed_server_is_tolerated() {
        let doc = r#"
version: 1
servers:
  good:
    command: "cat"
  bad:
    command: "/nonexistent/definitely-not-a-binary"
"#;
        let mut orchestrator = Orchestrator::new(config(doc), deps(), idle_factory()).unwrap();
        let started = orchestrator.start().await;
        assert_eq!(started, vec!["good".to_string()]);
        assert_eq!(orchestrator.list_servers(), vec!["good"]);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_single_and_shutdown_server() {
        let mut orchestrator =
            Orchestrator::new(config(TWO_CATS), deps(), idle_factory()).unwrap();

        orchestrator.start_single("alpha").await.unwrap();
        assert_eq!(orchestrator.list_servers(), vec!["alpha"]);

        // Double start is rejected; unknown server is rejected.
        assert!(orchestrator.start_single("alpha").await.is_err());
        assert!(orchestrator.start_single("gamma").await.is_err());

        assert!(orchestrator.shutdown_server("alpha").await);
        assert!(!orchestrator.shutdown_server("alpha").await);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let doc = "version: 2\n";
        let result = Orchestrator::new(config(doc), deps(), idle_factory());
        let issues = result.err().expect("invalid config must be rejected");
        assert!(issues.iter().any(|i| i.code == "INVALID_VERSION"));
    }
}
