//! Proxy orchestrator
//!
//! Turns a [`Config`] into running relays: one per rule, started in
//! configuration order. A rule that fails to start is marked inactive and the
//! remaining rules are still attempted, so partial success is the normal
//! steady state. Reconfiguration is "close everything, then rebuild".

use crate::config::{Config, HostConfig, Protocol, RuleConfig};
use crate::error::RelayError;
use crate::events::{RelayEvent, EVENT_CHANNEL_CAPACITY};
use crate::host::{rewrite_target, CommandDiscovery, HostDiscovery};
use crate::relay::{self, RelayHandle, SessionClock, SocketOpts};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// A configured rule together with its runtime state
#[derive(Debug)]
pub struct ProxyRule {
    config: RuleConfig,
    target: String,
    handle: Option<RelayHandle>,
}

impl ProxyRule {
    /// The rule as configured
    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// Target the relay forwards to, after any rewrite
    pub fn effective_target(&self) -> &str {
        &self.target
    }

    /// The live relay, if the rule was started
    pub fn handle(&self) -> Option<&RelayHandle> {
        self.handle.as_ref()
    }

    /// True iff the relay was started and is still open
    pub fn status(&self) -> bool {
        self.handle.as_ref().is_some_and(RelayHandle::is_open)
    }
}

/// Snapshot of one rule for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStatus {
    /// Rule id
    pub id: String,
    /// Rule protocol
    pub protocol: Protocol,
    /// Configured port
    pub listen_port: u32,
    /// Effective target
    pub target_addr: String,
    /// Whether the rule is forwarding
    pub status: bool,
    /// Live UDP sessions
    pub sessions: Option<usize>,
}

/// Starts, stops and edits the relays of a configuration
#[derive(Debug)]
pub struct ProxyOrchestrator {
    config: Config,
    rules: Vec<ProxyRule>,
    clock: SessionClock,
    discovery: Arc<dyn HostDiscovery>,
    events: broadcast::Sender<RelayEvent>,
}

impl Default for ProxyOrchestrator {
    fn default() -> Self {
        Self::new(&HostConfig::default())
    }
}

impl ProxyOrchestrator {
    /// Create an orchestrator with nothing running yet
    pub fn new(host: &HostConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        ProxyOrchestrator {
            config: Config::default(),
            rules: Vec::new(),
            clock: SessionClock::default(),
            discovery: Arc::new(CommandDiscovery::from_config(host)),
            events,
        }
    }

    /// Use another source for the host address
    pub fn with_discovery<D: HostDiscovery + 'static>(mut self, discovery: D) -> Self {
        self.discovery = Arc::new(discovery);
        self
    }

    /// Use other session deadlines
    pub fn with_clock(mut self, clock: SessionClock) -> Self {
        self.clock = clock;
        self
    }

    /// Subscribe to rule status events
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// The configuration last applied
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Rules with their runtime state, in configuration order
    pub fn rules(&self) -> &[ProxyRule] {
        &self.rules
    }

    /// Rule with the given id
    pub fn rule(&self, id: &str) -> Option<&ProxyRule> {
        self.rules.iter().find(|rule| rule.config.id == id)
    }

    /// Status of every rule, in configuration order
    pub fn statuses(&self) -> Vec<RuleStatus> {
        self.rules
            .iter()
            .map(|rule| RuleStatus {
                id: rule.config.id.clone(),
                protocol: rule.config.protocol,
                listen_port: rule.config.listen_port,
                target_addr: rule.target.clone(),
                status: rule.status(),
                sessions: rule.handle.as_ref().and_then(RelayHandle::active_sessions),
            })
            .collect()
    }

    /// Start one relay per rule of `config`.
    ///
    /// With `is_reboot`, every running relay is closed first and its port
    /// released before anything is bound again. Individual start failures
    /// only mark their rule inactive.
    pub async fn apply(&mut self, config: &Config, is_reboot: bool) {
        if is_reboot {
            self.close_all().await;
        } else if self.rules.iter().any(|rule| rule.handle.is_some()) {
            warn!("Relays already started, closing them before starting again");
            self.close_all().await;
        }

        self.config = config.clone();
        let socket_opts = SocketOpts::from_tcp_config(&config.tcp);

        let host_ip = if config.host.auto_rewrite_target {
            let ip = self.discovery.discover().await;
            match &ip {
                Some(ip) => info!(ip = %ip, "Host address discovered"),
                None => info!("Host address unavailable, targets unchanged"),
            }
            ip
        } else {
            None
        };

        let mut rules = Vec::with_capacity(config.rules.len());
        for rule_config in &config.rules {
            let mut target = rule_config.target_addr.clone();
            if let Some(rewritten) = host_ip.as_deref().and_then(|ip| rewrite_target(&target, ip)) {
                debug!(rule = %rule_config.id, from = %target, to = %rewritten, "Target rewritten");
                self.emit(RelayEvent::TargetRewritten {
                    id: rule_config.id.clone(),
                    from: target,
                    to: rewritten.clone(),
                });
                target = rewritten;
            }

            let handle = self.start_rule(rule_config, &target, &socket_opts).await;
            rules.push(ProxyRule {
                config: rule_config.clone(),
                target,
                handle,
            });
        }
        self.rules = rules;

        let active = self.rules.iter().filter(|rule| rule.status()).count();
        info!(active, total = self.rules.len(), "Configuration applied");
    }

    /// Close every running relay, waiting until all ports are released
    pub async fn close_all(&mut self) {
        for rule in &mut self.rules {
            if let Some(handle) = rule.handle.take() {
                handle.close().await;
                let _ = self.events.send(RelayEvent::RuleStopped {
                    id: rule.config.id.clone(),
                });
            }
        }
    }

    /// Validate and append a rule, then restart all relays.
    ///
    /// Returns the id of the new rule.
    pub async fn add_rule(&mut self, mut rule: RuleConfig) -> Result<String, RelayError> {
        rule.id.clear();
        rule.validate_against(&self.config.rules)?;
        rule.ensure_id();
        let id = rule.id.clone();

        let mut config = self.config.clone();
        config.rules.push(rule);
        self.apply(&config, true).await;
        Ok(id)
    }

    /// Replace the rule with the given id, keeping the id, then restart
    /// all relays
    pub async fn update_rule(&mut self, id: &str, mut rule: RuleConfig) -> Result<(), RelayError> {
        let index = self.config_index(id)?;
        rule.id = id.to_string();
        rule.validate_against(&self.config.rules)?;

        let mut config = self.config.clone();
        config.rules[index] = rule;
        self.apply(&config, true).await;
        Ok(())
    }

    /// Close and remove the rule with the given id
    pub async fn delete_rule(&mut self, id: &str) -> Result<(), RelayError> {
        let index = self.config_index(id)?;
        self.config.rules.remove(index);

        if let Some(position) = self.rules.iter().position(|rule| rule.config.id == id) {
            let rule = self.rules.remove(position);
            if let Some(handle) = rule.handle {
                handle.close().await;
                self.emit(RelayEvent::RuleStopped { id: id.to_string() });
            }
        }

        info!(rule = %id, "Rule deleted");
        Ok(())
    }

    fn config_index(&self, id: &str) -> Result<usize, RelayError> {
        self.config
            .rules
            .iter()
            .position(|rule| rule.id == id)
            .ok_or_else(|| RelayError::UnknownRule(id.to_string()))
    }

    async fn start_rule(
        &self,
        rule: &RuleConfig,
        target: &str,
        socket_opts: &SocketOpts,
    ) -> Option<RelayHandle> {
        let started = match rule.listen_addr() {
            Ok(listen) => {
                relay::start(rule.protocol, listen, target, self.clock, socket_opts.clone()).await
            }
            Err(e) => Err(e),
        };

        match started {
            Ok(handle) => {
                self.emit(RelayEvent::RuleStarted {
                    id: rule.id.clone(),
                    protocol: rule.protocol,
                    listen: handle.local_addr(),
                    target: target.to_string(),
                });
                Some(handle)
            }
            Err(e) => {
                error!(
                    rule = %rule.id,
                    protocol = %rule.protocol,
                    listen_port = rule.listen_port,
                    target = %target,
                    error = %e,
                    "Failed to start relay"
                );
                self.emit(RelayEvent::RuleFailed {
                    id: rule.id.clone(),
                    protocol: rule.protocol,
                    listen_port: rule.listen_port,
                    error: e.to_string(),
                });
                None
            }
        }
    }

    fn emit(&self, event: RelayEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
