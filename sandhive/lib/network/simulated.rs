use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;

use super::{
    hosts, ExecutionMode, ExecutionReport, NetScope, NetStep, NetworkExecutor, RuleAction,
    StepFailure,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`NetworkExecutor`] that applies steps to an in-memory model of the kernel's network state.
///
/// It enforces the same preconditions the kernel does (a namespace must exist before links are
/// created in it, a rule must exist to be deleted, ...) so plans can be exercised without root.
/// Hosts file edits are applied to the real file.
#[derive(Debug, Default)]
pub struct SimulatedNetwork {
    state: Mutex<SimState>,
}

#[derive(Debug, Default)]
struct SimState {
    namespaces: BTreeSet<String>,
    links: BTreeMap<(NetScope, String), SimLink>,
    default_routes: BTreeMap<NetScope, String>,
    host_routes: BTreeMap<String, String>,
    rules: Vec<(NetScope, Vec<String>)>,
    history: Vec<NetStep>,
    fail_patterns: Vec<String>,
}

#[derive(Debug, Default, Clone)]
struct SimLink {
    up: bool,
    addresses: Vec<String>,
    peer: Option<(NetScope, String)>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SimulatedNetwork {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every step whose description contains `pattern` fail.
    pub fn fail_when(&self, pattern: impl Into<String>) {
        self.with_state(|s| s.fail_patterns.push(pattern.into()));
    }

    /// Stops injecting failures.
    pub fn clear_failures(&self) {
        self.with_state(|s| s.fail_patterns.clear());
    }

    /// Every step attempted so far.
    pub fn history(&self) -> Vec<NetStep> {
        self.with_state(|s| s.history.clone())
    }

    /// Whether a namespace exists.
    pub fn has_namespace(&self, name: &str) -> bool {
        self.with_state(|s| s.namespaces.contains(name))
    }

    /// Whether a link exists.
    pub fn has_link(&self, scope: &NetScope, name: &str) -> bool {
        self.with_state(|s| s.links.contains_key(&(scope.clone(), name.to_string())))
    }

    /// Whether a link is up.
    pub fn is_link_up(&self, scope: &NetScope, name: &str) -> bool {
        self.with_state(|s| {
            s.links
                .get(&(scope.clone(), name.to_string()))
                .is_some_and(|l| l.up)
        })
    }

    /// Number of iptables rules across every scope.
    pub fn rule_count(&self) -> usize {
        self.with_state(|s| s.rules.len())
    }

    /// Number of host routes.
    pub fn host_route_count(&self) -> usize {
        self.with_state(|s| s.host_routes.len())
    }

    /// Whether nothing is left behind.
    pub fn is_pristine(&self) -> bool {
        self.with_state(|s| {
            s.namespaces.is_empty()
                && s.links.is_empty()
                && s.default_routes.is_empty()
                && s.host_routes.is_empty()
                && s.rules.is_empty()
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

impl SimState {
    fn apply(&mut self, step: &NetStep) -> Result<(), String> {
        let description = step.to_string();
        if self.fail_patterns.iter().any(|p| description.contains(p)) {
            return Err("injected failure".to_string());
        }

        match step {
            NetStep::CreateNamespace { name } => {
                if !self.namespaces.insert(name.clone()) {
                    return Err(format!("namespace {name} already exists"));
                }
            }
            NetStep::DeleteNamespace { name } => {
                if !self.namespaces.remove(name) {
                    return Err(format!("namespace {name} does not exist"));
                }
                let scope = NetScope::Namespace(name.clone());
                let doomed: Vec<_> = self
                    .links
                    .keys()
                    .filter(|(s, _)| *s == scope)
                    .cloned()
                    .collect();
                for key in doomed {
                    self.remove_link(&key);
                }
                self.default_routes.remove(&scope);
                self.rules.retain(|(s, _)| *s != scope);
            }
            NetStep::CreateVethPair {
                namespace,
                veth,
                vpeer,
            } => {
                let scope = self.existing_namespace(namespace)?;
                let a = (scope.clone(), veth.clone());
                let b = (scope, vpeer.clone());
                if self.links.contains_key(&a) || self.links.contains_key(&b) {
                    return Err("link already exists".to_string());
                }
                self.links.insert(
                    a.clone(),
                    SimLink {
                        peer: Some(b.clone()),
                        ..Default::default()
                    },
                );
                self.links.insert(
                    b,
                    SimLink {
                        peer: Some(a),
                        ..Default::default()
                    },
                );
            }
            NetStep::MoveLinkToHost { namespace, link } => {
                let from = (self.existing_namespace(namespace)?, link.clone());
                let to = (NetScope::Host, link.clone());
                if self.links.contains_key(&to) {
                    return Err(format!("{link} already exists on the host"));
                }
                let moved = self
                    .links
                    .remove(&from)
                    .ok_or_else(|| format!("cannot find device {link}"))?;
                if let Some(peer) = &moved.peer {
                    if let Some(peer_link) = self.links.get_mut(peer) {
                        peer_link.peer = Some(to.clone());
                    }
                }
                self.links.insert(to, moved);
            }
            NetStep::DeleteLink { scope, link } => {
                let key = (scope.clone(), link.clone());
                if !self.links.contains_key(&key) {
                    return Err(format!("cannot find device {link}"));
                }
                self.remove_link(&key);
            }
            NetStep::CreateTap { namespace, name } => {
                let key = (self.existing_namespace(namespace)?, name.clone());
                if self.links.contains_key(&key) {
                    return Err(format!("{name} already exists"));
                }
                self.links.insert(key, SimLink::default());
            }
            NetStep::AssignAddress { scope, link, cidr } => {
                self.link_mut(scope, link)?.addresses.push(cidr.to_string());
            }
            NetStep::SetLinkUp { scope, link } => {
                if link == "lo" {
                    if let NetScope::Namespace(ns) = scope {
                        self.existing_namespace(ns)?;
                    }
                    return Ok(());
                }
                self.link_mut(scope, link)?.up = true;
            }
            NetStep::AddDefaultRoute { scope, gateway } => {
                if let NetScope::Namespace(ns) = scope {
                    self.existing_namespace(ns)?;
                }
                if self
                    .default_routes
                    .insert(scope.clone(), gateway.to_string())
                    .is_some()
                {
                    return Err("default route already exists".to_string());
                }
            }
            NetStep::AddRoute {
                destination,
                gateway,
            } => {
                let key = destination.to_string();
                if self.host_routes.contains_key(&key) {
                    return Err(format!("route {key} already exists"));
                }
                self.host_routes.insert(key, gateway.to_string());
            }
            NetStep::DeleteRoute { destination } => {
                if self
                    .host_routes
                    .remove(&destination.to_string())
                    .is_none()
                {
                    return Err(format!("no such route {destination}"));
                }
            }
            NetStep::Iptables {
                scope,
                action,
                table,
                chain,
                rule,
            } => {
                if let NetScope::Namespace(ns) = scope {
                    self.existing_namespace(ns)?;
                }
                let mut spec = vec![table.clone(), chain.clone()];
                spec.extend(rule.iter().cloned());
                let entry = (scope.clone(), spec);
                match action {
                    RuleAction::Append => self.rules.push(entry),
                    RuleAction::Delete => {
                        let pos = self
                            .rules
                            .iter()
                            .position(|r| *r == entry)
                            .ok_or_else(|| "bad rule (does a matching rule exist?)".to_string())?;
                        self.rules.remove(pos);
                    }
                }
            }
            NetStep::AddHostsEntry { path, ip, hostname } => {
                hosts::add_hosts_entry(path, *ip, hostname).map_err(|e| e.to_string())?;
            }
            NetStep::RemoveHostsEntry { path, hostname } => {
                hosts::remove_hosts_entry(path, hostname).map_err(|e| e.to_string())?;
            }
        }

        Ok(())
    }

    fn existing_namespace(&self, name: &str) -> Result<NetScope, String> {
        if self.namespaces.contains(name) {
            Ok(NetScope::Namespace(name.to_string()))
        } else {
            Err(format!("namespace {name} does not exist"))
        }
    }

    fn link_mut(&mut self, scope: &NetScope, name: &str) -> Result<&mut SimLink, String> {
        if let NetScope::Namespace(ns) = scope {
            self.existing_namespace(ns)?;
        }
        self.links
            .get_mut(&(scope.clone(), name.to_string()))
            .ok_or_else(|| format!("cannot find device {name}"))
    }

    fn remove_link(&mut self, key: &(NetScope, String)) {
        if let Some(link) = self.links.remove(key) {
            if let Some(peer) = link.peer {
                self.links.remove(&peer);
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl NetworkExecutor for SimulatedNetwork {
    async fn execute(&self, steps: Vec<NetStep>, mode: ExecutionMode) -> ExecutionReport {
        self.with_state(|state| {
            let mut report = ExecutionReport::default();
            for step in steps {
                state.history.push(step.clone());
                match state.apply(&step) {
                    Ok(()) => report.completed.push(step),
                    Err(reason) => {
                        report.failures.push(StepFailure { step, reason });
                        if mode == ExecutionMode::StopOnError {
                            break;
                        }
                    }
                }
            }
            report
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
