use std::{
    fmt,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use ipnetwork::Ipv4Network;

use crate::slot::{Slot, GUEST_IP};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where a step runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetScope {
    /// The host network namespace.
    Host,

    /// A named network namespace.
    Namespace(String),
}

/// Whether an iptables rule is appended or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleAction {
    /// `-A`
    Append,

    /// `-D`
    Delete,
}

/// One atomic change to the node's network state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetStep {
    /// `ip netns add`
    CreateNamespace {
        /// The namespace name.
        name: String,
    },

    /// `ip netns del`
    DeleteNamespace {
        /// The namespace name.
        name: String,
    },

    /// Creates a veth pair with both ends inside `namespace`.
    CreateVethPair {
        /// The namespace the pair is created in.
        namespace: String,

        /// The end that will later move to the host.
        veth: String,

        /// The end that stays in the namespace.
        vpeer: String,
    },

    /// Moves a link from a namespace into the host namespace.
    MoveLinkToHost {
        /// The namespace the link currently lives in.
        namespace: String,

        /// The link name.
        link: String,
    },

    /// Deletes a link. Deleting either end of a veth pair removes both.
    DeleteLink {
        /// Where the link lives.
        scope: NetScope,

        /// The link name.
        link: String,
    },

    /// Creates a TAP device inside a namespace.
    CreateTap {
        /// The namespace.
        namespace: String,

        /// The TAP name.
        name: String,
    },

    /// Assigns an address to a link.
    AssignAddress {
        /// Where the link lives.
        scope: NetScope,

        /// The link name.
        link: String,

        /// The address and prefix.
        cidr: Ipv4Network,
    },

    /// Sets a link up.
    SetLinkUp {
        /// Where the link lives.
        scope: NetScope,

        /// The link name.
        link: String,
    },

    /// Adds a default route.
    AddDefaultRoute {
        /// Where the route is added.
        scope: NetScope,

        /// The next hop.
        gateway: Ipv4Addr,
    },

    /// Adds a route to `destination` via `gateway` in the host namespace.
    AddRoute {
        /// The destination prefix.
        destination: Ipv4Network,

        /// The next hop.
        gateway: Ipv4Addr,
    },

    /// Deletes a host route.
    DeleteRoute {
        /// The destination prefix.
        destination: Ipv4Network,
    },

    /// Appends or deletes an iptables rule.
    Iptables {
        /// Where the rule lives.
        scope: NetScope,

        /// Append or delete.
        action: RuleAction,

        /// The table, e.g. `nat`.
        table: String,

        /// The chain, e.g. `POSTROUTING`.
        chain: String,

        /// The rule specification.
        rule: Vec<String>,
    },

    /// Publishes `hostname` at `ip` in a hosts file.
    AddHostsEntry {
        /// The hosts file.
        path: PathBuf,

        /// The address.
        ip: Ipv4Addr,

        /// The hostname.
        hostname: String,
    },

    /// Removes every hosts file line naming `hostname`.
    RemoveHostsEntry {
        /// The hosts file.
        path: PathBuf,

        /// The hostname.
        hostname: String,
    },
}

/// The ordered steps that give one slot its network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlan {
    steps: Vec<NetStep>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetScope {
    /// The namespace name, if any.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            NetScope::Host => None,
            NetScope::Namespace(name) => Some(name),
        }
    }
}

impl NetStep {
    /// Where the step runs.
    pub fn scope(&self) -> NetScope {
        match self {
            NetStep::CreateVethPair { namespace, .. }
            | NetStep::MoveLinkToHost { namespace, .. }
            | NetStep::CreateTap { namespace, .. } => NetScope::Namespace(namespace.clone()),
            NetStep::DeleteLink { scope, .. }
            | NetStep::AssignAddress { scope, .. }
            | NetStep::SetLinkUp { scope, .. }
            | NetStep::AddDefaultRoute { scope, .. }
            | NetStep::Iptables { scope, .. } => scope.clone(),
            _ => NetScope::Host,
        }
    }

    /// The step that reverts this one.
    ///
    /// Anything that lives inside a namespace goes away with the namespace, so only the namespace
    /// itself and the host-side state have inverses.
    pub fn undo(&self) -> Option<NetStep> {
        match self {
            NetStep::CreateNamespace { name } => {
                Some(NetStep::DeleteNamespace { name: name.clone() })
            }
            NetStep::MoveLinkToHost { link, .. } => Some(NetStep::DeleteLink {
                scope: NetScope::Host,
                link: link.clone(),
            }),
            NetStep::AddRoute { destination, .. } => Some(NetStep::DeleteRoute {
                destination: *destination,
            }),
            NetStep::Iptables {
                scope: NetScope::Host,
                action: RuleAction::Append,
                table,
                chain,
                rule,
            } => Some(NetStep::Iptables {
                scope: NetScope::Host,
                action: RuleAction::Delete,
                table: table.clone(),
                chain: chain.clone(),
                rule: rule.clone(),
            }),
            NetStep::AddHostsEntry { path, hostname, .. } => Some(NetStep::RemoveHostsEntry {
                path: path.clone(),
                hostname: hostname.clone(),
            }),
            _ => None,
        }
    }

    /// The `iptables` arguments of a rule step.
    pub fn iptables_args(&self) -> Option<Vec<String>> {
        match self {
            NetStep::Iptables {
                action,
                table,
                chain,
                rule,
                ..
            } => {
                let flag = match action {
                    RuleAction::Append => "-A",
                    RuleAction::Delete => "-D",
                };
                let mut args = vec![
                    "-t".to_string(),
                    table.clone(),
                    flag.to_string(),
                    chain.clone(),
                ];
                args.extend(rule.iter().cloned());
                Some(args)
            }
            _ => None,
        }
    }
}

impl NetworkPlan {
    /// Builds the plan for `slot`, forwarding through `gateway_iface` and publishing to `hosts_file`.
    pub fn for_slot(slot: &Slot, gateway_iface: &str, hosts_file: &Path) -> Self {
        let ns = slot.namespace_name();
        let in_ns = NetScope::Namespace(ns.clone());
        let veth = slot.veth_name();
        let vpeer = slot.vpeer_name().to_string();
        let tap = slot.tap_name().to_string();
        let host_ip = slot.host_snapshot_ip().to_string();
        let host_cidr = slot.get_host_snapshot_cidr().to_string();
        let guest_ip = GUEST_IP.to_string();

        let steps = vec![
            NetStep::CreateNamespace { name: ns.clone() },
            NetStep::CreateVethPair {
                namespace: ns.clone(),
                veth: veth.clone(),
                vpeer: vpeer.clone(),
            },
            NetStep::AssignAddress {
                scope: in_ns.clone(),
                link: vpeer.clone(),
                cidr: *slot.get_vpeer_cidr(),
            },
            NetStep::SetLinkUp {
                scope: in_ns.clone(),
                link: vpeer.clone(),
            },
            NetStep::MoveLinkToHost {
                namespace: ns.clone(),
                link: veth.clone(),
            },
            NetStep::SetLinkUp {
                scope: NetScope::Host,
                link: veth.clone(),
            },
            NetStep::AssignAddress {
                scope: NetScope::Host,
                link: veth.clone(),
                cidr: *slot.get_veth_cidr(),
            },
            NetStep::CreateTap {
                namespace: ns.clone(),
                name: tap.clone(),
            },
            NetStep::AssignAddress {
                scope: in_ns.clone(),
                link: tap.clone(),
                cidr: *slot.get_tap_cidr(),
            },
            NetStep::SetLinkUp {
                scope: in_ns.clone(),
                link: tap,
            },
            NetStep::SetLinkUp {
                scope: in_ns.clone(),
                link: "lo".to_string(),
            },
            NetStep::AddDefaultRoute {
                scope: in_ns.clone(),
                gateway: slot.veth_ip(),
            },
            iptables(
                in_ns.clone(),
                "nat",
                "POSTROUTING",
                &["-o", &vpeer, "-s", &guest_ip, "-j", "SNAT", "--to", &host_ip],
            ),
            iptables(
                in_ns,
                "nat",
                "PREROUTING",
                &["-i", &vpeer, "-d", &host_ip, "-j", "DNAT", "--to", &guest_ip],
            ),
            NetStep::AddRoute {
                destination: *slot.get_host_snapshot_cidr(),
                gateway: slot.vpeer_ip(),
            },
            iptables(
                NetScope::Host,
                "filter",
                "FORWARD",
                &["-i", &veth, "-o", gateway_iface, "-j", "ACCEPT"],
            ),
            iptables(
                NetScope::Host,
                "filter",
                "FORWARD",
                &["-i", gateway_iface, "-o", &veth, "-j", "ACCEPT"],
            ),
            iptables(
                NetScope::Host,
                "nat",
                "POSTROUTING",
                &["-s", &host_cidr, "-o", gateway_iface, "-j", "MASQUERADE"],
            ),
            NetStep::AddHostsEntry {
                path: hosts_file.to_path_buf(),
                ip: slot.host_snapshot_ip(),
                hostname: slot.get_sandbox_id().clone(),
            },
        ];

        Self { steps }
    }

    /// The build steps in order.
    pub fn steps(&self) -> &[NetStep] {
        &self.steps
    }

    /// The steps that undo the whole plan, last change first.
    pub fn teardown(&self) -> Vec<NetStep> {
        Self::undo_of(&self.steps)
    }

    /// The steps that undo `completed`, last change first.
    pub fn undo_of(completed: &[NetStep]) -> Vec<NetStep> {
        completed.iter().rev().filter_map(NetStep::undo).collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn iptables(scope: NetScope, table: &str, chain: &str, rule: &[&str]) -> NetStep {
    NetStep::Iptables {
        scope,
        action: RuleAction::Append,
        table: table.to_string(),
        chain: chain.to_string(),
        rule: rule.iter().map(|s| s.to_string()).collect(),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for NetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetScope::Host => write!(f, "host"),
            NetScope::Namespace(name) => write!(f, "{name}"),
        }
    }
}

impl fmt::Display for NetStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetStep::CreateNamespace { name } => write!(f, "create namespace {name}"),
            NetStep::DeleteNamespace { name } => write!(f, "delete namespace {name}"),
            NetStep::CreateVethPair {
                namespace,
                veth,
                vpeer,
            } => write!(f, "[{namespace}] create veth pair {veth} <-> {vpeer}"),
            NetStep::MoveLinkToHost { namespace, link } => {
                write!(f, "[{namespace}] move {link} to host")
            }
            NetStep::DeleteLink { scope, link } => write!(f, "[{scope}] delete link {link}"),
            NetStep::CreateTap { namespace, name } => write!(f, "[{namespace}] create tap {name}"),
            NetStep::AssignAddress { scope, link, cidr } => {
                write!(f, "[{scope}] assign {cidr} to {link}")
            }
            NetStep::SetLinkUp { scope, link } => write!(f, "[{scope}] set {link} up"),
            NetStep::AddDefaultRoute { scope, gateway } => {
                write!(f, "[{scope}] add default route via {gateway}")
            }
            NetStep::AddRoute {
                destination,
                gateway,
            } => write!(f, "[host] add route {destination} via {gateway}"),
            NetStep::DeleteRoute { destination } => write!(f, "[host] delete route {destination}"),
            NetStep::Iptables { scope, .. } => {
                let args = self.iptables_args().unwrap_or_default().join(" ");
                write!(f, "[{scope}] iptables {args}")
            }
            NetStep::AddHostsEntry { ip, hostname, .. } => {
                write!(f, "add hosts entry {ip} {hostname}")
            }
            NetStep::RemoveHostsEntry { hostname, .. } => {
                write!(f, "remove hosts entry {hostname}")
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
