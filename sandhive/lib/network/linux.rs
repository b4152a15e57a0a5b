use std::{
    fs::File,
    net::IpAddr,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use futures::TryStreamExt;
use hiveutils::run_command;
use nix::sched::{setns, CloneFlags};
use rtnetlink::Handle;
use tokio::task::JoinHandle;

use crate::{SandhiveError, SandhiveResult};

use super::{
    hosts, ExecutionMode, ExecutionReport, NetScope, NetStep, NetworkExecutor, StepFailure,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Where `ip netns` keeps its namespace handles.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Applies network steps to the running kernel.
///
/// A plan runs start to finish on one dedicated OS thread with its own single-threaded runtime.
/// Namespace switches with `setns` only affect the calling thread, so nothing else ever observes
/// the thread in a sandbox namespace.
#[derive(Debug, Clone, Default)]
pub struct LinuxNetworkExecutor;

/// The namespace the pinned thread is in and a netlink handle bound to it.
struct NetnsSession {
    host_ns: File,
    current: NetScope,
    handle: Handle,
    connection: JoinHandle<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LinuxNetworkExecutor {
    /// Creates an executor.
    pub fn new() -> Self {
        Self
    }
}

impl NetnsSession {
    fn open() -> SandhiveResult<Self> {
        let host_ns = File::open(THREAD_NETNS)?;
        let (handle, connection) = Self::connect()?;
        Ok(Self {
            host_ns,
            current: NetScope::Host,
            handle,
            connection,
        })
    }

    /// Opens a netlink connection in the thread's current namespace.
    fn connect() -> SandhiveResult<(Handle, JoinHandle<()>)> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        Ok((handle, tokio::spawn(connection)))
    }

    fn enter(&mut self, scope: &NetScope) -> SandhiveResult<()> {
        if *scope == self.current {
            return Ok(());
        }

        match scope {
            NetScope::Host => setns(&self.host_ns, CloneFlags::CLONE_NEWNET),
            NetScope::Namespace(name) => {
                let ns = File::open(netns_path(name))?;
                setns(&ns, CloneFlags::CLONE_NEWNET)
            }
        }
        .map_err(|e| SandhiveError::custom(anyhow::anyhow!("setns into {scope}: {e}")))?;
        self.current = scope.clone();

        // Netlink sockets stay bound to the namespace they were opened in.
        let (handle, connection) = Self::connect()?;
        self.connection.abort();
        self.handle = handle;
        self.connection = connection;
        Ok(())
    }

    async fn link_index(&self, name: &str) -> SandhiveResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(link.header.index),
            Ok(None) => Err(SandhiveError::custom(anyhow::anyhow!(
                "link {name} not found"
            ))),
            Err(e) => Err(SandhiveError::custom(e)),
        }
    }

    async fn apply(&mut self, step: &NetStep) -> SandhiveResult<()> {
        self.enter(&step.scope())?;

        match step {
            NetStep::CreateNamespace { name } => {
                run_command("ip", ["netns", "add", name.as_str()]).await?;
            }
            NetStep::DeleteNamespace { name } => {
                run_command("ip", ["netns", "del", name.as_str()]).await?;
            }
            NetStep::CreateVethPair { veth, vpeer, .. } => {
                self.handle
                    .link()
                    .add()
                    .veth(veth.clone(), vpeer.clone())
                    .execute()
                    .await
                    .map_err(SandhiveError::custom)?;
            }
            NetStep::MoveLinkToHost { link, .. } => {
                let index = self.link_index(link).await?;
                self.handle
                    .link()
                    .set(index)
                    .setns_by_fd(self.host_ns.as_raw_fd())
                    .execute()
                    .await
                    .map_err(SandhiveError::custom)?;
            }
            NetStep::DeleteLink { link, .. } => {
                let index = self.link_index(link).await?;
                self.handle
                    .link()
                    .del(index)
                    .execute()
                    .await
                    .map_err(SandhiveError::custom)?;
            }
            NetStep::CreateTap { namespace, name } => {
                run_command(
                    "ip",
                    [
                        "netns",
                        "exec",
                        namespace.as_str(),
                        "ip",
                        "tuntap",
                        "add",
                        "dev",
                        name.as_str(),
                        "mode",
                        "tap",
                    ],
                )
                .await?;
            }
            NetStep::AssignAddress { link, cidr, .. } => {
                let index = self.link_index(link).await?;
                self.handle
                    .address()
                    .add(index, IpAddr::V4(cidr.ip()), cidr.prefix())
                    .execute()
                    .await
                    .map_err(SandhiveError::custom)?;
            }
            NetStep::SetLinkUp { link, .. } => {
                let index = self.link_index(link).await?;
                self.handle
                    .link()
                    .set(index)
                    .up()
                    .execute()
                    .await
                    .map_err(SandhiveError::custom)?;
            }
            NetStep::AddDefaultRoute { gateway, .. } => {
                self.handle
                    .route()
                    .add()
                    .v4()
                    .gateway(*gateway)
                    .execute()
                    .await
                    .map_err(SandhiveError::custom)?;
            }
            NetStep::AddRoute {
                destination,
                gateway,
            } => {
                self.handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(destination.ip(), destination.prefix())
                    .gateway(*gateway)
                    .execute()
                    .await
                    .map_err(SandhiveError::custom)?;
            }
            NetStep::DeleteRoute { destination } => {
                let destination = destination.to_string();
                run_command("ip", ["route", "del", destination.as_str()]).await?;
            }
            NetStep::Iptables { scope, .. } => {
                let rule = step.iptables_args().unwrap_or_default();
                match scope {
                    NetScope::Host => {
                        run_command("iptables", &rule).await?;
                    }
                    NetScope::Namespace(ns) => {
                        let mut args = vec![
                            "netns".to_string(),
                            "exec".to_string(),
                            ns.clone(),
                            "iptables".to_string(),
                        ];
                        args.extend(rule);
                        run_command("ip", &args).await?;
                    }
                }
            }
            NetStep::AddHostsEntry { path, ip, hostname } => {
                hosts::add_hosts_entry(path, *ip, hostname)?;
            }
            NetStep::RemoveHostsEntry { path, hostname } => {
                hosts::remove_hosts_entry(path, hostname)?;
            }
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The handle `ip netns` creates for a namespace.
pub fn netns_path(name: &str) -> PathBuf {
    Path::new(NETNS_RUN_DIR).join(name)
}

fn fail_all(steps: Vec<NetStep>, reason: &str, mode: ExecutionMode) -> ExecutionReport {
    let mut report = ExecutionReport::default();
    for step in steps {
        report.failures.push(StepFailure {
            step,
            reason: reason.to_string(),
        });
        if mode == ExecutionMode::StopOnError {
            break;
        }
    }
    report
}

/// Runs `steps` on the calling thread. The thread must not be shared with other work.
fn run_pinned(steps: Vec<NetStep>, mode: ExecutionMode) -> ExecutionReport {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return fail_all(steps, &format!("runtime: {e}"), mode),
    };

    runtime.block_on(async move {
        let mut session = match NetnsSession::open() {
            Ok(session) => session,
            Err(e) => return fail_all(steps, &e.to_string(), mode),
        };

        let mut report = ExecutionReport::default();
        for step in steps {
            tracing::debug!("network step: {step}");
            match session.apply(&step).await {
                Ok(()) => report.completed.push(step),
                Err(e) => {
                    report.failures.push(StepFailure {
                        step,
                        reason: e.to_string(),
                    });
                    if mode == ExecutionMode::StopOnError {
                        break;
                    }
                }
            }
        }

        if let Err(e) = session.enter(&NetScope::Host) {
            tracing::error!("failed to return network thread to the host namespace: {e}");
        }
        session.connection.abort();
        report
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl NetworkExecutor for LinuxNetworkExecutor {
    async fn execute(&self, steps: Vec<NetStep>, mode: ExecutionMode) -> ExecutionReport {
        let first = steps.first().cloned();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let spawned = std::thread::Builder::new()
            .name("sandhive-netns".to_string())
            .spawn(move || {
                let _ = tx.send(run_pinned(steps, mode));
            });

        if let Err(e) = spawned {
            return fail_all(first.into_iter().collect(), &format!("spawn: {e}"), mode);
        }

        rx.await.unwrap_or_else(|_| {
            fail_all(
                first.into_iter().collect(),
                "network thread exited without a report",
                mode,
            )
        })
    }
}
