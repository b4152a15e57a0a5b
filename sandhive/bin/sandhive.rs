use std::{net::SocketAddr, sync::Arc};

use clap::{CommandFactory, Parser};
use sandhive::{
    cache::{BuildCache, DriverEvictor, Reconciler, SandboxCache, TracingAnalytics},
    cli::{AnsiStyles, SandhiveArgs, SandhiveSubcommand},
    config::{
        Catalog, NodeConfig, DEFAULT_BUILD_SWEEP_INTERVAL, DEFAULT_EXPIRY_SWEEP_INTERVAL,
    },
    driver::{TaskDriver, TaskStore},
    files::ReflinkCloner,
    instance::InstanceAssembler,
    network::{default_gateway_interface, LinuxNetworkExecutor, NetworkBuilder},
    server::{SandhiveServer, ServerState},
    slot::{ConsulKv, Slot, SlotAllocator},
    utils,
    vmm::FirecrackerLauncher,
    SandhiveResult,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> SandhiveResult<()> {
    let args = SandhiveArgs::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    match args.subcommand {
        Some(SandhiveSubcommand::Serve { port }) => serve(port).await?,
        Some(SandhiveSubcommand::Slot { idx }) => {
            let node = std::env::var(utils::SANDHIVE_NODE_ID_ENV_VAR)
                .map(|id| utils::short_node_id(&id))
                .unwrap_or_else(|_| "-".to_string());
            let slot = Slot::new(node, idx, "")?;
            println!("{}", "Slot".header());
            println!("{slot}");
        }
        Some(SandhiveSubcommand::Reclaim { slot, sandbox_id }) => {
            reclaim(slot, &sandbox_id).await?;
        }
        None => {
            SandhiveArgs::command().print_help()?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

async fn serve(port: Option<u16>) -> SandhiveResult<()> {
    let config = NodeConfig::from_env()?;

    // Nothing works without the default gateway.
    let gateway = default_gateway_interface()
        .unwrap_or_else(|e| panic!("cannot determine the default gateway interface: {e}"));
    tracing::info!(gateway = %gateway, node_id = %config.get_node_id(), "starting sandhive");

    let catalog = match config.get_catalog_path() {
        Some(path) => Catalog::load(path).await?,
        None => {
            tracing::warn!(
                "{} is unset, every api key will be rejected",
                utils::SANDHIVE_CATALOG_ENV_VAR
            );
            Catalog::default()
        }
    };

    let client_id = config.short_node_id();
    let kv = Arc::new(ConsulKv::new(
        config.get_consul_addr(),
        config.get_consul_token().clone(),
    ));
    let assembler = InstanceAssembler::builder()
        .allocator(SlotAllocator::new(kv, client_id.clone()))
        .network(NetworkBuilder::new(
            Arc::new(LinuxNetworkExecutor::new()),
            gateway,
            config.get_hosts_file(),
        ))
        .cloner(Arc::new(ReflinkCloner))
        .launcher(Arc::new(FirecrackerLauncher::new(config.get_firecracker_exe())))
        .envs_root(config.get_envs_root())
        .runtime_dir(config.get_runtime_dir())
        .logs_proxy_address(config.get_logs_proxy_address())
        .build();

    tokio::fs::create_dir_all(config.get_runtime_dir()).await?;
    let store = TaskStore::open(config.tasks_db_path()).await?;
    let driver = Arc::new(TaskDriver::new(Arc::new(assembler), store));

    let reclaimed = driver.reclaim_orphans().await?;
    if !reclaimed.is_empty() {
        tracing::warn!(count = reclaimed.len(), "reclaimed orphaned sandboxes");
    }

    let cache = Arc::new(SandboxCache::new(Arc::new(DriverEvictor::new(
        driver.clone(),
    ))));
    let builds = Arc::new(BuildCache::new());
    let cancel = CancellationToken::new();

    let expiry = tokio::spawn(
        cache
            .clone()
            .run_expiry_loop(DEFAULT_EXPIRY_SWEEP_INTERVAL, cancel.clone()),
    );
    let build_expiry = tokio::spawn(
        builds
            .clone()
            .run_expiry_loop(DEFAULT_BUILD_SWEEP_INTERVAL, cancel.clone()),
    );
    let reconciler = tokio::spawn(
        Reconciler::new(cache.clone(), driver.clone(), Arc::new(TracingAnalytics))
            .run(cancel.clone()),
    );

    let state = ServerState::builder()
        .catalog(Arc::new(catalog))
        .cache(cache)
        .builds(builds)
        .driver(driver.clone())
        .client_id(client_id)
        .build_api_secret(config.get_build_api_secret().clone())
        .build();

    let port = port.unwrap_or(*config.get_port());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tokio::spawn(shutdown_on_signal(cancel.clone()));
    SandhiveServer::new(state, addr).serve(cancel.clone()).await?;

    cancel.cancel();
    for task in [expiry, build_expiry, reconciler] {
        task.await?;
    }

    tracing::info!("destroying running sandboxes");
    driver.destroy_all().await;
    Ok(())
}

async fn reclaim(idx: u32, sandbox_id: &str) -> SandhiveResult<()> {
    let config = NodeConfig::from_env()?;
    let gateway = default_gateway_interface()?;
    let slot = Slot::new(config.short_node_id(), idx, sandbox_id)?;

    let network = NetworkBuilder::new(
        Arc::new(LinuxNetworkExecutor::new()),
        gateway,
        config.get_hosts_file(),
    );
    if let Err(e) = network.remove(&slot).await {
        tracing::warn!(slot_idx = idx, "network teardown incomplete: {e}");
    }

    let kv = Arc::new(ConsulKv::new(
        config.get_consul_addr(),
        config.get_consul_token().clone(),
    ));
    SlotAllocator::new(kv, config.short_node_id())
        .release(&slot)
        .await?;

    println!(
        "reclaimed slot {} of sandbox {}",
        idx.to_string().literal(),
        sandbox_id.placeholder()
    );
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::error!("failed to install SIGTERM handler: {e}");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }

    tracing::info!("shutdown requested");
    cancel.cancel();
}
