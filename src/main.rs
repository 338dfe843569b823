//! Pingora-based sharding reverse proxy with routes hot-loaded from etcd.
//!
//! Requests are matched against ACLs stored in etcd. Each ACL extracts a
//! shard key from the request and maps it to one of its backends. The
//! routing table follows etcd changes without a restart.

mod config;
mod health;
mod proxy;
mod registry;
mod shard;
mod store;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pingora_core::server::Server;
use pingora_core::services::background::background_service;
use pingora_proxy::http_proxy_service;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{AclCommand, Cli, Commands, ServerArgs, StoreArgs};
use health::{AdminService, AdminState};
use proxy::{AclConfig, GatewayProxy, Router, TracingReporter};
use registry::Registry;
use store::{EtcdStore, RouteLoader, RouteSyncService};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over LOGGER_LEVEL
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    match cli.command {
        Commands::Server(args) => run_server(cli.store, args),
        Commands::Acls { command } => run_acl_command(cli.store, command),
    }
}

fn run_server(store_args: StoreArgs, args: ServerArgs) -> Result<()> {
    tracing::info!("weaver starting");

    let admin_addr = args
        .admin_addr()
        .with_context(|| format!("invalid admin address {}:{}", args.proxy_host, args.admin_port))?;

    // The etcd client's connection tasks live on this runtime for the
    // whole process; Pingora services run on their own runtimes.
    let store_runtime = tokio::runtime::Runtime::new().context("failed to start store runtime")?;
    let store = store_runtime
        .block_on(EtcdStore::connect(
            &store_args.etcd_endpoints,
            store_args.dial_timeout(),
        ))
        .context("failed to connect to etcd")?;

    let registry = Arc::new(Registry::with_defaults(args.backend_defaults()));
    let router = Arc::new(Router::new());
    let ready = Arc::new(AtomicBool::new(false));
    let loader = RouteLoader::new(Arc::new(store), registry, &store_args.etcd_key_prefix);

    let mut server = Server::new(None).context("failed to create pingora server")?;
    server.bootstrap();

    let gateway = GatewayProxy::new(router.clone(), Arc::new(TracingReporter), args.max_body_bytes);
    let mut proxy_service = http_proxy_service(&server.configuration, gateway);
    proxy_service.add_tcp(&args.proxy_addr());

    let route_sync = background_service(
        "route sync",
        RouteSyncService::new(loader, router.clone(), ready.clone()),
    );
    let admin = background_service(
        "admin",
        AdminService::new(admin_addr, AdminState { router, ready }),
    );

    server.add_service(proxy_service);
    server.add_service(route_sync);
    server.add_service(admin);

    tracing::info!(
        proxy = %args.proxy_addr(),
        admin = %admin_addr,
        namespace = %store_args.etcd_key_prefix,
        "weaver started"
    );
    server.run_forever();
}

fn run_acl_command(store_args: StoreArgs, command: AclCommand) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(async move {
        let store = EtcdStore::connect(&store_args.etcd_endpoints, store_args.dial_timeout())
            .await
            .context("failed to connect to etcd")?;
        let loader = RouteLoader::new(
            Arc::new(store),
            Arc::new(Registry::default()),
            &store_args.etcd_key_prefix,
        );

        match command {
            AclCommand::List => {
                for acl in loader.list_all().await? {
                    println!("{}\t{}", acl.id, acl.criterion);
                }
            }
            AclCommand::Show { id } => {
                let acl = loader.get_acl(&loader.key_for(&id)).await?;
                println!("{}", serde_json::to_string_pretty(&acl.config())?);
            }
            AclCommand::Put { file } => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let config = AclConfig::from_json(&raw)
                    .with_context(|| format!("invalid ACL in {}", file.display()))?;
                let key = loader.put_acl(&config).await?;
                println!("stored {} at {}", config, key);
            }
            AclCommand::Delete { id } => {
                let key = loader.key_for(&id);
                if !loader.del_acl(&key).await? {
                    bail!("no ACL stored at {}", key);
                }
                println!("deleted {}", key);
            }
        }
        Ok(())
    })
}
