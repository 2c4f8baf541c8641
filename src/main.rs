//! confcache server binary
//!
//! Wires the components together: backend, cache engine with its peer RPC
//! listener, peer-set controller, refresh subscriber and the public,
//! health and metrics servers.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use confcache::backend::{new_backend, MeteredBackend};
use confcache::cache::{
    run_rpc_server, BackendLoader, CacheEngine, HttpPeerTransport, DEFAULT_CACHE_BUDGET,
    GROUP_NAME,
};
use confcache::config::AppConfig;
use confcache::discovery::{KubeDiscovery, PeerDiscovery};
use confcache::error::Result;
use confcache::metrics::Metrics;
use confcache::peers::{build_url, run_peer_controller};
use confcache::refresh::{run_invalidation_loop, RefreshConfig, RefreshSubscriber};
use confcache::registry::KeyRegistry;
use confcache::server::{
    parse_listen_addr, run_health_server, run_metrics_server, run_public_server,
    shutdown_signal, AppState,
};

/// Timeout for individual peer RPC requests
const PEER_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the servers to stop accepting on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::parse();

    init_logging(&config);

    info!("starting confcache {}", env!("CARGO_PKG_VERSION"));
    info!("configuration hints:");
    info!("  backend http:                     export BACKEND=http://configserver:9000");
    info!("  backend directory:                export BACKEND=dir:samples");
    info!("  backend directory option flatten: export BACKEND_OPTIONS=flatten");
    info!("  disable refresh:                  export REFRESH=false");

    let metrics = Arc::new(Metrics::register_default()?);

    //
    // create backend
    //

    let backend = new_backend(&config.backend, &config.backend_options)?;
    let backend: Arc<dyn confcache::backend::Backend> =
        Arc::new(MeteredBackend::new(backend, Arc::clone(&metrics)));

    //
    // resolve identity and create the cache engine
    //

    let discovery = Arc::new(KubeDiscovery::new().await?);
    let self_url = build_url(discovery.local_address(), &config.groupcache_port);
    info!(url = %self_url, "cache peer URL");

    let loader = Arc::new(BackendLoader::new(
        Arc::clone(&backend),
        Duration::from_secs(config.ttl_seconds),
    ));
    let transport = Arc::new(HttpPeerTransport::new(PEER_RPC_TIMEOUT)?);
    let budget = if config.cache_size_bytes == 0 {
        DEFAULT_CACHE_BUDGET
    } else {
        config.cache_size_bytes
    };
    let engine = CacheEngine::new(GROUP_NAME, self_url, budget, loader, transport);

    //
    // start the peer RPC server
    //

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let rpc_addr = parse_listen_addr(&config.groupcache_port)?;
    let rpc_server = {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_rpc_server(engine, rpc_addr, shutdown).await {
                error!(error = %e, "peer RPC server exited");
                std::process::exit(1);
            }
        })
    };

    //
    // start the peer-set controller
    //

    {
        let engine = Arc::clone(&engine);
        let discovery = Arc::clone(&discovery);
        let port = config.groupcache_port.clone();
        tokio::spawn(async move {
            // The peer set is correctness-critical: a failed watch means the
            // set can no longer be trusted, so the replica exits and lets
            // the supervisor restart it.
            if let Err(e) = run_peer_controller(engine, discovery, &port).await {
                error!(error = %e, "peer discovery failed");
                std::process::exit(1);
            }
        });
    }

    //
    // receive refresh events
    //

    let registry = Arc::new(KeyRegistry::new());

    let refresh_handle = if config.refresh {
        let refresh_config = RefreshConfig::new(
            config.amqp_url.clone(),
            env!("CARGO_PKG_NAME"),
            config.debug,
        );
        let (handle, events) = RefreshSubscriber::spawn(refresh_config);

        let registry = Arc::clone(&registry);
        let engine = Arc::clone(&engine);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            run_invalidation_loop(events, registry, engine, metrics).await;
            // The subscriber reconnects forever; a closed delivery channel
            // without close() means it is gone for good.
            error!("refresh delivery channel closed");
            std::process::exit(1);
        });

        Some(handle)
    } else {
        info!("refresh subscriber disabled");
        None
    };

    //
    // start application, health and metrics servers
    //

    let state = Arc::new(AppState {
        engine,
        cache_enabled: config.cache,
        backend,
        registry,
        metrics,
    });

    let public_addr = parse_listen_addr(&config.listen_addr)?;
    let public_server = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_public_server(state, public_addr, shutdown).await {
                error!(error = %e, "application server exited");
                std::process::exit(1);
            }
        })
    };

    let health_addr = parse_listen_addr(&config.health_addr)?;
    let health_path = config.health_path.clone();
    let health_server = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_addr, health_path, shutdown).await {
                error!(error = %e, "health server exited");
            }
        })
    };

    let metrics_addr = parse_listen_addr(&config.metrics_addr)?;
    let metrics_path = config.metrics_path.clone();
    let metrics_server = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics_addr, metrics_path, shutdown).await {
                error!(error = %e, "metrics server exited");
            }
        })
    };

    //
    // handle graceful shutdown
    //

    shutdown_signal().await;
    info!("received shutdown signal, stopping servers");

    if let Some(handle) = refresh_handle {
        handle.close();
    }
    let _ = shutdown_tx.send(true);

    let servers = futures::future::join_all([
        rpc_server,
        public_server,
        health_server,
        metrics_server,
    ]);
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, servers).await.is_err() {
        warn!(timeout = ?SHUTDOWN_TIMEOUT, "servers did not stop in time, exiting anyway");
    }

    info!("exiting");
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let level = if config.debug { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
        .add_directive("hyper=warn".parse().expect("valid directive"))
        .add_directive("kube=info".parse().expect("valid directive"))
        .add_directive("tower=warn".parse().expect("valid directive"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
