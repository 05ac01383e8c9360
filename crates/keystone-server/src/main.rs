//! `keystone-server`: a gateway node serving collection, insert, delete and
//! search requests over HTTP/JSON on top of the [`keystone`] coordinator.

mod server;

use clap::Parser;
use keystone::{
    AuthorityConnector, Coordinator, InMemoryBus, LocalAuthority, MessageBus,
    authority::GrpcConnector, bus::GrpcBus,
};
use server::config::{Backend, CliArgs, ServerConfig};
use server::service::router;
use server::telemetry::{init_telemetry, observe_allocator_refills};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    let result = run(&config).await;
    providers.shutdown();
    result
}

async fn run(config: &ServerConfig) -> anyhow::Result<()> {
    let coordinator = Arc::new(build_coordinator(config).await?);
    coordinator.start().await?;
    observe_allocator_refills(coordinator.id_allocator()?, coordinator.timestamp_allocator()?);

    // The endpoint only opens once every component is up.
    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            coordinator.close().await;
            return Err(e.into());
        }
    };
    log_startup_info(config);

    let served = axum::serve(listener, router(Arc::clone(&coordinator)))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    #[cfg(feature = "tracing")]
    tracing::info!("Endpoint closed, shutting down coordinator");
    coordinator.close().await;
    served?;

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");
    Ok(())
}

async fn build_coordinator(config: &ServerConfig) -> anyhow::Result<Coordinator> {
    let connector: Arc<dyn AuthorityConnector> = match &config.authority {
        Backend::InProcess => Arc::new(LocalAuthority::default()),
        Backend::Remote(addr) => Arc::new(GrpcConnector {
            addr: addr.clone(),
            dial_timeout: config.dial_timeout,
            rpc_timeout: config.rpc_timeout,
        }),
    };
    let bus: Arc<dyn MessageBus> = match &config.bus {
        Backend::InProcess => Arc::new(InMemoryBus::new()),
        Backend::Remote(addr) => {
            Arc::new(GrpcBus::connect(addr, config.dial_timeout, config.rpc_timeout).await?)
        }
    };
    Ok(Coordinator::new(config.coordinator.clone(), connector, bus))
}

fn log_startup_info(_config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Listening on {} with full config: {:#?}",
            _config.listen_addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Listening on {} (authority: {:?}, bus: {:?})",
            _config.listen_addr,
            _config.authority,
            _config.bus
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");
}
