//! ccrelay — programmable reverse proxy for LLM API traffic.
//!
//! Binary entry point: loads the `Config` snapshot, wires the
//! request-lifecycle engine up to an `actix-web` server, and drives
//! graceful shutdown (SPEC_FULL.md §2 item 10).

mod routes;

use std::sync::Arc;

use actix_web::{App, HttpServer};
use ccrelay_core::classify::CurrentProvider;
use ccrelay_core::concurrency::ConcurrencyManager;
use ccrelay_core::config::ConfigHandle;
use ccrelay_core::coordination::Leader;
use ccrelay_core::executor::UpstreamExecutor;
use ccrelay_core::logs::{logger::configure_logger, ConsoleLogSink};
use ccrelay_core::orchestrator::Orchestrator;
use log::{error, info};
use tokio::signal;

use routes::AppState;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    configure_logger();

    let config = match ccrelay_core::config::loader::load() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    info!("ccrelay starting, default provider {:?}", config.default_provider);

    let host = config.host.clone();
    let port = config.port;
    let config_path = std::env::var("CCRELAY_CONFIG_PATH").unwrap_or_else(|_| "./config.json".to_string());
    let default_provider = config.default_provider.clone();

    let config_handle = ConfigHandle::new(config, config_path);
    config_handle.clone().spawn_watcher();

    let current_provider = CurrentProvider::new(default_provider);
    let instance_id = std::env::var("CCRELAY_INSTANCE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    let leader = Arc::new(Leader::new(instance_id, current_provider.clone()));

    let orchestrator = Orchestrator::new(
        config_handle.clone(),
        ConcurrencyManager::new(),
        UpstreamExecutor::new(),
        current_provider,
        Arc::new(ConsoleLogSink),
    );

    let state = AppState {
        orchestrator,
        leader: leader.clone(),
        config: config_handle,
    };

    info!("listening on {host}:{port}");
    let server = HttpServer::new(move || {
        App::new()
            .app_data(actix_web::web::Data::new(state.clone()))
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes::configure)
    })
    .bind((host.as_str(), port))?
    .run();

    let server_handle = server.handle();

    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("server stopped"),
                Err(e) => error!("server error: {e}"),
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, notifying followers and draining");
            leader.broadcast_server_stopping();
            server_handle.stop(true).await;
        }
    }

    Ok(())
}

/// Resolves on `SIGINT` or, on unix, `SIGTERM` — whichever arrives first.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
