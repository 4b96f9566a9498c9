//! API gateway server entry point.
//!
//! Loads process settings, builds the outbound HTTP client, constructs
//! a [`gateway_core::Gateway`], loads the initial routing configuration
//! from the configured file, then listens for subsequent changes and
//! hot-swaps the live snapshot without dropping in-flight requests
//! (spec.md §3 "In-flight requests continue on the snapshot they
//! started with").

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpRequest, HttpServer};
use gateway_core::config::file_source::{parse_snapshot, FileConfigSource};
use gateway_core::discovery::manager::Manager;
use gateway_core::discovery::static_file::StaticFileRegistry;
use gateway_core::middleware::metrics::PrometheusMetricsProvider;
use gateway_core::models::settings::GatewaySettings;
use gateway_core::Gateway;
use log::{error, info, warn};
use tokio::sync::{mpsc, watch};

async fn proxy_handler(gateway: web::Data<Arc<Gateway>>, req: HttpRequest, body: web::Bytes) -> actix_web::HttpResponse {
    gateway.handle_request(req, body).await
}

async fn health_handler(gateway: web::Data<Arc<Gateway>>) -> actix_web::HttpResponse {
    actix_web::HttpResponse::Ok().json(gateway.health())
}

async fn metrics_handler(gateway: web::Data<Arc<Gateway>>) -> actix_web::HttpResponse {
    match gateway.metrics_text() {
        Ok(body) => actix_web::HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(body),
        Err(e) => {
            error!("failed to render metrics: {e}");
            actix_web::HttpResponse::InternalServerError().finish()
        }
    }
}

fn build_http_client(settings: &gateway_core::models::settings::UpstreamPoolSettings) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(settings.max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(settings.idle_timeout_secs))
        .timeout(Duration::from_secs(settings.request_timeout_secs))
        .build()
        .expect("reqwest client builds with valid settings")
}

fn spawn_config_loop(gateway: Arc<Gateway>, config_path: String, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let source = Arc::new(FileConfigSource::new(config_path));
        let (tx, mut rx) = mpsc::channel(4);
        let poller = source.clone().spawn_poller(tx, Duration::from_secs(2), shutdown);

        while let Some(bytes) = rx.recv().await {
            match parse_snapshot(&bytes) {
                Ok(snapshot) => match gateway.install(snapshot) {
                    Ok(()) => info!("configuration reloaded, version {}", gateway.config_store().version()),
                    Err(e) => warn!("configuration reload rejected: {e}"),
                },
                Err(e) => warn!("configuration file malformed, ignoring: {e}"),
            }
        }

        let _ = poller.await;
    })
}

/// Watches the static-file discovery document and applies every instance
/// event it fires straight to the gateway's live upstream pool (spec.md
/// module 5 "discovery watcher -> upstream update"). Runs only when
/// `discovery_file_path` is configured; `gateway-server` otherwise relies
/// entirely on the routing configuration's declared targets.
fn spawn_discovery_loop(gateway: Arc<Gateway>, discovery_path: String, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let registry = Arc::new(StaticFileRegistry::new(discovery_path));
        if let Err(e) = registry.reload().await {
            warn!("initial discovery file load failed: {e}");
        }

        let manager = Manager::new(registry.clone());
        match registry.list_services().await {
            Ok(services) => {
                for service in services {
                    if let Err(e) = gateway.watch_discovery(&manager, None, &service).await {
                        warn!("failed to watch discovery service {service}: {e}");
                    }
                }
            }
            Err(e) => warn!("failed to list discovery services: {e}"),
        }

        let poller = registry.spawn_poller(Duration::from_secs(2), shutdown);
        let _ = poller.await;
    })
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    gateway_core::logs::logger::configure_logger();

    let settings = GatewaySettings::from_env();
    info!("starting gateway on {}:{}", settings.listener.host, settings.listener.port);

    let http_client = build_http_client(&settings.upstream_pool);
    let metrics_provider = Arc::new(PrometheusMetricsProvider::new());
    let request_timeout = Duration::from_secs(settings.upstream_pool.request_timeout_secs);
    let gateway = Gateway::new(http_client, metrics_provider, request_timeout);

    match tokio::fs::read(&settings.config_path).await {
        Ok(bytes) => match parse_snapshot(&bytes) {
            Ok(snapshot) => match gateway.install(snapshot) {
                Ok(()) => info!("loaded initial configuration from {}", settings.config_path),
                Err(e) => error!("initial configuration rejected: {e}"),
            },
            Err(e) => error!("initial configuration file malformed: {e}"),
        },
        Err(e) => warn!("no configuration file at {} ({e}), starting with an empty route table", settings.config_path),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config_loop = spawn_config_loop(gateway.clone(), settings.config_path.clone(), shutdown_rx);

    let discovery_loop = settings
        .discovery_file_path
        .clone()
        .map(|path| spawn_discovery_loop(gateway.clone(), path, shutdown_tx.subscribe()));

    let bind_host = settings.listener.host.clone();
    let bind_port = settings.listener.port;
    let app_gateway = gateway.clone();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_gateway.clone()))
            .route("/healthz", web::get().to(health_handler))
            .route("/metrics", web::get().to(metrics_handler))
            .default_service(web::route().to(proxy_handler))
    })
    .bind((bind_host.as_str(), bind_port))?
    .run();

    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("server stopped gracefully"),
                Err(e) => error!("server error: {e}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, stopping server");
        }
    }

    gateway.shutdown();
    let _ = shutdown_tx.send(true);
    let _ = config_loop.await;
    if let Some(discovery_loop) = discovery_loop {
        let _ = discovery_loop.await;
    }

    Ok(())
}
