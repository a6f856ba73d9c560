use crate::cli::ServeArgs;
use crate::infra::{start_engine, AppState};
use crate::routes::app_router;
use axum_prometheus::PrometheusMetricLayer;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sunbid::config::AppConfig;
use sunbid::error::AppError;
use sunbid::telemetry;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }
    if let Some(db_path) = args.db_path.take() {
        config.storage.db_path = Some(db_path);
    }

    telemetry::init(&config.telemetry)?;

    let engine = start_engine(&config.engine, &config.storage).await?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
        service: engine.service.clone(),
        inbox: engine.inbox.clone(),
    };

    let app = app_router(app_state)
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http());

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        bid_window_hours = config.engine.bid_window_hours,
        "solar procurement service ready"
    );

    let shutdown = engine.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    readiness_flag.store(false, Ordering::Release);
    engine.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c; shutdown on signal disabled");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
