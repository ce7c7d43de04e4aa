use actix_web::{web, App, HttpServer};
use realtime_delivery_service::{
    config::Config,
    error::AppError,
    logging,
    metrics::MetricsMiddleware,
    routes,
    state::{AppState, Backends},
};
use tokio::sync::watch;
use tracing_actix_web::TracingLogger;

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[actix_web::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();

    let config = Config::from_env()?;
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let backends = Backends::connect(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState::start(config, backends, shutdown_rx);
    let data = web::Data::new(state.clone());

    tracing::info!(%bind_addr, "starting realtime-delivery-service");

    let server = HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(MetricsMiddleware)
            .wrap(TracingLogger::default())
            .app_data(data.clone())
            .configure(routes::configure)
    })
    .disable_signals()
    .shutdown_timeout(10)
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind {bind_addr}: {e}")))?
    .run();

    let handle = server.handle();
    actix_web::rt::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
        // Sockets never finish on their own; close them so the drain can.
        let closed = state.close_connections();
        tracing::info!(closed, "closed client connections");
        handle.stop(true).await;
    });

    server
        .await
        .map_err(|e| AppError::StartServer(format!("http server: {e}")))
}
