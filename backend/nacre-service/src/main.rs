use actix_web::{web, App, HttpServer};
use nacre_service::admission::AdmissionController;
use nacre_service::config::{Config, StoreKind};
use nacre_service::error::AppError;
use nacre_service::hub::{InMemoryHub, RedisHub, SharedHub};
use nacre_service::middleware::{Logging, PanicRecovery, RequestIdMiddleware};
use nacre_service::state::AppState;
use nacre_service::tcp::TcpIngestServer;
use nacre_service::{logging, routes};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    logging::init_tracing(cfg.log_format);
    info!(config = ?cfg, "starting nacre");

    let hub: SharedHub = match cfg.store {
        StoreKind::Redis => {
            let redis_url = cfg.redis_url()?;
            let hub = RedisHub::connect(redis_url.as_str(), cfg.hub_settings())
                .await
                .map_err(|e| AppError::StartServer(format!("redis: {e}")))?;
            Arc::new(hub)
        }
        StoreKind::Memory => {
            warn!("using the in-memory feed store; history is lost on restart");
            Arc::new(InMemoryHub::new(cfg.hub_settings()))
        }
    };

    let admission = Arc::new(AdmissionController::new(cfg.admission_settings()));
    let shutdown = CancellationToken::new();

    let tcp = TcpIngestServer::bind(
        &cfg.tcp_addr,
        cfg.public_base_url(),
        hub.clone(),
        admission.clone(),
        cfg.tcp_settings(),
    )
    .await
    .map_err(|e| AppError::StartServer(format!("tcp: {e}")))?;
    let tcp_port = tcp
        .local_addr()
        .map_err(|e| AppError::StartServer(format!("tcp: {e}")))?
        .port();

    let state = AppState::new(
        hub,
        admission.clone(),
        cfg.public_base_url(),
        tcp_port,
        cfg.peer_settings(),
        shutdown.clone(),
    );

    let http_addr = cfg.http_socket_addr()?;
    info!(%http_addr, "HTTP server listening");
    let server = HttpServer::new(move || {
        App::new()
            .wrap(PanicRecovery)
            .wrap(Logging)
            .wrap(RequestIdMiddleware)
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(http_addr)
    .map_err(|e| AppError::StartServer(format!("bind HTTP: {e}")))?
    .disable_signals()
    .shutdown_timeout(10)
    .run();
    let server_handle = server.handle();

    let mut http_task = actix_web::rt::spawn(server);
    let mut tcp_task = tokio::spawn(tcp.run(shutdown.clone()));

    let mut http_result = None;
    let mut tcp_result = None;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        }
        res = &mut http_task => http_result = Some(res),
        res = &mut tcp_task => tcp_result = Some(res),
    }

    // Peers see the token first and close with going-away.
    shutdown.cancel();
    server_handle.stop(true).await;

    let http_result = match http_result {
        Some(res) => res,
        None => http_task.await,
    };
    let tcp_result = match tcp_result {
        Some(res) => res,
        None => tcp_task.await,
    };
    admission.stop().await;

    let mut failed = false;
    match http_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "HTTP server failed");
            failed = true;
        }
        Err(e) => {
            error!(error = %e, "HTTP server task panicked");
            failed = true;
        }
    }
    match tcp_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "TCP server failed");
            failed = true;
        }
        Err(e) => {
            error!(error = %e, "TCP server task panicked");
            failed = true;
        }
    }

    if failed {
        anyhow::bail!("nacre stopped after a server failure");
    }
    info!("nacre stopped");
    Ok(())
}
