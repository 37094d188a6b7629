#![allow(dead_code)]

use actix_web::{dev::ServerHandle, web, App, HttpServer};
use nacre_service::admission::{AdmissionController, AdmissionSettings};
use nacre_service::hub::{HubSettings, InMemoryHub, SharedHub};
use nacre_service::routes;
use nacre_service::state::AppState;
use nacre_service::tcp::{TcpIngestServer, TcpSettings};
use nacre_service::websocket::PeerSettings;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const BASE_URL: &str = "http://nacre.test";

/// Hub tuned so tails notice liveness changes quickly.
pub fn fast_hub() -> InMemoryHub {
    InMemoryHub::new(HubSettings {
        block_timeout: Duration::from_millis(100),
        client_ttl: Duration::from_secs(30),
        ..HubSettings::default()
    })
}

pub fn admission(max_producers_per_origin: usize, max_peers_per_feed: usize) -> Arc<AdmissionController> {
    Arc::new(AdmissionController::new(AdmissionSettings {
        max_producers_per_origin,
        max_peers_per_feed,
        ..AdmissionSettings::default()
    }))
}

pub struct TcpFixture {
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

pub async fn start_tcp(hub: SharedHub, admission: Arc<AdmissionController>) -> TcpFixture {
    let server = TcpIngestServer::bind(
        "127.0.0.1:0",
        BASE_URL,
        hub,
        admission,
        TcpSettings {
            heartbeat_interval: Duration::from_millis(200),
            ..TcpSettings::default()
        },
    )
    .await
    .expect("bind tcp server");
    let addr = server.local_addr().expect("tcp local addr");
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        server.run(run_cancel).await.expect("tcp server run");
    });
    TcpFixture { addr, cancel, task }
}

/// Peer settings that keep pings out of the way of short tests.
pub fn quiet_peer_settings() -> PeerSettings {
    PeerSettings {
        ping_period: Duration::from_secs(60),
        pong_deadline: Duration::from_secs(120),
        handshake_deadline: Duration::from_secs(5),
        ..PeerSettings::default()
    }
}

pub fn app_state(hub: SharedHub, admission: Arc<AdmissionController>) -> AppState {
    AppState::new(
        hub,
        admission,
        BASE_URL,
        1337,
        quiet_peer_settings(),
        CancellationToken::new(),
    )
}

pub async fn start_http_server(state: AppState) -> std::io::Result<(SocketAddr, ServerHandle)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .workers(1)
    .listen(listener)?
    .run();

    let handle = server.handle();
    actix_rt::spawn(server);
    Ok((addr, handle))
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
