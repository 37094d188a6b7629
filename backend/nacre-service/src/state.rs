use crate::admission::AdmissionController;
use crate::hub::SharedHub;
use crate::websocket::PeerSettings;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared by every HTTP worker.
#[derive(Clone)]
pub struct AppState {
    pub hub: SharedHub,
    pub admission: Arc<AdmissionController>,
    /// Public URL prefix, without a trailing slash.
    pub base_url: String,
    /// Port producers connect to, shown on the home page.
    pub tcp_port: u16,
    pub peer_settings: PeerSettings,
    /// Cancelled when the process begins shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        hub: SharedHub,
        admission: Arc<AdmissionController>,
        base_url: &str,
        tcp_port: u16,
        peer_settings: PeerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub,
            admission,
            base_url: base_url.trim_end_matches('/').to_string(),
            tcp_port,
            peer_settings,
            shutdown,
        }
    }
}
