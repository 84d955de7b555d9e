//! HTTP/WebSocket API layer.
//!
//! Thin handlers over the broadcast hub and service handles: the subscriber
//! socket lives at `/ws` on the HTTP port, plus a `/health` probe. The REST
//! CRUD surface is an external collaborator and not part of this crate.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::calls::tracker::ChannelTracker;
use crate::downstream::StreamerHandle;
use crate::error::{TrunklineError, TrunklineResult};
use crate::hub::BroadcastHub;
use crate::ingest::log_tail::EventRing;
use crate::spectrum::SpectrumHandle;

pub mod http;
pub mod ws;

/// Shared application state for the API layer.
///
/// A thin wrapper holding references to services; all business logic lives
/// in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// Subscription-filtered broadcast hub.
    pub hub: Arc<BroadcastHub>,
    /// Recent control-channel events for late subscribers.
    pub ring: Arc<EventRing>,
    /// Control-channel / active-call tracker for scanner queries.
    pub tracker: Arc<ChannelTracker>,
    /// Spectrum recorder/replayer handle.
    pub spectrum: SpectrumHandle,
    /// Downstream dispatch streamer handle.
    pub streamer: StreamerHandle,
}

/// Binds the HTTP listener and serves until the process shuts down.
///
/// A bind failure here is fatal at startup (exit code 1 in the binary).
pub async fn start_server(state: AppState, addr: SocketAddr) -> TrunklineResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| TrunklineError::Bind {
            endpoint: format!("http {}", addr),
            source,
        })?;

    log::info!("[Server] Listening on http://{}", addr);
    let app = http::create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
