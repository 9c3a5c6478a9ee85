//! In-process server + client harness.

use crate::verifier::StaticVerifier;

use common::{Role, UserId};
use room_client::session::{BoxedStream, Connector, RoomSession, RoomSessionHandle, SessionConfig};
use room_client::MediaTrack;
use room_controller::actors::{ActorMetrics, RoomCoordinatorHandle};
use room_controller::auth::AuthVerifier;
use room_controller::config::Config;
use room_controller::relay::{LoopbackRelay, RelayEngine};
use room_controller::server::SignalingServer;
use std::sync::Arc;

/// One spawned client session plus its identity.
pub struct TestSession {
    pub handle: RoomSessionHandle,
    pub user_id: UserId,
    pub token: String,
}

/// A full in-process deployment: coordinator, signaling server, the
/// loopback relay, and a static verifier. Client sessions connect over
/// `tokio::io::duplex` pipes.
pub struct TestHarness {
    pub coordinator: RoomCoordinatorHandle,
    pub relay: Arc<LoopbackRelay>,
    pub metrics: Arc<ActorMetrics>,
    pub verifier: Arc<StaticVerifier>,
    server: Arc<SignalingServer>,
}

impl TestHarness {
    /// Harness with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Harness with custom timings/limits.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        let metrics = ActorMetrics::new();
        let relay = Arc::new(LoopbackRelay::new());
        let verifier = Arc::new(StaticVerifier::new());
        let coordinator = RoomCoordinatorHandle::new(
            config.clone(),
            Arc::clone(&relay) as Arc<dyn RelayEngine>,
            Arc::clone(&metrics),
        );
        let server = Arc::new(SignalingServer::new(
            coordinator.clone(),
            Arc::clone(&verifier) as Arc<dyn AuthVerifier>,
            Arc::clone(&metrics),
            &config,
        ));

        Self {
            coordinator,
            relay,
            metrics,
            verifier,
            server,
        }
    }

    /// A connector that dials this harness's server: each call opens a
    /// fresh duplex pipe and serves the far end.
    #[must_use]
    pub fn connector(&self) -> Connector {
        let server = Arc::clone(&self.server);
        Arc::new(move || {
            let server = Arc::clone(&server);
            Box::pin(async move {
                let (client_end, server_end) = tokio::io::duplex(256 * 1024);
                tokio::spawn(async move {
                    server.serve_connection(server_end).await;
                });
                Ok(Box::new(client_end) as BoxedStream)
            })
        })
    }

    /// Register a user and spawn a session for them.
    pub async fn spawn_session(&self, display_name: &str) -> TestSession {
        self.spawn_session_with(display_name, None, Vec::new()).await
    }

    /// Register a user with a role claim and local tracks, then spawn
    /// their session.
    pub async fn spawn_session_with(
        &self,
        display_name: &str,
        role_claim: Option<Role>,
        local_tracks: Vec<MediaTrack>,
    ) -> TestSession {
        let (token, user_id) = self.verifier.register(display_name, role_claim);
        let mut config = SessionConfig::new(token.clone(), display_name);
        config.local_tracks = local_tracks;
        let (handle, _task) = RoomSession::spawn(config, self.connector());

        TestSession {
            handle,
            user_id,
            token,
        }
    }

    /// Spawn a session from an explicit config (auto-rejoin tests).
    #[must_use]
    pub fn spawn_session_from_config(&self, config: SessionConfig) -> RoomSessionHandle {
        let (handle, _task) = RoomSession::spawn(config, self.connector());
        handle
    }

    /// Shut the deployment down.
    pub async fn shutdown(&self) {
        let _ = self.coordinator.shutdown().await;
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
