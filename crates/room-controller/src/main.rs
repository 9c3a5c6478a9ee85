//! Room Controller
//!
//! Stateful signaling server for real-time room coordination.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize the actor system (`RoomCoordinatorHandle`)
//! 3. Bind the signaling listener and serve connections
//! 4. Wait for SIGTERM/ctrl-c, then drain gracefully
//!
//! The relay engine is wired as the in-process loopback stand-in; a
//! production deployment links the controller library against a real
//! engine implementing [`room_controller::relay::RelayEngine`].

#![warn(clippy::pedantic)]

use std::sync::Arc;

use room_controller::actors::{ActorMetrics, RoomCoordinatorHandle};
use room_controller::auth::InsecureDevVerifier;
use room_controller::config::Config;
use room_controller::relay::LoopbackRelay;
use room_controller::server::SignalingServer;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_controller=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Room Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        max_rooms = config.max_rooms,
        max_participants = config.max_participants,
        disconnect_grace_s = config.disconnect_grace.as_secs(),
        empty_room_grace_s = config.empty_room_grace.as_secs(),
        "Configuration loaded successfully"
    );

    // Initialize actor system
    let metrics = ActorMetrics::new();
    let relay = Arc::new(LoopbackRelay::new());
    let coordinator = RoomCoordinatorHandle::new(config.clone(), relay, Arc::clone(&metrics));

    // Bind the signaling listener
    let listener = TcpListener::bind(&config.bind_address).await.map_err(|e| {
        error!(error = %e, bind_address = %config.bind_address, "Failed to bind listener");
        e
    })?;
    info!(bind_address = %config.bind_address, "Signaling listener bound");

    let server = Arc::new(SignalingServer::new(
        coordinator.clone(),
        Arc::new(InsecureDevVerifier),
        Arc::clone(&metrics),
        &config,
    ));
    let accept_task = tokio::spawn(Arc::clone(&server).listen(listener));

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    coordinator.shutdown().await?;
    accept_task.await?;

    info!("Room Controller stopped");
    Ok(())
}
