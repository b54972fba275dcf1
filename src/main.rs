//! Partybridge Host
//!
//! Hosts one session: prints the room code, mirrors lobby state to
//! every phone that joins, and logs relayed commands and the merged
//! input stream.

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use partybridge::{
    MemoryRoster, ServerConfig, SessionEvent, SessionServer, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("Partybridge v{}", VERSION);

    let config = ServerConfig::default();
    let (server, mut io) = match SessionServer::host(
        config.clone(),
        MemoryRoster::with_default_locals(),
    )
    .await
    {
        Ok(hosted) => hosted,
        Err(e) => {
            // Room-code collision on the derived port is rare; one
            // fresh code is enough in practice.
            warn!("hosting failed ({e}), retrying with a fresh code");
            SessionServer::host(config, MemoryRoster::with_default_locals()).await?
        }
    };

    info!("Room code: {}", server.room().code());
    info!("Listening on {} (path /{})", server.local_addr(), server.room().address());

    loop {
        tokio::select! {
            Some(event) = io.events.recv() => match event {
                SessionEvent::PlayerSetChanged => {
                    info!(lag_ms = server.system_lag_ms(), "player set changed");
                    server.broadcast("LOBBY", "LOBBY", serde_json::Map::new()).await;
                }
                SessionEvent::Command { player_id, action, payload } => {
                    info!(player_id, %action, ?payload, "client command");
                }
            },
            Some(input) = io.inputs.recv() => {
                info!(player_id = input.player_id, action = %input.action, "input dispatched");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                server.shutdown();
                break;
            }
        }
    }

    Ok(())
}
