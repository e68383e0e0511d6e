//! Minimal meshlink client: connect, listen, send one message.
//!
//! ```sh
//! MESHLINK_WS_URL=wss://mesh.example.com/ws \
//! MESHLINK_PRIVATE_KEY=0x... \
//! cargo run -p meshlink-client --example basic
//! ```

use meshlink_client::MeshClient;
use meshlink_config::ClientConfig;
use meshlink_core::MeshEvent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,meshlink=debug".into()),
        )
        .init();

    let ws_url =
        std::env::var("MESHLINK_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".into());
    let mut config = ClientConfig::new(ws_url);
    config.private_key = std::env::var("MESHLINK_PRIVATE_KEY").ok();
    config.auto_join_rooms = vec!["lobby".into()];

    let client = MeshClient::new(config)?;
    let mut events = client.events();

    client.connect().await?;
    tracing::info!(state = ?client.connection_state(), "connected");

    client
        .send_room_message("lobby", "hello from the basic example")
        .await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => match event.as_ref() {
                        MeshEvent::MessageReceived(frame) => {
                            tracing::info!(
                                from = frame.from.as_deref().unwrap_or("<unknown>"),
                                content = frame.content.as_deref().unwrap_or(""),
                                "message"
                            );
                        }
                        MeshEvent::AgentResponse(frame) => {
                            tracing::info!(task = frame.task_id.as_deref().unwrap_or("?"), "task response");
                        }
                        MeshEvent::Error { code, message } => {
                            tracing::warn!(code, message, "client error");
                        }
                        _ => {}
                    },
                    Err(_) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
