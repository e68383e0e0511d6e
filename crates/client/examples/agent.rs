//! A minimal agent: registers with capabilities, answers incoming tasks.
//!
//! ```sh
//! MESHLINK_WS_URL=wss://mesh.example.com/ws \
//! MESHLINK_PRIVATE_KEY=0x... \
//! cargo run -p meshlink-client --example agent
//! ```

use meshlink_client::MeshClient;
use meshlink_config::{ClientConfig, ClientType};
use meshlink_core::MeshEvent;
use meshlink_core::frame::{Frame, FrameKind};

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
    config.client_type = ClientType::Agent;
    config.capabilities = vec!["echo".into()];

    let client = MeshClient::new(config)?;
    let mut events = client.events();

    client.connect().await?;
    tracing::info!(wallet = ?client.wallet_address(), "agent online");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else { break };
                if let MeshEvent::MessageReceived(frame) = event.as_ref() {
                    if frame.kind != FrameKind::Task {
                        continue;
                    }
                    let task_id = frame
                        .task_id
                        .clone()
                        .or_else(|| frame.data_str("task_id").map(str::to_string));
                    let Some(task_id) = task_id else { continue };
                    tracing::info!(task_id = %task_id, "task received");

                    let mut response = Frame::new(FrameKind::TaskResponse)
                        .with_id(Frame::fresh_id())
                        .with_data(serde_json::json!({
                            "task_id": task_id,
                            "success": true,
                            "result": { "echo": frame.content },
                        }));
                    if let Some(from) = &frame.from {
                        response.to = Some(from.clone());
                    }
                    if let Err(e) = client.send(response).await {
                        tracing::warn!(error = %e, "failed to answer task");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    Ok(())
}
