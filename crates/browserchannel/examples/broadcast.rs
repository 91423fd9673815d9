//! Chat-style demo: every map uploaded by any session is broadcast to all
//! live sessions as a JSON array.
//!
//! ```sh
//! cargo run --example broadcast -- 127.0.0.1:8080
//! ```

use std::{collections::HashMap, sync::Arc};

use browserchannel::{BrowserChannelServer, Channel, SessionId};
use tokio::sync::RwLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Channels = Arc<RwLock<HashMap<SessionId, Channel>>>;

async fn broadcast(channels: &Channels, message: serde_json::Value) {
    for channel in channels.read().await.values() {
        let _ = channel.send_array(vec![message.clone()]);
    }
}

async fn handle_channel(channels: Channels, channel: Channel) {
    let sid = channel.session_id();
    tracing::info!(%sid, "channel connected");
    channels.write().await.insert(sid, channel.clone());

    while let Some(map) = channel.read_map().await {
        tracing::info!(%sid, ?map, "received map");
        let message = serde_json::to_value(map).unwrap_or_default();
        broadcast(&channels, message).await;
    }

    tracing::info!(%sid, "channel closed");
    channels.write().await.remove(&sid);
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let bind = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .parse()
        .expect("bind address");

    let mut server = BrowserChannelServer::serve(bind).await?;
    tracing::info!(bind = %server.config.bind, "browser channel server listening");

    let channels: Channels = Arc::new(RwLock::new(HashMap::new()));
    while let Some(channel) = server.accept().await {
        tokio::spawn(handle_channel(channels.clone(), channel));
    }
    Ok(())
}
