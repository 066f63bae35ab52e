//! Tether smoke client.
//!
//! Connects to a server over QUIC, logs every connection change and event
//! it sees, optionally sends one message, and disconnects.
//!
//! # Usage
//!
//! ```bash
//! # Anonymous, listen for 30 seconds against a dev server
//! tether-smoke --endpoint 127.0.0.1:4433 --api-key dev --insecure
//!
//! # As a user, sending one message
//! tether-smoke --endpoint 127.0.0.1:4433 --api-key dev --insecure \
//!     --user-id alice --token "$TOKEN" --channel messaging:general --text "hello"
//! ```

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::Parser;
use tether_client::{
    AttachmentUploader, ChatError, ConnectRequest, ConnectionConfig, ConnectionState, EventHub,
    SendPipeline, SystemEnv, UserCredentials,
    error_handler::{ErrorHandlerChain, offline::offline_handlers},
    repository::MemoryRepository,
    socket,
    transport::quic::{QuicConfig, QuicTransportFactory},
};
use tether_core::{Attachment, OutboundMessage};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tether realtime smoke client
#[derive(Parser, Debug)]
#[command(name = "tether-smoke")]
#[command(about = "Connect to a tether server, listen and send one message")]
#[command(version)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:4433")]
    endpoint: String,

    /// Application API key
    #[arg(short, long)]
    api_key: String,

    /// Connect as this user (requires --token)
    #[arg(long, requires = "token")]
    user_id: Option<String>,

    /// Auth token for --user-id
    #[arg(long)]
    token: Option<String>,

    /// TLS server name
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Skip certificate verification (development servers only)
    #[arg(long)]
    insecure: bool,

    /// Channel to send to
    #[arg(long, default_value = "messaging:general")]
    channel: String,

    /// Message to send once connected
    #[arg(long)]
    text: Option<String>,

    /// Seconds to wait for the connection
    #[arg(long, default_value = "10")]
    connect_timeout_secs: u64,

    /// Seconds to keep listening before disconnecting
    #[arg(long, default_value = "30")]
    duration_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// The smoke client never sends attachments.
struct NoUploads;

#[async_trait]
impl AttachmentUploader for NoUploads {
    async fn enqueue(
        &self,
        _message: &OutboundMessage,
        attachments: &[Attachment],
    ) -> Result<(), ChatError> {
        let id = attachments.first().map(|a| a.id.clone()).unwrap_or_default();
        Err(ChatError::AttachmentUpload { attachment_id: id, reason: "uploads disabled".into() })
    }

    async fn cancel(&self, _message_id: &str) {}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    if args.insecure {
        tracing::warn!("Certificate verification disabled");
    }

    let factory = QuicTransportFactory::from_config(&QuicConfig {
        server_name: args.server_name.clone(),
        insecure: args.insecure,
        ..QuicConfig::default()
    })?;
    let socket = socket::spawn(SystemEnv, Arc::new(factory), ConnectionConfig::default(), None);

    let hub = EventHub::new(Arc::new(socket.clone()));
    let subscription = hub.subscribe([], |event| {
        tracing::info!(event_type = event.event_type(), cid = ?event.cid(), "event");
    });

    let user = match (args.user_id, args.token) {
        (Some(user_id), Some(token)) => Some(UserCredentials { user_id, token }),
        _ => None,
    };
    let request = ConnectRequest { endpoint: args.endpoint.clone(), api_key: args.api_key, user };
    socket.connect(request)?;
    tracing::info!("Connecting to {}", args.endpoint);

    let mut state = socket.watch_state();
    let settled = tokio::time::timeout(
        Duration::from_secs(args.connect_timeout_secs),
        state.wait_for(|s| match s {
            ConnectionState::Connected(_) => true,
            ConnectionState::Disconnected { will_reconnect } => !will_reconnect,
            ConnectionState::Connecting | ConnectionState::Error(_) => false,
        }),
    )
    .await;

    match settled.map(|s| s.map(|s| s.clone())) {
        Ok(Ok(ConnectionState::Connected(session))) => {
            tracing::info!(connection_id = %session.connection_id, "Connected");
        },
        Ok(Ok(other)) => {
            tracing::error!(state = ?other, "Connection rejected");
            return Err("connection rejected".into());
        },
        Ok(Err(_)) | Err(_) => {
            tracing::error!("Timed out waiting for the connection");
            socket.disconnect().await?;
            return Err("connect timeout".into());
        },
    }

    if let Some(text) = args.text {
        let repository = Arc::new(MemoryRepository::new());
        let pipeline = SendPipeline::new(
            SystemEnv,
            repository.clone(),
            Arc::new(NoUploads),
            Arc::new(socket.clone()),
            Arc::new(socket.clone()),
            ErrorHandlerChain::new(offline_handlers(repository, SystemEnv)),
        );

        match pipeline.send(OutboundMessage::new(args.channel, text)).await {
            Ok(outcome) => tracing::info!(
                message_id = %outcome.message().id,
                status = ?outcome.sync_status(),
                "Message sent"
            ),
            Err(e) => tracing::error!(error = %e, "Send failed"),
        }
    }

    tokio::time::sleep(Duration::from_secs(args.duration_secs)).await;

    subscription.dispose();
    socket.disconnect().await?;
    tracing::info!("Disconnected");
    Ok(())
}
