//! Echo server built on framegate.
//!
//! Clients speak tagged frames: a 4-byte big-endian length prefix, then a
//! 2-byte protocol id, then the payload. The first frame names the client;
//! every later frame is echoed back. An empty payload is treated as an
//! application error and routed through the landfill.
//!
//! # Usage
//!
//! ```bash
//! framegate-echo --bind 0.0.0.0:7400
//! printf '\x00\x00\x00\x07\x00\x01mallory' | nc localhost 7400
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use framegate::{
    CancellationToken, Connection, ErrorAction, EventHandler, FatError, FrameConfig,
    LandfillHandle, MessageCodec, PostActionHandler, Server, TaggedCodec, TaggedMessage,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Framegate echo server
#[derive(Parser, Debug)]
#[command(name = "framegate-echo")]
#[command(about = "Echo server demonstrating framegate lifecycle callbacks")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:7400")]
    bind: String,

    /// Use a little-endian length prefix instead of big-endian
    #[arg(long)]
    little_endian: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// What the echo application does after each callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EchoAction {
    /// Nothing further.
    None,
    /// Close the connection.
    Close,
    /// Misbehaving client: log and close.
    Block,
}

struct EchoHandler {
    landfill: Arc<OnceLock<LandfillHandle<String>>>,
}

#[async_trait]
impl EventHandler for EchoHandler {
    type Context = String;
    type Action = EchoAction;
    type Codec = TaggedCodec;

    async fn on_connected(&self, conn: &Arc<Connection<String>>) -> (String, EchoAction) {
        // Clients get 30 seconds per frame; echoing is cheap, so messages
        // are handled inline in arrival order.
        conn.set_read_deadline(Some(Duration::from_secs(30)));
        conn.set_concurrent_dispatch(false);
        tracing::info!(peer = %conn.peer_addr(), "connected");
        ("anonymous".to_string(), EchoAction::None)
    }

    async fn on_join(
        &self,
        conn: &Arc<Connection<String>>,
        first: TaggedMessage,
    ) -> (String, EchoAction) {
        let name = String::from_utf8_lossy(&first.payload).into_owned();
        tracing::info!(peer = %conn.peer_addr(), %name, "joined");

        let welcome = TaggedMessage::new(first.protocol, format!("welcome {name}").into_bytes());
        if conn.send(TaggedCodec.encode(&welcome)).await.is_err() {
            return (name, EchoAction::Close);
        }
        (name, EchoAction::None)
    }

    async fn on_message(
        &self,
        conn: &Arc<Connection<String>>,
        message: TaggedMessage,
    ) -> EchoAction {
        if message.payload.is_empty() {
            if let Some(landfill) = self.landfill.get() {
                let report = FatError::new(
                    std::io::Error::other(format!("{} sent an empty payload", conn.context())),
                    ErrorAction::Print,
                    Some(Arc::clone(conn)),
                );
                let _ = landfill.report(report).await;
            }
            return EchoAction::Block;
        }

        tracing::debug!(peer = %conn.peer_addr(), name = %conn.context(), protocol = message.protocol, "echoing");
        if conn.send(TaggedCodec.encode(&message)).await.is_err() {
            return EchoAction::Close;
        }
        EchoAction::None
    }

    async fn on_before_close(&self, conn: &Arc<Connection<String>>) {
        tracing::info!(peer = %conn.peer_addr(), name = %conn.context(), "leaving");
    }

    async fn on_error_print(&self, _ctx: &String, error: &FatError<String>) {
        tracing::error!(error = %error, "reported error");
    }

    async fn on_error_save(&self, _ctx: &String, error: &FatError<String>) {
        // A real application would write to durable storage here.
        tracing::warn!(error = %error, "error marked for storage");
    }

    async fn on_parsing_failed(&self, conn: &Arc<Connection<String>>, raw: Bytes) {
        tracing::warn!(peer = %conn.peer_addr(), bytes = raw.len(), "unparseable frame");
    }
}

struct EchoDispatch;

#[async_trait]
impl PostActionHandler<EchoHandler> for EchoDispatch {
    async fn on_post_action(&self, action: EchoAction, conn: &Arc<Connection<String>>) {
        match action {
            EchoAction::None => {}
            EchoAction::Close => {
                let _ = conn.close().await;
            }
            EchoAction::Block => {
                tracing::warn!(peer = %conn.peer_addr(), "blocking misbehaving client");
                let _ = conn.close().await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let frame = if args.little_endian {
        FrameConfig::little_endian()
    } else {
        FrameConfig::big_endian()
    };

    let landfill_slot = Arc::new(OnceLock::new());
    let handler = EchoHandler { landfill: Arc::clone(&landfill_slot) };
    let server = Server::new("anonymous".to_string(), frame, handler, EchoDispatch);
    let _ = landfill_slot.set(server.landfill());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, shutting down");
                shutdown.cancel();
            }
        });
    }

    tracing::info!(bind = %args.bind, "echo server starting");
    framegate::serve_with_shutdown(server, &args.bind, ErrorAction::Print, shutdown).await?;
    Ok(())
}
