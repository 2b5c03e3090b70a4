//! Reusable core for framed-TCP servers.
//!
//! Framegate owns the connection lifecycle over length-delimited TCP frames
//! and dispatches pluggable application callbacks for connect, join,
//! message, and close events. Two failure-prone paths are isolated from the
//! hot accept/read paths through asynchronous, bounded funnels:
//!
//! - the **error landfill** decouples failure reporting from the code that
//!   detected the failure;
//! - the **closing funnel** guarantees exactly-once pre-close hook execution
//!   and transport teardown per connection.
//!
//! The payload is opaque bytes: framegate defines no application wire
//! protocol, no multiplexing, no authentication, and no keepalive policy.
//! Applications supply an [`EventHandler`], a [`PostActionHandler`], and
//! optionally their own [`MessageCodec`], then call [`serve`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use framegate::{
//!     Connection, ErrorAction, EventHandler, FatError, FrameConfig, PostActionHandler,
//!     RawCodec, Server,
//! };
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl EventHandler for Echo {
//!     type Context = ();
//!     type Action = bool; // "close?"
//!     type Codec = RawCodec;
//!
//!     async fn on_connected(&self, _conn: &Arc<Connection<()>>) -> ((), bool) {
//!         ((), false)
//!     }
//!     async fn on_join(&self, _conn: &Arc<Connection<()>>, _first: Bytes) -> ((), bool) {
//!         ((), false)
//!     }
//!     async fn on_message(&self, conn: &Arc<Connection<()>>, message: Bytes) -> bool {
//!         conn.send(message).await.is_err()
//!     }
//!     async fn on_before_close(&self, _conn: &Arc<Connection<()>>) {}
//!     async fn on_error_print(&self, _ctx: &(), _error: &FatError<()>) {}
//!     async fn on_error_save(&self, _ctx: &(), _error: &FatError<()>) {}
//!     async fn on_parsing_failed(&self, _conn: &Arc<Connection<()>>, _raw: Bytes) {}
//! }
//!
//! struct CloseOnRequest;
//!
//! #[async_trait]
//! impl PostActionHandler<Echo> for CloseOnRequest {
//!     async fn on_post_action(&self, close: bool, conn: &Arc<Connection<()>>) {
//!         if close {
//!             let _ = conn.close().await;
//!         }
//!     }
//! }
//!
//! # async fn run() -> Result<(), framegate::ServeError> {
//! let server = Server::new((), FrameConfig::big_endian(), Echo, CloseOnRequest);
//! framegate::serve(server, "0.0.0.0:7400", ErrorAction::Print).await
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conn;
mod error;
mod funnel;
mod handler;
mod landfill;
mod pool;
mod server;

pub use codec::{
    ByteOrder, FrameConfig, MessageCodec, RawCodec, TaggedCodec, TaggedMessage,
};
pub use conn::Connection;
pub use error::{
    ConnectionError, DecodeError, LandfillClosed, PoolError, ServeError, TaskPanic,
};
pub use handler::{ErrorAction, EventHandler, FatError, MessageOf, PostActionHandler};
pub use landfill::{DEFAULT_QUEUE_CAPACITY, LandfillHandle};
pub use pool::{DEFAULT_POOL_WORKERS, TaskPool};
pub use server::{Server, ServerConfig, serve, serve_listener, serve_with_shutdown};

pub use tokio_util::sync::CancellationToken;
