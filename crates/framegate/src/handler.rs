//! Application-supplied capability traits.
//!
//! The core drives [`EventHandler`] through the connection lifecycle and
//! forwards every returned action token, uninspected, to
//! [`PostActionHandler::on_post_action`]. The action vocabulary is entirely
//! the application's; the core only recognizes "connection now closed" and
//! observes that through the connection's closed flag, never by decoding an
//! action.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::codec::MessageCodec;
use crate::conn::Connection;

/// Message type produced by a handler's codec.
pub type MessageOf<H> = <<H as EventHandler>::Codec as MessageCodec>::Message;

/// Triage decision attached to a [`FatError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorAction {
    /// Dequeue and drop without dispatching a handler.
    #[default]
    None,
    /// Dispatch [`EventHandler::on_error_print`].
    Print,
    /// Dispatch [`EventHandler::on_error_save`].
    Save,
}

/// A reportable error routed through the landfill.
///
/// Produced anywhere (accept loop, connection tasks, the application
/// itself), consumed only by the landfill's triage loop. `conn` is absent
/// for errors not tied to one connection, such as accept failures.
pub struct FatError<C> {
    cause: Box<dyn Error + Send + Sync>,
    action: ErrorAction,
    conn: Option<Arc<Connection<C>>>,
}

impl<C> FatError<C> {
    /// Wrap an error with its triage action and originating connection.
    pub fn new(
        cause: impl Into<Box<dyn Error + Send + Sync>>,
        action: ErrorAction,
        conn: Option<Arc<Connection<C>>>,
    ) -> Self {
        Self { cause: cause.into(), action, conn }
    }

    /// The underlying cause.
    pub fn cause(&self) -> &(dyn Error + Send + Sync) {
        self.cause.as_ref()
    }

    /// The triage action chosen by the producer.
    pub fn action(&self) -> ErrorAction {
        self.action
    }

    /// The originating connection, if any.
    pub fn conn(&self) -> Option<&Arc<Connection<C>>> {
        self.conn.as_ref()
    }
}

impl<C> fmt::Display for FatError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.cause.fmt(f)
    }
}

impl<C> fmt::Debug for FatError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatError")
            .field("cause", &self.cause)
            .field("action", &self.action)
            .field("peer", &self.conn.as_ref().map(|c| c.peer_addr()))
            .finish()
    }
}

/// Lifecycle and error callbacks for one server.
///
/// One implementation per application. Per connection the core guarantees:
/// `on_connected` fires exactly once, `on_join` at most once and only after
/// `on_connected`, `on_message` zero or more times and only after `on_join`,
/// and `on_before_close` exactly once, strictly after all of the above.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Per-connection context snapshot. Initialized from the server's
    /// bootstrap context and wholesale-replaced by the values returned from
    /// `on_connected` and `on_join`.
    type Context: Send + Sync + 'static;

    /// Opaque outcome token forwarded to the [`PostActionHandler`].
    type Action: Send + 'static;

    /// Message codec applied to every frame after the transport strips the
    /// length prefix.
    type Codec: MessageCodec + Default;

    /// A socket was accepted. Returns the replacement context and an action.
    ///
    /// This is the place to set the connection's dispatch mode and read
    /// deadline; the dispatch mode is fixed once the first frame arrives.
    async fn on_connected(
        &self,
        conn: &Arc<Connection<Self::Context>>,
    ) -> (Self::Context, Self::Action);

    /// The first frame arrived and decoded. Returns the replacement context
    /// (carrying e.g. authentication state) and an action.
    async fn on_join(
        &self,
        conn: &Arc<Connection<Self::Context>>,
        first: MessageOf<Self>,
    ) -> (Self::Context, Self::Action);

    /// A frame after the first arrived and decoded.
    async fn on_message(
        &self,
        conn: &Arc<Connection<Self::Context>>,
        message: MessageOf<Self>,
    ) -> Self::Action;

    /// The connection is about to be torn down. Runs exactly once, from the
    /// closing funnel's consumer, before the transport is released.
    async fn on_before_close(&self, conn: &Arc<Connection<Self::Context>>);

    /// A landfill error triaged with [`ErrorAction::Print`].
    async fn on_error_print(
        &self,
        server_context: &Self::Context,
        error: &FatError<Self::Context>,
    );

    /// A landfill error triaged with [`ErrorAction::Save`].
    async fn on_error_save(
        &self,
        server_context: &Self::Context,
        error: &FatError<Self::Context>,
    );

    /// A frame arrived but its payload failed to decode. During the join
    /// stage the connection is closed afterwards; during the message loop
    /// it keeps running.
    async fn on_parsing_failed(&self, conn: &Arc<Connection<Self::Context>>, raw: Bytes);
}

/// Receiver of the opaque action token returned by every event callback.
#[async_trait]
pub trait PostActionHandler<H: EventHandler>: Send + Sync + 'static {
    /// Called with the verbatim action after each lifecycle callback.
    async fn on_post_action(&self, action: H::Action, conn: &Arc<Connection<H::Context>>);
}
