//! Per-socket connection state.
//!
//! A [`Connection`] owns the write half of its framed socket; the read half
//! is driven by the connection's lifecycle task. One mutex guards both the
//! closed transition and all writes, so no write can start after logical
//! close and concurrent writes serialize against each other.
//!
//! Logical close and physical teardown are distinct points in time: `close`
//! flips the flag and enqueues the connection on the closing funnel, while
//! the transport is released only when the funnel's consumer runs the
//! teardown job.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::sync::mpsc::WeakSender;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::error::ConnectionError;

pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Fallback pre-close invocation for when the funnel is gone.
pub(crate) type PreCloseHook<C> =
    Box<dyn Fn(Arc<Connection<C>>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Guarded by the connection mutex: the closed flag and the write sink.
struct ConnState {
    closed: bool,
    writer: Option<FrameWriter>,
}

/// One accepted socket and its application-visible state.
///
/// `C` is the application's context type; the snapshot held here is
/// initialized from the server's bootstrap context and wholesale-replaced
/// with the values returned from `on_connected` and `on_join`. Replacement
/// is full substitution, never partial mutation, so the snapshot stays
/// race-free under concurrent message dispatch.
pub struct Connection<C> {
    peer: SocketAddr,
    context: RwLock<Arc<C>>,
    concurrent: AtomicBool,
    read_deadline: SyncMutex<Option<Duration>>,
    state: Mutex<ConnState>,
    closing: CancellationToken,
    funnel: WeakSender<Arc<Connection<C>>>,
    pre_close: PreCloseHook<C>,
}

impl<C> Connection<C> {
    /// Remote peer address, captured at accept time.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl<C: Send + Sync + 'static> Connection<C> {
    pub(crate) fn new(
        peer: SocketAddr,
        bootstrap: Arc<C>,
        writer: FrameWriter,
        funnel: WeakSender<Arc<Connection<C>>>,
        pre_close: PreCloseHook<C>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            context: RwLock::new(bootstrap),
            concurrent: AtomicBool::new(false),
            read_deadline: SyncMutex::new(None),
            state: Mutex::new(ConnState { closed: false, writer: Some(writer) }),
            closing: CancellationToken::new(),
            funnel,
            pre_close,
        })
    }

    /// Current context snapshot.
    pub fn context(&self) -> Arc<C> {
        Arc::clone(&self.context.read())
    }

    pub(crate) fn replace_context(&self, context: C) {
        *self.context.write() = Arc::new(context);
    }

    /// Choose between inline and pooled message dispatch.
    ///
    /// With concurrent dispatch off (the default), message N+1 is read only
    /// after message N's handling and post-action dispatch have completed:
    /// strict in-order, non-overlapping handling. With it on, handling jobs
    /// go to the message pool and may run concurrently and complete out of
    /// order. Intended to be set once, during `on_connected`.
    pub fn set_concurrent_dispatch(&self, concurrent: bool) {
        self.concurrent.store(concurrent, Ordering::Release);
    }

    pub(crate) fn concurrent_dispatch(&self) -> bool {
        self.concurrent.load(Ordering::Acquire)
    }

    /// Bound the time the lifecycle task waits for each frame read.
    ///
    /// There is no built-in idle timeout; an elapsed deadline is treated as
    /// a transport error and closes the connection. `None` removes the
    /// bound. Typically set during `on_connected`.
    pub fn set_read_deadline(&self, deadline: Option<Duration>) {
        *self.read_deadline.lock() = deadline;
    }

    pub(crate) fn read_deadline(&self) -> Option<Duration> {
        *self.read_deadline.lock()
    }

    /// Whether the connection has logically closed.
    ///
    /// Physical teardown may still be pending in the closing funnel.
    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    pub(crate) async fn close_requested(&self) {
        self.closing.cancelled().await;
    }

    /// Write one frame payload.
    ///
    /// Serialized against other writes and against the close transition;
    /// returns [`ConnectionError::AlreadyClosed`] after logical close.
    pub async fn send(&self, payload: Bytes) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ConnectionError::AlreadyClosed);
        }
        match state.writer.as_mut() {
            Some(writer) => Ok(writer.send(payload).await?),
            None => Err(ConnectionError::AlreadyClosed),
        }
    }

    /// Request the connection be closed.
    ///
    /// Idempotent: the first caller performs the logical transition and
    /// enqueues the connection on the closing funnel; every later caller
    /// gets [`ConnectionError::AlreadyClosed`] with no side effects. The
    /// funnel is bounded, so a full queue backpressures the caller. Return
    /// does not mean teardown has completed, only that it will run.
    pub async fn close(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ConnectionError::AlreadyClosed);
        }
        state.closed = true;

        // Enqueue before waking the read loop: the lifecycle task holds a
        // strong funnel sender until it exits, and it cannot exit while the
        // cancellation is still pending, so the upgrade succeeds whenever a
        // lifecycle task exists for this connection.
        let enqueued = match self.funnel.upgrade() {
            Some(tx) => tx.send(Arc::clone(self)).await.is_ok(),
            None => false,
        };
        self.closing.cancel();
        if enqueued {
            return Ok(());
        }

        // No funnel consumer left; run the pre-close hook and release the
        // transport here. The lock is dropped first so the hook may still
        // attempt writes (they fail with AlreadyClosed).
        drop(state);
        tracing::warn!(peer = %self.peer, "closing funnel unavailable, tearing down directly");
        (self.pre_close)(Arc::clone(self)).await;
        let mut state = self.state.lock().await;
        release(&mut state).await;
        Ok(())
    }

    /// Release the transport. Runs once, from the funnel consumer's job.
    pub(crate) async fn teardown(&self) {
        let mut state = self.state.lock().await;
        release(&mut state).await;
        tracing::debug!(peer = %self.peer, "connection torn down");
    }
}

async fn release(state: &mut ConnState) {
    if let Some(mut writer) = state.writer.take() {
        // Flush pending frames and send FIN; read side is dropped by the
        // lifecycle task when it observes the close.
        if let Err(err) = SinkExt::<Bytes>::close(&mut writer).await {
            tracing::debug!(error = %err, "transport shutdown failed");
        }
    }
}
