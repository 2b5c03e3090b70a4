//! Server construction, the accept loop, and the per-connection lifecycle.
//!
//! # Lifecycle state machine
//!
//! ```text
//! ┌────────────┐ on_connected ┌─────────┐ first frame ┌───────────┐
//! │ Connecting │─────────────>│ Joining │────────────>│ Messaging │
//! └────────────┘              └─────────┘   on_join   └───────────┘
//!        │                         │                        │
//!        │ closed by action        │ transport/parse error  │ transport error,
//!        ↓                         ↓                        ↓ close action
//! ┌──────────────────┐   funnel consumer:   ┌────────┐
//! │ ClosingRequested │─────────────────────>│ Closed │
//! └──────────────────┘  before_close + drop └────────┘
//! ```
//!
//! One task per accepted socket drives the machine; every callback's action
//! token is forwarded to the post-action handler, and "connection now
//! closed" is observed through the connection's closed flag, never by
//! decoding the token. Each task and each pool job runs inside a recovery
//! boundary: a panic is reported and force-closes the owning connection but
//! never reaches the process, the accept loop, or unrelated connections.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::codec::{FrameConfig, MessageCodec};
use crate::conn::{Connection, PreCloseHook};
use crate::error::{ServeError, TaskPanic, is_transient_accept_error};
use crate::funnel::start_close_triage;
use crate::handler::{ErrorAction, EventHandler, FatError, PostActionHandler};
use crate::landfill::{DEFAULT_QUEUE_CAPACITY, LandfillHandle, start_error_triage};
use crate::pool::{DEFAULT_POOL_WORKERS, TaskPool, panic_message};

/// Queue and pool sizing.
///
/// The three pools are deliberately independent instances so that one
/// subsystem's backlog cannot starve another's workers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of the landfill and closing-funnel queues.
    pub queue_capacity: usize,
    /// Worker budget for pooled message dispatch.
    pub message_workers: usize,
    /// Worker budget for error handler invocations.
    pub error_workers: usize,
    /// Worker budget for close handler invocations.
    pub close_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            message_workers: DEFAULT_POOL_WORKERS,
            error_workers: DEFAULT_POOL_WORKERS,
            close_workers: DEFAULT_POOL_WORKERS,
        }
    }
}

/// A framed-TCP server: handlers, frame parameters, queues, and pools.
///
/// Immutable after construction; configuration is shared read-only across
/// all connection tasks. The queues and pools are explicit owned fields,
/// created here and passed by reference to the components that use them.
pub struct Server<H: EventHandler, P: PostActionHandler<H>> {
    bootstrap: Arc<H::Context>,
    frame: FrameConfig,
    codec: Arc<H::Codec>,
    handler: Arc<H>,
    post: Arc<P>,
    message_pool: Arc<TaskPool>,
    error_pool: Arc<TaskPool>,
    close_pool: Arc<TaskPool>,
    landfill_tx: mpsc::Sender<FatError<H::Context>>,
    landfill_rx: mpsc::Receiver<FatError<H::Context>>,
    funnel_tx: mpsc::Sender<Arc<Connection<H::Context>>>,
    funnel_rx: mpsc::Receiver<Arc<Connection<H::Context>>>,
}

impl<H, P> Server<H, P>
where
    H: EventHandler,
    P: PostActionHandler<H>,
{
    /// Create a server with default queue and pool sizing.
    pub fn new(bootstrap: H::Context, frame: FrameConfig, handler: H, post: P) -> Self {
        Self::with_config(bootstrap, frame, handler, post, ServerConfig::default())
    }

    /// Create a server with explicit queue and pool sizing.
    pub fn with_config(
        bootstrap: H::Context,
        frame: FrameConfig,
        handler: H,
        post: P,
        config: ServerConfig,
    ) -> Self {
        let (landfill_tx, landfill_rx) = mpsc::channel(config.queue_capacity);
        let (funnel_tx, funnel_rx) = mpsc::channel(config.queue_capacity);
        Self {
            bootstrap: Arc::new(bootstrap),
            frame,
            codec: Arc::new(H::Codec::default()),
            handler: Arc::new(handler),
            post: Arc::new(post),
            message_pool: Arc::new(TaskPool::new("messages", config.message_workers)),
            error_pool: Arc::new(TaskPool::new("errors", config.error_workers)),
            close_pool: Arc::new(TaskPool::new("closes", config.close_workers)),
            landfill_tx,
            landfill_rx,
            funnel_tx,
            funnel_rx,
        }
    }

    /// Producer handle to the error landfill.
    ///
    /// Clone this before serving to push application-raised errors.
    pub fn landfill(&self) -> LandfillHandle<H::Context> {
        LandfillHandle::new(self.landfill_tx.clone())
    }
}

/// Run the server on `addr` until a fatal listen failure.
///
/// Starts the two triage consumers, then runs the accept loop. Transient
/// accept errors are wrapped as a [`FatError`] with `default_accept_action`
/// and no connection, pushed into the landfill, and the loop continues.
/// Non-transient accept errors end the loop and are returned; connections
/// accepted earlier keep running.
pub async fn serve<H, P>(
    server: Server<H, P>,
    addr: &str,
    default_accept_action: ErrorAction,
) -> Result<(), ServeError>
where
    H: EventHandler,
    P: PostActionHandler<H>,
{
    serve_with_shutdown(server, addr, default_accept_action, CancellationToken::new()).await
}

/// [`serve`], stopping gracefully when `shutdown` is cancelled.
///
/// On cancellation the accept loop stops and `Ok(())` is returned.
/// Connections accepted earlier keep running on their own tasks with their
/// lifecycle contracts intact, including the exactly-once pre-close hook.
pub async fn serve_with_shutdown<H, P>(
    server: Server<H, P>,
    addr: &str,
    default_accept_action: ErrorAction,
    shutdown: CancellationToken,
) -> Result<(), ServeError>
where
    H: EventHandler,
    P: PostActionHandler<H>,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr: addr.to_string(), source })?;
    serve_listener(server, listener, default_accept_action, shutdown).await
}

/// Run the server on an already-bound listener.
///
/// Useful when the caller needs the bound address first, e.g. after binding
/// port 0.
pub async fn serve_listener<H, P>(
    server: Server<H, P>,
    listener: TcpListener,
    default_accept_action: ErrorAction,
    shutdown: CancellationToken,
) -> Result<(), ServeError>
where
    H: EventHandler,
    P: PostActionHandler<H>,
{
    let Server {
        bootstrap,
        frame,
        codec,
        handler,
        post,
        message_pool,
        error_pool,
        close_pool,
        landfill_tx,
        landfill_rx,
        funnel_tx,
        funnel_rx,
    } = server;

    let _error_triage =
        start_error_triage(landfill_rx, error_pool, Arc::clone(&handler), Arc::clone(&bootstrap));
    let _close_triage = start_close_triage(funnel_rx, close_pool, Arc::clone(&handler));

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "listening");
    }

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => {
                tracing::info!("shutdown requested, accept loop stopping");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                spawn_connection(
                    stream,
                    peer,
                    &frame,
                    &bootstrap,
                    &codec,
                    &handler,
                    &post,
                    &message_pool,
                    landfill_tx.clone(),
                    &funnel_tx,
                    default_accept_action,
                );
            }
            Err(err) if is_transient_accept_error(&err) => {
                tracing::debug!(error = %err, "transient accept failure");
                let report = FatError::new(err, default_accept_action, None);
                if landfill_tx.send(report).await.is_err() {
                    tracing::warn!("landfill closed, dropping accept error report");
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "accept failed, stopping");
                return Err(ServeError::Accept(err));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_connection<H, P>(
    stream: TcpStream,
    peer: SocketAddr,
    frame: &FrameConfig,
    bootstrap: &Arc<H::Context>,
    codec: &Arc<H::Codec>,
    handler: &Arc<H>,
    post: &Arc<P>,
    message_pool: &Arc<TaskPool>,
    landfill: mpsc::Sender<FatError<H::Context>>,
    funnel: &mpsc::Sender<Arc<Connection<H::Context>>>,
    default_action: ErrorAction,
) where
    H: EventHandler,
    P: PostActionHandler<H>,
{
    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::new(read_half, frame.build());
    let writer = FramedWrite::new(write_half, frame.build());
    let pre_close: PreCloseHook<H::Context> = {
        let handler = Arc::clone(handler);
        Box::new(move |conn| {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler.on_before_close(&conn).await })
        })
    };
    let conn = Connection::new(peer, Arc::clone(bootstrap), writer, funnel.downgrade(), pre_close);

    let codec = Arc::clone(codec);
    let handler = Arc::clone(handler);
    let post = Arc::clone(post);
    let message_pool = Arc::clone(message_pool);
    let funnel = funnel.clone();

    tokio::spawn(async move {
        // Held until the task exits so close() can always reach the funnel,
        // even after the accept loop has returned.
        let _funnel = funnel;
        tracing::debug!(%peer, "connection accepted");
        let task = run_connection(
            Arc::clone(&conn),
            reader,
            codec,
            handler,
            post,
            message_pool,
            landfill.clone(),
            default_action,
        );
        if let Err(payload) = AssertUnwindSafe(task).catch_unwind().await {
            let message = panic_message(payload.as_ref());
            tracing::error!(%peer, panic = %message, "connection task panicked");
            let report =
                FatError::new(TaskPanic(message), default_action, Some(Arc::clone(&conn)));
            if landfill.send(report).await.is_err() {
                tracing::warn!("landfill closed, dropping panic report");
            }
            let _ = conn.close().await;
        }
    });
}

/// Drive one connection through Connecting, Joining, and Messaging.
#[allow(clippy::too_many_arguments)]
async fn run_connection<H, P>(
    conn: Arc<Connection<H::Context>>,
    mut reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    codec: Arc<H::Codec>,
    handler: Arc<H>,
    post: Arc<P>,
    message_pool: Arc<TaskPool>,
    landfill: mpsc::Sender<FatError<H::Context>>,
    default_action: ErrorAction,
) where
    H: EventHandler,
    P: PostActionHandler<H>,
{
    // Connecting
    let (context, action) = handler.on_connected(&conn).await;
    conn.replace_context(context);
    post.on_post_action(action, &conn).await;
    if conn.is_closed() {
        return;
    }

    // Joining. A connection that cannot parse its first frame can never
    // reach a valid joined state, so a parse failure here closes it.
    let Some(raw) = next_frame(conn.as_ref(), &mut reader).await else {
        let _ = conn.close().await;
        return;
    };
    let first = match codec.decode(raw.clone()) {
        Ok(message) => message,
        Err(err) => {
            tracing::debug!(peer = %conn.peer_addr(), error = %err, "first frame failed to parse");
            handler.on_parsing_failed(&conn, raw).await;
            let _ = conn.close().await;
            return;
        }
    };
    let (context, action) = handler.on_join(&conn, first).await;
    conn.replace_context(context);
    post.on_post_action(action, &conn).await;
    if conn.is_closed() {
        return;
    }

    // Messaging. Parse failures are reported and the loop continues.
    loop {
        let Some(raw) = next_frame(conn.as_ref(), &mut reader).await else {
            let _ = conn.close().await;
            return;
        };
        let message = match codec.decode(raw.clone()) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(peer = %conn.peer_addr(), error = %err, "frame failed to parse");
                handler.on_parsing_failed(&conn, raw).await;
                continue;
            }
        };

        let job = {
            let handler = Arc::clone(&handler);
            let post = Arc::clone(&post);
            let conn = Arc::clone(&conn);
            let landfill = landfill.clone();
            async move {
                let work = async {
                    let action = handler.on_message(&conn, message).await;
                    post.on_post_action(action, &conn).await;
                };
                // The pool only logs a panicking job; the forced close and
                // the landfill report are this connection's responsibility.
                if let Err(payload) = AssertUnwindSafe(work).catch_unwind().await {
                    let reason = panic_message(payload.as_ref());
                    tracing::error!(peer = %conn.peer_addr(), panic = %reason, "message handler panicked");
                    let report =
                        FatError::new(TaskPanic(reason), default_action, Some(Arc::clone(&conn)));
                    if landfill.send(report).await.is_err() {
                        tracing::warn!("landfill closed, dropping panic report");
                    }
                    let _ = conn.close().await;
                }
            }
        };
        if conn.concurrent_dispatch() {
            if message_pool.spawn(job).await.is_err() {
                let _ = conn.close().await;
                return;
            }
        } else {
            // Inline: the next read waits for handling and post-action
            // dispatch to finish.
            job.await;
        }
    }
}

/// Read one frame, honoring the close flag and the read deadline.
///
/// `None` means the connection is done reading: peer disconnect, transport
/// error, elapsed deadline, or a close requested elsewhere.
async fn next_frame<C: Send + Sync + 'static>(
    conn: &Connection<C>,
    reader: &mut FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
) -> Option<Bytes> {
    let read = async {
        match conn.read_deadline() {
            Some(limit) => match tokio::time::timeout(limit, reader.next()).await {
                Ok(item) => item,
                Err(_) => {
                    tracing::debug!(peer = %conn.peer_addr(), "read deadline elapsed");
                    None
                }
            },
            None => reader.next().await,
        }
    };
    tokio::select! {
        () = conn.close_requested() => None,
        item = read => match item {
            Some(Ok(frame)) => Some(frame.freeze()),
            Some(Err(err)) => {
                tracing::debug!(peer = %conn.peer_addr(), error = %err, "frame read failed");
                None
            }
            None => None,
        },
    }
}
