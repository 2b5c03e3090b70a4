//! Error landfill: asynchronous, bounded error reporting.
//!
//! Failure reporting is decoupled from the code path that detected the
//! failure: producers push a [`FatError`] into a bounded queue and move on;
//! a single triage consumer dequeues continuously and submits the print or
//! save handler invocation to the error pool. Slow reporting (say, durable
//! storage writes) therefore never stalls the accept loop, a read loop, or
//! other connections, and one slow handler invocation never delays draining
//! of subsequently queued errors.
//!
//! A producer whose enqueue would exceed capacity waits until the consumer
//! frees a slot: backpressure, never silent drop. The one intentional drop
//! is [`ErrorAction::None`], discarded after dequeue.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::LandfillClosed;
use crate::handler::{ErrorAction, EventHandler, FatError};
use crate::pool::TaskPool;

/// Default capacity of the landfill and closing-funnel queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Producer handle to the error landfill.
///
/// Cloneable; lets the application push its own reportable errors with a
/// chosen action, not necessarily tied to one connection. Obtain it from
/// [`Server::landfill`](crate::Server::landfill) before serving.
pub struct LandfillHandle<C> {
    tx: mpsc::Sender<FatError<C>>,
}

impl<C> Clone for LandfillHandle<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<C> LandfillHandle<C> {
    pub(crate) fn new(tx: mpsc::Sender<FatError<C>>) -> Self {
        Self { tx }
    }

    /// Push an error into the landfill.
    ///
    /// Waits if the queue is full; fails only once the triage consumer has
    /// stopped.
    pub async fn report(&self, error: FatError<C>) -> Result<(), LandfillClosed> {
        self.tx.send(error).await.map_err(|_| LandfillClosed)
    }
}

/// Start the single triage consumer.
///
/// Handler invocations are always submitted to the pool, never run on the
/// consumer loop itself.
pub(crate) fn start_error_triage<H: EventHandler>(
    mut rx: mpsc::Receiver<FatError<H::Context>>,
    pool: Arc<TaskPool>,
    handler: Arc<H>,
    server_context: Arc<H::Context>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(error) = rx.recv().await {
            let handler = Arc::clone(&handler);
            let context = Arc::clone(&server_context);
            let submitted = match error.action() {
                ErrorAction::None => Ok(()),
                ErrorAction::Print => {
                    pool.spawn(async move {
                        handler.on_error_print(&context, &error).await;
                    })
                    .await
                }
                ErrorAction::Save => {
                    pool.spawn(async move {
                        handler.on_error_save(&context, &error).await;
                    })
                    .await
                }
            };
            if submitted.is_err() {
                tracing::warn!("error pool closed, stopping error triage");
                return;
            }
        }
        tracing::debug!("error triage stopped");
    })
}
