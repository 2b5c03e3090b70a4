//! Closing funnel: exactly-once pre-close hook and teardown.
//!
//! However many sites race to close a connection (read-loop failure,
//! explicit application close, panic recovery), only the first caller wins
//! the closed transition and enqueues the connection here. The single
//! consumer then submits one job per connection to the close pool: run the
//! application's `on_before_close`, then release the transport. Close is
//! therefore logically synchronous but physically asynchronous; callers get
//! the idempotence guarantee, not completed teardown.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conn::Connection;
use crate::handler::EventHandler;
use crate::pool::TaskPool;

/// Start the single close-triage consumer.
pub(crate) fn start_close_triage<H: EventHandler>(
    mut rx: mpsc::Receiver<Arc<Connection<H::Context>>>,
    pool: Arc<TaskPool>,
    handler: Arc<H>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(conn) = rx.recv().await {
            let handler = Arc::clone(&handler);
            let submitted = pool
                .spawn(async move {
                    handler.on_before_close(&conn).await;
                    conn.teardown().await;
                })
                .await;
            if submitted.is_err() {
                tracing::warn!("close pool closed, stopping close triage");
                return;
            }
        }
        tracing::debug!("close triage stopped");
    })
}
