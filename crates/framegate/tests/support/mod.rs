//! Shared recording handlers and wire helpers.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use framegate::{
    CancellationToken, Connection, ErrorAction, EventHandler, FatError, FrameConfig,
    PostActionHandler, RawCodec, Server, TaggedCodec, TaggedMessage,
};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::timeout;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the handlers observe, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ev {
    Connected(SocketAddr),
    Join { peer: SocketAddr, payload: Vec<u8>, ctx: String },
    Message { peer: SocketAddr, payload: Vec<u8>, ctx: String },
    ParseFailed { peer: SocketAddr, raw: Vec<u8> },
    BeforeClose(SocketAddr),
    ErrorPrint(String),
    ErrorSave(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Keep,
    Close,
}

/// Recording handler over the canonical raw codec.
pub struct Recorder {
    pub events: UnboundedSender<Ev>,
    pub concurrent: bool,
    pub read_deadline: Option<Duration>,
    pub message_delay: Option<Duration>,
    pub panic_payload: Option<Vec<u8>>,
    pub close_payload: Option<Vec<u8>>,
    pub conns: Arc<Mutex<Vec<Arc<Connection<String>>>>>,
}

impl Recorder {
    pub fn new(events: UnboundedSender<Ev>) -> Self {
        Self {
            events,
            concurrent: false,
            read_deadline: None,
            message_delay: None,
            panic_payload: None,
            close_payload: None,
            conns: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl EventHandler for Recorder {
    type Context = String;
    type Action = Action;
    type Codec = RawCodec;

    async fn on_connected(&self, conn: &Arc<Connection<String>>) -> (String, Action) {
        conn.set_concurrent_dispatch(self.concurrent);
        if let Some(deadline) = self.read_deadline {
            conn.set_read_deadline(Some(deadline));
        }
        self.conns.lock().push(Arc::clone(conn));
        let _ = self.events.send(Ev::Connected(conn.peer_addr()));
        ("connected".to_string(), Action::Keep)
    }

    async fn on_join(&self, conn: &Arc<Connection<String>>, first: Bytes) -> (String, Action) {
        let _ = self.events.send(Ev::Join {
            peer: conn.peer_addr(),
            payload: first.to_vec(),
            ctx: conn.context().as_ref().clone(),
        });
        ("joined".to_string(), Action::Keep)
    }

    async fn on_message(&self, conn: &Arc<Connection<String>>, message: Bytes) -> Action {
        if self.panic_payload.as_deref() == Some(&message[..]) {
            panic!("handler exploded");
        }
        if let Some(delay) = self.message_delay {
            tokio::time::sleep(delay).await;
        }
        let _ = self.events.send(Ev::Message {
            peer: conn.peer_addr(),
            payload: message.to_vec(),
            ctx: conn.context().as_ref().clone(),
        });
        if self.close_payload.as_deref() == Some(&message[..]) { Action::Close } else { Action::Keep }
    }

    async fn on_before_close(&self, conn: &Arc<Connection<String>>) {
        let _ = self.events.send(Ev::BeforeClose(conn.peer_addr()));
    }

    async fn on_error_print(&self, _ctx: &String, error: &FatError<String>) {
        let _ = self.events.send(Ev::ErrorPrint(error.to_string()));
    }

    async fn on_error_save(&self, _ctx: &String, error: &FatError<String>) {
        let _ = self.events.send(Ev::ErrorSave(error.to_string()));
    }

    async fn on_parsing_failed(&self, conn: &Arc<Connection<String>>, raw: Bytes) {
        let _ = self.events.send(Ev::ParseFailed { peer: conn.peer_addr(), raw: raw.to_vec() });
    }
}

/// Recording handler over the tagged codec, whose decode can fail.
pub struct TaggedRecorder {
    pub events: UnboundedSender<Ev>,
}

#[async_trait]
impl EventHandler for TaggedRecorder {
    type Context = String;
    type Action = Action;
    type Codec = TaggedCodec;

    async fn on_connected(&self, conn: &Arc<Connection<String>>) -> (String, Action) {
        let _ = self.events.send(Ev::Connected(conn.peer_addr()));
        ("connected".to_string(), Action::Keep)
    }

    async fn on_join(&self, conn: &Arc<Connection<String>>, first: TaggedMessage) -> (String, Action) {
        let _ = self.events.send(Ev::Join {
            peer: conn.peer_addr(),
            payload: first.payload.to_vec(),
            ctx: conn.context().as_ref().clone(),
        });
        ("joined".to_string(), Action::Keep)
    }

    async fn on_message(&self, conn: &Arc<Connection<String>>, message: TaggedMessage) -> Action {
        let _ = self.events.send(Ev::Message {
            peer: conn.peer_addr(),
            payload: message.payload.to_vec(),
            ctx: conn.context().as_ref().clone(),
        });
        Action::Keep
    }

    async fn on_before_close(&self, conn: &Arc<Connection<String>>) {
        let _ = self.events.send(Ev::BeforeClose(conn.peer_addr()));
    }

    async fn on_error_print(&self, _ctx: &String, error: &FatError<String>) {
        let _ = self.events.send(Ev::ErrorPrint(error.to_string()));
    }

    async fn on_error_save(&self, _ctx: &String, error: &FatError<String>) {
        let _ = self.events.send(Ev::ErrorSave(error.to_string()));
    }

    async fn on_parsing_failed(&self, conn: &Arc<Connection<String>>, raw: Bytes) {
        let _ = self.events.send(Ev::ParseFailed { peer: conn.peer_addr(), raw: raw.to_vec() });
    }
}

/// Closes the connection on [`Action::Close`], otherwise does nothing.
pub struct Dispatch;

#[async_trait]
impl<H> PostActionHandler<H> for Dispatch
where
    H: EventHandler<Context = String, Action = Action>,
{
    async fn on_post_action(&self, action: Action, conn: &Arc<Connection<String>>) {
        if action == Action::Close {
            let _ = conn.close().await;
        }
    }
}

/// Bind port 0 and serve in the background; returns the bound address.
pub async fn start<H, P>(server: Server<H, P>) -> SocketAddr
where
    H: EventHandler,
    P: PostActionHandler<H>,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = framegate::serve_listener(
            server,
            listener,
            ErrorAction::Print,
            CancellationToken::new(),
        )
        .await;
    });
    addr
}

/// Recorder server with default knobs; returns (addr, events).
pub async fn start_recorder(
    tweak: impl FnOnce(&mut Recorder),
) -> (SocketAddr, UnboundedReceiver<Ev>) {
    let (tx, rx) = unbounded_channel();
    let mut handler = Recorder::new(tx);
    tweak(&mut handler);
    let server = Server::new(
        "bootstrap".to_string(),
        FrameConfig::big_endian(),
        handler,
        Dispatch,
    );
    (start(server).await, rx)
}

pub async fn send_frame(stream: &mut TcpStream, payload: &[u8]) {
    let len = u32::try_from(payload.len()).unwrap();
    stream.write_all(&len.to_be_bytes()).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();
}

pub async fn recv_ev(rx: &mut UnboundedReceiver<Ev>) -> Ev {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Assert no event arrives for a short window.
pub async fn assert_quiet(rx: &mut UnboundedReceiver<Ev>) {
    match timeout(Duration::from_millis(200), rx.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(ev)) => panic!("unexpected event: {ev:?}"),
    }
}
