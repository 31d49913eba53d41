//! Room handle and join handshake.
//!
//! [`join_room`] performs the `JoinOrCreate` handshake over any
//! [`Transport`] and returns a [`RoomHandle`]: a cloneable handle that owns
//! the outgoing message channel and fans incoming room events out to
//! listeners. Background tasks pump the transport, so the handle is safe to
//! use from any async context.
//!
//! [`RoomConnector`] is the seam the session layer dials through —
//! production code uses [`WsConnector`], tests script their own.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::callbacks::CallbackList;
use crate::protocol::{ClientMessage, JoinOptions, ServerLine, ServerMessage, parse_server_line};
use crate::transport::{Transport, TransportError, TransportReader, TransportWriter};
use crate::ws_transport::WsTransport;

/// Close code used when the transport drops without a server `Leave`.
pub const ABNORMAL_CLOSE: u32 = 1006;

/// Errors from the join handshake.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The transport failed before or during the handshake.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server refused the join.
    #[error("join rejected (code {code}): {message}")]
    Rejected { code: u32, message: String },

    /// The connection closed before the server answered the join.
    #[error("connection closed before join completed")]
    Closed,
}

/// A non-fatal room-level error delivered to error listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomError {
    pub code: u32,
    pub message: String,
}

/// Transport-level events consumed by the room's dispatch task.
///
/// Only relevant when wiring a [`RoomHandle`] over a custom transport via
/// [`RoomHandle::from_parts`]; [`join_room`] produces these internally.
#[derive(Debug)]
pub enum RoomEvent {
    /// A parsed server message.
    Message(ServerMessage),
    /// The transport closed cleanly.
    Closed,
    /// The transport failed.
    TransportError(String),
}

struct RoomInner {
    name: String,
    room_id: String,
    session_id: String,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    state_change: CallbackList<serde_json::Value>,
    leave: CallbackList<u32>,
    error: CallbackList<RoomError>,
}

/// Cloneable handle to one joined room.
///
/// Listener registration follows [`CallbackList`] semantics: registration
/// order, at most once per event, no unregister. A leave event (server-sent
/// or synthesized on transport loss) is the last event the handle delivers.
#[derive(Clone)]
pub struct RoomHandle {
    inner: Arc<RoomInner>,
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("name", &self.inner.name)
            .field("room_id", &self.inner.room_id)
            .field("session_id", &self.inner.session_id)
            .finish_non_exhaustive()
    }
}

impl RoomHandle {
    /// Wrap an already-established event stream in a room handle.
    ///
    /// `events` carries transport events; `outgoing` receives messages from
    /// [`send`](RoomHandle::send). Spawns the dispatch task immediately.
    pub fn from_parts(
        name: impl Into<String>,
        room_id: impl Into<String>,
        session_id: impl Into<String>,
        outgoing: mpsc::UnboundedSender<ClientMessage>,
        events: mpsc::UnboundedReceiver<RoomEvent>,
    ) -> Self {
        let handle = Self {
            inner: Arc::new(RoomInner {
                name: name.into(),
                room_id: room_id.into(),
                session_id: session_id.into(),
                outgoing,
                state_change: CallbackList::new(),
                leave: CallbackList::new(),
                error: CallbackList::new(),
            }),
        };
        handle.spawn_dispatch(events);
        handle
    }

    /// Name of the joined room.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Server-assigned room id.
    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    /// Server-assigned session id for this join.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Whether two handles refer to the same underlying room join.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a listener for room state snapshots.
    pub fn on_state_change(&self, cb: impl Fn(&serde_json::Value) + Send + Sync + 'static) {
        self.inner.state_change.push(cb);
    }

    /// Register a listener for the (final) leave event, receiving the close
    /// code.
    pub fn on_leave(&self, cb: impl Fn(&u32) + Send + Sync + 'static) {
        self.inner.leave.push(cb);
    }

    /// Register a listener for non-fatal room errors.
    pub fn on_error(&self, cb: impl Fn(&RoomError) + Send + Sync + 'static) {
        self.inner.error.push(cb);
    }

    /// Enqueue an application payload for the room.
    ///
    /// Non-blocking; after the room has been left this is a silent no-op,
    /// matching the at-most-best-effort delivery of the transport.
    pub fn send(&self, payload: serde_json::Value) {
        let _ = self.inner.outgoing.send(ClientMessage::RoomMessage { payload });
    }

    fn spawn_dispatch(&self, mut events: mpsc::UnboundedReceiver<RoomEvent>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Some(RoomEvent::Message(ServerMessage::StateChange { state })) => {
                        inner.state_change.invoke(&state);
                    }
                    Some(RoomEvent::Message(ServerMessage::Error { code, message })) => {
                        inner.error.invoke(&RoomError { code, message });
                    }
                    Some(RoomEvent::Message(ServerMessage::Leave { code })) => {
                        inner.leave.invoke(&code);
                        break;
                    }
                    Some(RoomEvent::Message(msg)) => {
                        // Handshake replies after the handshake: ignore.
                        debug!(room = %inner.name, ?msg, "unexpected post-join message");
                    }
                    Some(RoomEvent::TransportError(e)) => {
                        inner.error.invoke(&RoomError {
                            code: 0,
                            message: e,
                        });
                        inner.leave.invoke(&ABNORMAL_CLOSE);
                        break;
                    }
                    Some(RoomEvent::Closed) | None => {
                        inner.leave.invoke(&ABNORMAL_CLOSE);
                        break;
                    }
                }
            }
        });
    }
}

/// Perform the join handshake over `transport`.
///
/// Sends `JoinOrCreate` and waits for the server's answer. Unknown lines
/// before the answer are skipped. On success the transport is handed to
/// background pump tasks and a ready [`RoomHandle`] is returned.
pub async fn join_room<T: Transport>(
    transport: T,
    room_name: &str,
    options: JoinOptions,
) -> Result<RoomHandle, JoinError> {
    let (mut reader, mut writer) = transport.split();

    let join = serde_json::to_string(&ClientMessage::JoinOrCreate {
        room_name: room_name.to_string(),
        options,
    })
    .map_err(|e| TransportError::Io(e.to_string()))?;
    writer.send(&join).await?;

    // Wait for the handshake answer on the caller's task.
    let (room_id, session_id) = loop {
        match reader.recv().await {
            Err(e) if e.is_disconnect() => return Err(JoinError::Closed),
            Err(e) => return Err(e.into()),
            Ok(Some(line)) => match parse_server_line(&line) {
                ServerLine::Message(ServerMessage::JoinAccepted { room_id, session_id }) => {
                    break (room_id, session_id);
                }
                ServerLine::Message(ServerMessage::JoinRejected { code, message }) => {
                    return Err(JoinError::Rejected { code, message });
                }
                ServerLine::Message(other) => {
                    debug!(room = room_name, ?other, "pre-join message skipped");
                }
                ServerLine::Unknown(raw) => {
                    debug!(room = room_name, %raw, "unparsable pre-join line skipped");
                }
                ServerLine::Empty => {}
            },
            Ok(None) => return Err(JoinError::Closed),
        }
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ClientMessage>();

    spawn_reader_pump(reader, event_tx);
    spawn_writer_pump(writer, cmd_rx);

    Ok(RoomHandle::from_parts(
        room_name, room_id, session_id, cmd_tx, event_rx,
    ))
}

/// Pump transport lines into room events until the connection ends.
fn spawn_reader_pump<R: TransportReader>(
    mut reader: R,
    event_tx: mpsc::UnboundedSender<RoomEvent>,
) {
    tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(Some(line)) => match parse_server_line(&line) {
                    ServerLine::Message(msg) => {
                        if event_tx.send(RoomEvent::Message(msg)).is_err() {
                            break;
                        }
                    }
                    ServerLine::Unknown(raw) => {
                        debug!(%raw, "unparsable server line skipped");
                    }
                    ServerLine::Empty => {}
                },
                Ok(None) => {
                    let _ = event_tx.send(RoomEvent::Closed);
                    break;
                }
                // A disconnect is the connection ending, not a fault.
                Err(e) if e.is_disconnect() => {
                    let _ = event_tx.send(RoomEvent::Closed);
                    break;
                }
                Err(e) => {
                    let _ = event_tx.send(RoomEvent::TransportError(e.to_string()));
                    break;
                }
            }
        }
    });
}

/// Pump outgoing messages onto the transport until the channel closes.
fn spawn_writer_pump<W: TransportWriter>(
    mut writer: W,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientMessage>,
) {
    tokio::spawn(async move {
        while let Some(msg) = cmd_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(_) => continue,
            };
            if writer.send(&json).await.is_err() {
                break;
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Connector seam
// ---------------------------------------------------------------------------

/// Dials one room join attempt. The session layer owns retries; a connector
/// owns exactly one attempt.
pub trait RoomConnector: Send + Sync + 'static {
    /// Join-or-create the named room, establishing a fresh connection.
    fn join_or_create(
        &self,
        room_name: &str,
        options: JoinOptions,
    ) -> impl Future<Output = Result<RoomHandle, JoinError>> + Send;
}

impl<T: RoomConnector> RoomConnector for Arc<T> {
    fn join_or_create(
        &self,
        room_name: &str,
        options: JoinOptions,
    ) -> impl Future<Output = Result<RoomHandle, JoinError>> + Send {
        (**self).join_or_create(room_name, options)
    }
}

/// Production connector: a fresh WebSocket to `endpoint` per attempt.
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// The endpoint this connector dials.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl RoomConnector for WsConnector {
    async fn join_or_create(
        &self,
        room_name: &str,
        options: JoinOptions,
    ) -> Result<RoomHandle, JoinError> {
        let transport = WsTransport::connect(&self.endpoint).await?;
        join_room(transport, room_name, options).await
    }
}
