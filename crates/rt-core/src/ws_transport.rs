//! WebSocket transport implementation.
//!
//! Uses `tokio-tungstenite` to provide a [`Transport`] over WebSocket
//! connections. One room join opens one WebSocket; reconnects dial fresh,
//! so there is no resumption state here at all.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::transport::{Transport, TransportError, TransportReader, TransportWriter};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn map_ws_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
        other => TransportError::Io(other.to_string()),
    }
}

/// WebSocket transport over `ws://` or `wss://`.
pub struct WsTransport {
    stream: WsStream,
}

impl WsTransport {
    /// Connect to a WebSocket server at the given URL.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _response) = connect_async(url).await.map_err(map_ws_error)?;
        debug!(url, "websocket connected");
        Ok(Self { stream })
    }
}

impl Transport for WsTransport {
    type Reader = WsReader;
    type Writer = WsWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.stream.split();
        (WsReader { stream }, WsWriter { sink })
    }
}

/// Read half of a WebSocket transport.
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

impl TransportReader for WsReader {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        code = frame.as_ref().map(|f| u16::from(f.code)),
                        "server closed websocket"
                    );
                    return Ok(None);
                }
                None => return Ok(None),
                // Binary, ping and pong frames are not part of the protocol.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(map_ws_error(e)),
            }
        }
    }
}

/// Write half of a WebSocket transport.
pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

impl TransportWriter for WsWriter {
    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.sink.send(Message::text(text)).await.map_err(map_ws_error)
    }
}
