//! Transport seam between the manager and the network.
//!
//! The manager only ever sees a boxed sink/stream pair of WebSocket
//! messages, so tests can plug in an in-memory hub through [`Connector`].

use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;

use homelink_protocol::MAX_MESSAGE_SIZE;

use crate::error::ConnectionError;

pub type WsSink = Pin<Box<dyn Sink<tungstenite::Message, Error = tungstenite::Error> + Send>>;
pub type WsStream =
    Pin<Box<dyn Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Send>>;

/// An open, not yet authenticated, connection to the hub.
pub struct Transport {
    pub sink: WsSink,
    pub stream: WsStream,
}

impl Transport {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<tungstenite::Message, Error = tungstenite::Error> + Send + 'static,
        St: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<Transport, ConnectionError>> + Send + 'a>>;

/// Opens transports to the hub.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, url: &'a str) -> ConnectFuture<'a>;
}

/// Default connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    max_message_size: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Connector for WsConnector {
    fn connect<'a>(&'a self, url: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(self.max_message_size);
            ws_config.max_frame_size = Some(self.max_message_size);
            let (ws_stream, response) =
                tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
            debug!(url, status = %response.status(), "websocket upgraded");
            let (sink, stream) = ws_stream.split();
            Ok(Transport::new(sink, stream))
        })
    }
}
