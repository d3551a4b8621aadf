//! Socket transport seam.
//!
//! A [`Connector`] opens a message-oriented socket to a relay URL and returns
//! its two halves, so the connection driver can read and write independently.
//! [`WsConnector`] is the tokio-tungstenite implementation.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

/// One frame on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Writing half of a relay socket.
#[async_trait]
pub trait SocketSink: Send {
    async fn send(&mut self, frame: SocketFrame) -> Result<()>;
}

/// Reading half of a relay socket. `None` means the peer went away.
#[async_trait]
pub trait SocketStream: Send {
    async fn next_frame(&mut self) -> Option<Result<SocketFrame>>;
}

pub type SocketPair = (Box<dyn SocketSink>, Box<dyn SocketStream>);

/// Opens relay sockets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<SocketPair>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SocketPair> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let (sink, stream) = ws.split();
        Ok((Box::new(WsSink(sink)), Box::new(WsSource(stream))))
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl SocketSink for WsSink {
    async fn send(&mut self, frame: SocketFrame) -> Result<()> {
        let message = match frame {
            SocketFrame::Text(text) => Message::Text(text.into()),
            SocketFrame::Ping(data) => Message::Ping(data.into()),
            SocketFrame::Pong(data) => Message::Pong(data.into()),
            SocketFrame::Close => Message::Close(None),
        };
        self.0
            .send(message)
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }
}

struct WsSource(SplitStream<WsStream>);

#[async_trait]
impl SocketStream for WsSource {
    async fn next_frame(&mut self) -> Option<Result<SocketFrame>> {
        loop {
            let frame = match self.0.next().await? {
                Ok(Message::Text(text)) => SocketFrame::Text(text.as_str().to_owned()),
                Ok(Message::Ping(data)) => SocketFrame::Ping(data.to_vec()),
                Ok(Message::Pong(data)) => SocketFrame::Pong(data.to_vec()),
                Ok(Message::Close(_)) => SocketFrame::Close,
                // binary and raw frames are not part of the protocol
                Ok(_) => continue,
                Err(e) => return Some(Err(ClientError::WebSocket(e.to_string()))),
            };
            return Some(Ok(frame));
        }
    }
}
