//! The duplex channel under the session client.
//!
//! The client only needs three things from its transport: open a channel,
//! write text frames, read text frames until the channel dies. Keeping those
//! behind object-safe traits lets tests drive the whole protocol state
//! machine through an in-memory channel instead of a socket.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of an open channel.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&mut self, text: String) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Read half of an open channel. `None` means the channel is gone.
#[async_trait]
pub trait FrameStream: Send {
    async fn next(&mut self) -> Option<Result<String>>;
}

/// Opens channels to the gateway.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}

/// Production connector backed by `tokio-tungstenite`.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (stream, _) = connect_async(url).await?;
        debug!(url, "channel opened");
        let (sink, stream) = stream.split();
        Ok((Box::new(WsSink(sink)), Box::new(WsFrames(stream))))
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.0.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.0.close().await?;
        Ok(())
    }
}

struct WsFrames(SplitStream<WsStream>);

#[async_trait]
impl FrameStream for WsFrames {
    async fn next(&mut self) -> Option<Result<String>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.into())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "close frame from gateway");
                    return None;
                }
                // Pings are answered by tungstenite itself; binary frames are
                // not part of this protocol.
                Ok(_) => continue,
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}
