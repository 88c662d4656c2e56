//! `ProtocolClient` over the relay's framed TCP protocol.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::connection::ProtocolClient;
use crate::encoder::EncodedUnit;
use crate::error::StreamError;
use crate::relay::codec::{RelayCodec, RelayMessage};
use crate::settings::IngestUrl;

type Transport = Framed<TcpStream, RelayCodec>;

#[derive(Default)]
pub struct RelayClient {
    transport: Option<Transport>,
    published: bool,
    /// Set once the relay closed the stream or a read failed.
    peer_gone: bool,
    next_nonce: u64,
}

impl RelayClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn transport(&mut self) -> Result<&mut Transport, StreamError> {
        self.transport.as_mut().ok_or(StreamError::NotConnected)
    }

    /// Handle whatever the relay has already sent without waiting.
    fn drain_pending(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        while let Some(next) = transport.next().now_or_never() {
            match next {
                Some(Ok(RelayMessage::Close)) | None => {
                    debug!("relay closed the stream");
                    self.peer_gone = true;
                    return;
                }
                Some(Err(e)) => {
                    debug!("relay read failed: {e}");
                    self.peer_gone = true;
                    return;
                }
                Some(Ok(other)) => trace!(kind = ?other.kind(), "unsolicited relay message"),
            }
        }
    }

    async fn recv(&mut self) -> Result<RelayMessage, StreamError> {
        match self.transport()?.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => {
                self.peer_gone = true;
                Err(e)
            }
            None => {
                self.peer_gone = true;
                Err(StreamError::Network("relay closed the connection".into()))
            }
        }
    }
}

#[async_trait]
impl ProtocolClient for RelayClient {
    async fn connect(&mut self, url: &IngestUrl) -> Result<(), StreamError> {
        let stream = TcpStream::connect(url.socket_addr()).await?;
        stream.set_nodelay(true)?;
        debug!(addr = %url.socket_addr(), "relay connected");
        self.transport = Some(Framed::new(stream, RelayCodec::new()));
        self.published = false;
        self.peer_gone = false;
        Ok(())
    }

    async fn publish(&mut self, stream_key: &str) -> Result<(), StreamError> {
        self.transport()?
            .send(RelayMessage::Publish {
                key: stream_key.to_string(),
            })
            .await?;
        match self.recv().await? {
            RelayMessage::PublishAccepted => {
                self.published = true;
                Ok(())
            }
            RelayMessage::PublishRejected { reason } => Err(StreamError::Authentication(reason)),
            other => Err(StreamError::Network(format!(
                "unexpected {:?} in reply to publish",
                other.kind()
            ))),
        }
    }

    async fn is_alive(&mut self) -> bool {
        self.drain_pending();
        self.transport.is_some() && !self.peer_gone
    }

    async fn send(&mut self, unit: &EncodedUnit) -> Result<(), StreamError> {
        if !self.published || self.peer_gone {
            return Err(StreamError::NotConnected);
        }
        self.transport()?
            .send(RelayMessage::Media { unit: unit.clone() })
            .await
    }

    async fn close_publish(&mut self) -> Result<(), StreamError> {
        if !self.published {
            return Ok(());
        }
        self.published = false;
        if self.peer_gone {
            return Ok(());
        }
        self.transport()?.send(RelayMessage::Close).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.published = false;
        match self.transport.take() {
            Some(mut transport) => transport.close().await,
            None => Ok(()),
        }
    }

    async fn round_trip(&mut self) -> Option<Result<Duration, StreamError>> {
        if self.transport.is_none() || self.peer_gone {
            return None;
        }
        self.next_nonce += 1;
        let nonce = self.next_nonce;
        let started = Instant::now();
        let probe = async {
            self.transport()?.send(RelayMessage::Ping { nonce }).await?;
            loop {
                if let RelayMessage::Pong { nonce: n } = self.recv().await? {
                    if n == nonce {
                        return Ok(started.elapsed());
                    }
                }
            }
        };
        Some(probe.await)
    }
}
