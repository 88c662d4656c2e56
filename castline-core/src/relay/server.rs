//! In-process ingest relay for local testing.
//!
//! Accepts publish sessions over the framed relay protocol, checks the
//! stream key against an allow-list and counts what it receives. In
//! silent-reject mode it accepts every publish and then hangs up, the
//! way some ingest servers treat a bad key.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::relay::codec::{RelayCodec, RelayMessage};

/// Relay behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Accepted stream keys. Empty accepts any key.
    pub allowed_keys: Vec<String>,
    /// Accept every publish, then drop the connection.
    pub silent_reject: bool,
}

/// What the relay has seen since it started.
#[derive(Debug, Default)]
pub struct RelayCounters {
    sessions: AtomicU64,
    rejected: AtomicU64,
    units: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RelaySnapshot {
    pub sessions: u64,
    pub rejected: u64,
    pub units: u64,
    pub bytes: u64,
}

impl RelayCounters {
    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            sessions: self.sessions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            units: self.units.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

pub struct RelayServer {
    local_addr: SocketAddr,
    counters: Arc<RelayCounters>,
    cancel_token: CancellationToken,
}

impl RelayServer {
    /// Bind `addr` and start accepting in the background.
    pub async fn bind(addr: &str, config: RelayConfig) -> Result<Self, StreamError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let counters = Arc::new(RelayCounters::default());
        let cancel_token = CancellationToken::new();

        info!(%local_addr, "relay listening");
        tokio::spawn(accept_loop(
            listener,
            Arc::new(Policy::from(config)),
            counters.clone(),
            cancel_token.clone(),
        ));

        Ok(Self {
            local_addr,
            counters,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// An `rtmp://` URL that points at this relay.
    pub fn ingest_url(&self, app: &str) -> String {
        format!("rtmp://{}/{}", self.local_addr, app)
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        self.counters.snapshot()
    }

    /// Stop accepting and drop every open session.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct Policy {
    allowed: HashSet<String>,
    silent_reject: bool,
}

impl From<RelayConfig> for Policy {
    fn from(config: RelayConfig) -> Self {
        Self {
            allowed: config.allowed_keys.into_iter().collect(),
            silent_reject: config.silent_reject,
        }
    }
}

impl Policy {
    fn admits(&self, key: &str) -> bool {
        self.allowed.is_empty() || self.allowed.contains(key)
    }
}

async fn accept_loop(
    listener: TcpListener,
    policy: Arc<Policy>,
    counters: Arc<RelayCounters>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "relay accepted connection");
                    tokio::spawn(serve(
                        stream,
                        peer,
                        policy.clone(),
                        counters.clone(),
                        cancel_token.child_token(),
                    ));
                }
                Err(e) => warn!("accept error: {e}"),
            }
        }
    }
    debug!("relay accept loop stopped");
}

async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    policy: Arc<Policy>,
    counters: Arc<RelayCounters>,
    cancel_token: CancellationToken,
) {
    let mut framed = Framed::new(stream, RelayCodec::new());
    let mut publishing = false;

    loop {
        let next = tokio::select! {
            () = cancel_token.cancelled() => break,
            next = framed.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!(%peer, "relay read error: {e}");
                break;
            }
            None => break,
        };

        let reply = match message {
            RelayMessage::Publish { key } => {
                if policy.silent_reject {
                    info!(%peer, "publish accepted, dropping (silent reject)");
                    counters.rejected.fetch_add(1, Ordering::Relaxed);
                    let _ = framed.send(RelayMessage::PublishAccepted).await;
                    break;
                }
                if policy.admits(&key) {
                    info!(%peer, "publish accepted");
                    counters.sessions.fetch_add(1, Ordering::Relaxed);
                    publishing = true;
                    Some(RelayMessage::PublishAccepted)
                } else {
                    info!(%peer, "publish rejected: unknown stream key");
                    counters.rejected.fetch_add(1, Ordering::Relaxed);
                    let _ = framed
                        .send(RelayMessage::PublishRejected {
                            reason: "unknown stream key".into(),
                        })
                        .await;
                    break;
                }
            }
            RelayMessage::Media { unit } if publishing => {
                counters.units.fetch_add(1, Ordering::Relaxed);
                counters
                    .bytes
                    .fetch_add(unit.data.len() as u64, Ordering::Relaxed);
                None
            }
            RelayMessage::Media { .. } => {
                warn!(%peer, "media before publish");
                break;
            }
            RelayMessage::Ping { nonce } => Some(RelayMessage::Pong { nonce }),
            RelayMessage::Close => {
                debug!(%peer, "publisher closed the stream");
                break;
            }
            other => {
                debug!(%peer, kind = ?other.kind(), "ignoring unexpected message");
                None
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = framed.send(reply).await {
                warn!(%peer, "relay write error: {e}");
                break;
            }
        }
    }
    debug!(%peer, "relay session ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ProtocolClient;
    use crate::encoder::EncodedUnit;
    use crate::relay::RelayClient;
    use crate::settings::IngestUrl;
    use bytes::Bytes;
    use std::time::Duration;

    fn unit(len: usize) -> EncodedUnit {
        EncodedUnit {
            frame_number: 0,
            pts: Duration::ZERO,
            duration: Duration::from_millis(33),
            keyframe: true,
            width: 160,
            height: 128,
            data: Bytes::from(vec![1u8; len]),
        }
    }

    async fn relay(config: RelayConfig) -> (RelayServer, IngestUrl) {
        let server = RelayServer::bind("127.0.0.1:0", config).await.unwrap();
        let url = server.ingest_url("live").parse().unwrap();
        (server, url)
    }

    #[tokio::test]
    async fn publish_media_and_ping() {
        let (server, url) = relay(RelayConfig {
            allowed_keys: vec!["good".into()],
            ..Default::default()
        })
        .await;
        let mut client = RelayClient::new();
        client.connect(&url).await.unwrap();
        client.publish("good").await.unwrap();
        assert!(client.is_alive().await);

        client.send(&unit(100)).await.unwrap();
        client.send(&unit(50)).await.unwrap();
        let rtt = client.round_trip().await.unwrap().unwrap();
        assert!(rtt < Duration::from_secs(1));

        let snap = server.snapshot();
        assert_eq!(snap.sessions, 1);
        assert_eq!(snap.units, 2);
        assert_eq!(snap.bytes, 150);

        client.close_publish().await.unwrap();
        client.close().await.unwrap();
        assert!(!client.is_alive().await);
    }

    #[tokio::test]
    async fn unknown_key_is_an_authentication_error() {
        let (server, url) = relay(RelayConfig {
            allowed_keys: vec!["good".into()],
            ..Default::default()
        })
        .await;
        let mut client = RelayClient::new();
        client.connect(&url).await.unwrap();
        let err = client.publish("bad").await.unwrap_err();
        assert!(matches!(err, StreamError::Authentication(_)));
        assert_eq!(server.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn silent_reject_drops_after_accepting() {
        let (_server, url) = relay(RelayConfig {
            silent_reject: true,
            ..Default::default()
        })
        .await;
        let mut client = RelayClient::new();
        client.connect(&url).await.unwrap();
        client.publish("anything").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!client.is_alive().await);
        assert!(client.send(&unit(10)).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_ends_sessions() {
        let (server, url) = relay(RelayConfig::default()).await;
        let mut client = RelayClient::new();
        client.connect(&url).await.unwrap();
        client.publish("k").await.unwrap();

        server.shutdown();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!client.is_alive().await);
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let url: IngestUrl = format!("rtmp://{addr}/live").parse().unwrap();
        let mut client = RelayClient::new();
        assert!(client.connect(&url).await.is_err());
        assert!(!client.is_alive().await);
    }
}
