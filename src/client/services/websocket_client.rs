use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::client::services::chat_connection::ChatError;
use crate::client::services::stomp::{self, Command, Frame};

/// One established STOMP session. Dropping `outgoing` closes the socket;
/// `incoming` yields `None` once the socket has closed.
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<Frame>,
    pub incoming: mpsc::UnboundedReceiver<Frame>,
}

impl Link {
    /// Two linked ends: the client-side `Link` and the peer's view of it.
    pub fn pair() -> (Link, Link) {
        let (client_tx, peer_rx) = mpsc::unbounded_channel();
        let (peer_tx, client_rx) = mpsc::unbounded_channel();
        (
            Link {
                outgoing: client_tx,
                incoming: client_rx,
            },
            Link {
                outgoing: peer_tx,
                incoming: peer_rx,
            },
        )
    }
}

/// Opens STOMP sessions for the chat connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Resolves once the STOMP handshake (CONNECT / CONNECTED) has completed.
    async fn open(&self) -> Result<Link, ChatError>;
}

pub struct WebSocketConnector {
    url: Url,
    handshake_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn host_header(&self) -> String {
        match (self.url.host_str(), self.url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => "localhost".to_string(),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Link, ChatError> {
        debug!("[WS:CLIENT] Connecting to {}", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChatError::ConnectionFailed(format!("Failed to connect: {}", e)))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        ws_sender
            .send(Message::Text(Frame::connect(&self.host_header()).encode()))
            .await
            .map_err(|e| ChatError::Handshake(format!("Failed to send CONNECT: {}", e)))?;

        // Frames that arrive in the same message as CONNECTED are kept.
        let mut early_frames = Vec::new();
        let handshake = tokio::time::timeout(self.handshake_timeout, async {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let mut frames = stomp::decode_all(&text)?.into_iter();
                        while let Some(frame) = frames.next() {
                            match frame.command {
                                Command::Connected => {
                                    early_frames.extend(frames);
                                    return Ok::<Frame, ChatError>(frame);
                                }
                                Command::Error => {
                                    let reason = frame
                                        .get_header("message")
                                        .map(str::to_string)
                                        .unwrap_or(frame.body);
                                    return Err(ChatError::Handshake(reason));
                                }
                                other => {
                                    debug!("[WS:CLIENT] Ignoring {} before CONNECTED", other)
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        return Err(ChatError::Handshake(
                            "Server closed connection during handshake".to_string(),
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(ChatError::Handshake(format!(
                            "WebSocket error during handshake: {}",
                            e
                        )));
                    }
                }
            }
            Err(ChatError::Handshake(
                "Connection closed during handshake".to_string(),
            ))
        })
        .await
        .map_err(|_| ChatError::Handshake("Timed out waiting for CONNECTED".to_string()))??;

        info!(
            "[WS:CLIENT] STOMP session established (version {})",
            handshake.get_header("version").unwrap_or("1.0")
        );

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Frame>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<Frame>();

        for frame in early_frames {
            let _ = incoming_tx.send(frame);
        }

        tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => match stomp::decode_all(&text) {
                        Ok(frames) => {
                            for frame in frames {
                                if incoming_tx.send(frame).is_err() {
                                    debug!("[WS:CLIENT] Connection dropped its receiver");
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!("[WS:CLIENT] Failed to decode frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("[WS:CLIENT] WebSocket closed by server");
                        break;
                    }
                    // ping/pong are answered by tungstenite
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[WS:CLIENT] WebSocket error: {}", e);
                        break;
                    }
                }
            }
            debug!("[WS:CLIENT] Incoming frame handler ended");
        });

        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let last = frame.command == Command::Disconnect;
                if let Err(e) = ws_sender.send(Message::Text(frame.encode())).await {
                    warn!("[WS:CLIENT] Failed to send {} frame: {}", frame.command, e);
                    break;
                }
                if last {
                    break;
                }
            }
            let _ = ws_sender.close().await;
            debug!("[WS:CLIENT] Outgoing frame handler ended");
        });

        Ok(Link {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_header_includes_port() {
        let c = WebSocketConnector::new(Url::parse("ws://localhost:8080/ws").unwrap());
        assert_eq!(c.host_header(), "localhost:8080");
        let c = WebSocketConnector::new(Url::parse("wss://chat.example.org/ws").unwrap());
        assert_eq!(c.host_header(), "chat.example.org");
    }

    #[tokio::test]
    async fn test_link_pair_is_cross_wired() {
        let (client, mut peer) = Link::pair();
        client.outgoing.send(Frame::disconnect()).unwrap();
        let got = peer.incoming.recv().await.unwrap();
        assert_eq!(got.command, Command::Disconnect);
        drop(peer);
        let mut client = client;
        assert!(client.incoming.recv().await.is_none());
    }
}
