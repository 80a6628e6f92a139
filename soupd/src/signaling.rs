//! Reconnecting WebSocket client for the signaling server

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use soupd_sfu::{InboundMessage, Orchestrator, OutboundEvent};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SignalingConfig;

/// Why a connected session ended
#[derive(Debug)]
enum SessionEnd {
    /// The server sent `disconnect`
    Disconnect,
    Shutdown,
    /// Closed or broken; reconnect
    Lost(String),
}

pub struct SignalingClient {
    url: String,
    reconnect_interval: Duration,
    node_id: Uuid,
}

impl SignalingClient {
    #[must_use]
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            url: config.url.clone(),
            reconnect_interval: config.reconnect_interval(),
            node_id: Uuid::new_v4(),
        }
    }

    /// Identifier announced in every handshake
    #[must_use]
    pub const fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Keep a connection to the signaling server until `shutdown` fires or
    /// the server sends `disconnect`, which also cancels `shutdown`.
    ///
    /// Events produced while disconnected stay queued in `events` and are
    /// delivered after the next handshake.
    pub async fn run(
        &self,
        orchestrator: Orchestrator,
        mut events: mpsc::UnboundedReceiver<OutboundEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let connect = tokio::select! {
                () = shutdown.cancelled() => return,
                result = connect_async(self.url.as_str()) => result,
            };
            match connect {
                Ok((ws, _)) => {
                    info!(url = %self.url, node = %self.node_id, "connected to signaling server");
                    match self.session(ws, &orchestrator, &mut events, &shutdown).await {
                        SessionEnd::Disconnect => {
                            info!("signaling server requested disconnect");
                            shutdown.cancel();
                            return;
                        }
                        SessionEnd::Shutdown => return,
                        SessionEnd::Lost(reason) => {
                            warn!(url = %self.url, reason, "signaling connection lost");
                        }
                    }
                }
                Err(e) => warn!(url = %self.url, error = %e, "signaling connect failed"),
            }

            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
    }

    async fn session<S>(
        &self,
        ws: WebSocketStream<S>,
        orchestrator: &Orchestrator,
        events: &mut mpsc::UnboundedReceiver<OutboundEvent>,
        shutdown: &CancellationToken,
    ) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();

        let handshake = OutboundEvent::Handshake {
            erizodid: self.node_id.to_string(),
        };
        if let Err(e) = send(&mut write, &handshake).await {
            return SessionEnd::Lost(e);
        }

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                Some(event) = events.recv() => {
                    if let Err(e) = send(&mut write, &event).await {
                        return SessionEnd::Lost(e);
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match InboundMessage::parse(&text) {
                        Ok(InboundMessage::Disconnect) => return SessionEnd::Disconnect,
                        Ok(InboundMessage::HandshakeRes(body)) => {
                            debug!(%body, "handshake acknowledged");
                        }
                        Ok(message) => orchestrator.handle(message),
                        Err(e) => warn!(error = %e, "dropping signaling frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Lost(format!("closed by server: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                },
            }
        }
    }
}

async fn send<W>(write: &mut W, event: &OutboundEvent) -> Result<(), String>
where
    W: futures::Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    let frame = match event.encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(key = event.key(), error = %e, "outbound event not encodable");
            return Ok(());
        }
    };
    write
        .send(Message::Text(frame))
        .await
        .map_err(|e| e.to_string())
}
