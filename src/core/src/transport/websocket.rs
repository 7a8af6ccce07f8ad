//! WebSocket transport over `tokio-tungstenite`.
//!
//! Each `open` spawns one task that performs the handshake and then
//! multiplexes outbound frames, inbound frames and cancellation. The task
//! reports everything through the session's signal channel.

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, Request};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Credentials, Transport, TransportEvent, TransportFailure, TransportSignal};
use crate::error::{ChatError, Result};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::reconnect::CloseReason;

struct ActiveSocket {
    epoch: u64,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
}

/// Production transport.
pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
    signals: mpsc::UnboundedSender<TransportSignal>,
    active: Option<ActiveSocket>,
}

impl WebSocketTransport {
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Duration,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            signals,
            active: None,
        }
    }

    fn build_request(&self, credentials: &Credentials) -> Result<Request<()>> {
        let mut url = reqwest::Url::parse(&self.url)
            .map_err(|e| ChatError::invalid_config(format!("Invalid socket url: {}", e)))?;
        url.query_pairs_mut().append_pair("userId", &credentials.user_id);

        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.token))
            .map_err(|_| ChatError::auth("Token contains characters not allowed in a header"))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);
        Ok(request)
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self, credentials: &Credentials, epoch: u64) -> Result<()> {
        self.close();

        let request = self.build_request(credentials)?;
        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_socket(SocketTask {
            request,
            connect_timeout: self.connect_timeout,
            epoch,
            signals: self.signals.clone(),
            outbound: outbound_rx,
            cancel: cancel.clone(),
            open: open.clone(),
        }));

        debug!(epoch, url = %self.url, "Opening socket");
        self.active = Some(ActiveSocket {
            epoch,
            cancel,
            outbound: outbound_tx,
            open,
        });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(active) = self.active.take() {
            active.open.store(false, Ordering::SeqCst);
            active.cancel.cancel();
            debug!(epoch = active.epoch, "Closed socket");
        }
    }

    fn emit(&mut self, event: &ClientEvent) -> Result<()> {
        let active = self
            .active
            .as_ref()
            .filter(|a| a.open.load(Ordering::SeqCst))
            .ok_or_else(ChatError::not_connected)?;

        let frame = event.to_frame()?;
        active
            .outbound
            .send(frame)
            .map_err(|_| ChatError::not_connected())
    }

    fn is_open(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.open.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct SocketTask {
    request: Request<()>,
    connect_timeout: Duration,
    epoch: u64,
    signals: mpsc::UnboundedSender<TransportSignal>,
    outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    open: Arc<AtomicBool>,
}

impl SocketTask {
    fn signal(&self, event: TransportEvent) {
        let _ = self.signals.send(TransportSignal {
            epoch: self.epoch,
            event,
        });
    }
}

fn mentions_auth(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("auth") || lower.contains("token")
}

async fn run_socket(mut task: SocketTask) {
    let request = std::mem::replace(&mut task.request, Request::new(()));
    let handshake = tokio::time::timeout(
        task.connect_timeout,
        tokio_tungstenite::connect_async(request),
    );

    let connected = tokio::select! {
        _ = task.cancel.cancelled() => return,
        result = handshake => result,
    };

    let mut ws = match connected {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(WsError::Http(response))) if matches!(response.status().as_u16(), 401 | 403) => {
            let reason = format!("Handshake rejected with HTTP {}", response.status());
            warn!(epoch = task.epoch, %reason, "Socket authentication failed");
            task.signal(TransportEvent::Error(TransportFailure::AuthRejected { reason }));
            return;
        }
        Ok(Err(e)) => {
            warn!(epoch = task.epoch, error = %e, "Socket connect failed");
            task.signal(TransportEvent::Error(TransportFailure::Network {
                message: e.to_string(),
            }));
            return;
        }
        Err(_) => {
            ChatError::connect_timeout(task.connect_timeout).log();
            task.signal(TransportEvent::Closed(CloseReason::PingTimeout));
            return;
        }
    };

    task.open.store(true, Ordering::SeqCst);
    info!(epoch = task.epoch, "Socket open");
    task.signal(TransportEvent::Opened);

    loop {
        tokio::select! {
            _ = task.cancel.cancelled() => {
                let _ = ws.close(None).await;
                break;
            }

            frame = task.outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = ws.close(None).await;
                    break;
                };
                if let Err(e) = ws.send(WsMessage::Text(frame)).await {
                    warn!(epoch = task.epoch, error = %e, "Socket write failed");
                    task.signal(TransportEvent::Closed(CloseReason::TransportError));
                    break;
                }
            }

            inbound = ws.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => match ServerEvent::from_frame(&text) {
                    Ok(Some(ServerEvent::ConnectError { message })) if mentions_auth(&message) => {
                        warn!(epoch = task.epoch, reason = %message, "Server rejected credentials");
                        task.signal(TransportEvent::Error(TransportFailure::AuthRejected {
                            reason: message,
                        }));
                        break;
                    }
                    Ok(Some(event)) => task.signal(TransportEvent::Inbound(event)),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(epoch = task.epoch, error = %e, "Dropping malformed frame");
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(epoch = task.epoch, frame = ?frame, "Server closed socket");
                    task.signal(TransportEvent::Closed(CloseReason::ServerInitiated));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(epoch = task.epoch, error = %e, "Socket read failed");
                    task.signal(TransportEvent::Closed(CloseReason::TransportError));
                    break;
                }
                None => {
                    task.signal(TransportEvent::Closed(CloseReason::TransportClose));
                    break;
                }
            },
        }
    }

    task.open.store(false, Ordering::SeqCst);
    debug!(epoch = task.epoch, "Socket task finished");
}
