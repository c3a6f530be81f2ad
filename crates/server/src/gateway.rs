//! WebSocket transport: handshake authentication, the connection limit,
//! heartbeats and the per-connection read/write loops.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use huddle_core::{identity::Identity, ClientEvent, ServerEvent};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    config::GatewayConfig,
    error::ChatError,
    hub::Outbound,
    messaging::{Connection, MessagingService},
    session::{bearer_token, IdentityGate},
    AppState,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

/// Query string of the upgrade request. Browsers cannot set headers on a
/// WebSocket handshake, so the credential may travel as `?token=`.
#[derive(Debug, Default, Deserialize)]
pub struct GatewayParams {
    #[serde(default)]
    token: Option<String>,
}

pub struct Gateway {
    service: Arc<MessagingService>,
    gate: IdentityGate,
    semaphore: Arc<Semaphore>,
    heartbeat_interval: Duration,
    max_missed_heartbeats: u32,
    outbound_buffer: usize,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl Gateway {
    pub fn new(service: Arc<MessagingService>, gate: IdentityGate, config: &GatewayConfig) -> Self {
        Self {
            service,
            gate,
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            heartbeat_interval: config.heartbeat_interval(),
            max_missed_heartbeats: config.max_missed_heartbeats,
            outbound_buffer: config.outbound_buffer,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn service(&self) -> &Arc<MessagingService> {
        &self.service
    }

    pub fn gate(&self) -> &IdentityGate {
        &self.gate
    }

    /// Authenticates the handshake, then claims a connection slot.
    pub async fn open(self: Arc<Self>, token: Option<&str>, ws: WebSocketUpgrade) -> Response {
        let identity = match self.gate.authenticate(token).await {
            Ok(identity) => identity,
            Err(err) => {
                debug!(reason = err.code(), "gateway handshake rejected");
                let err = ChatError::from(err);
                self.record_event("handshake", err.code());
                return err.into_response();
            }
        };

        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                ws.on_upgrade(move |socket| self.run_connection(socket, identity, permit))
            }
            Err(_) => {
                warn!(user_id = %identity.user_id, "gateway connection limit reached");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorBody {
                        error: "connection_limit",
                    }),
                )
                    .into_response()
            }
        }
    }

    async fn run_connection(
        self: Arc<Self>,
        socket: WebSocket,
        identity: Identity,
        _permit: OwnedSemaphorePermit,
    ) {
        let (tx, rx) = mpsc::channel::<Outbound>(self.outbound_buffer);
        let mut conn = Connection::new(identity);
        info!(connection_id = %conn.id, user_id = %conn.identity.user_id, "gateway connection opened");
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.gateway_connections.inc();
        }

        let (sink, mut stream) = socket.split();
        let missed = Arc::new(AtomicU32::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let mut writer = tokio::spawn(write_loop(
            sink,
            rx,
            missed.clone(),
            finished.clone(),
            self.heartbeat_interval,
            self.max_missed_heartbeats,
        ));
        self.service.connect(&conn, tx).await;

        let mut writer_done = false;
        loop {
            tokio::select! {
                _ = &mut writer => {
                    writer_done = true;
                    break;
                }
                frame = stream.next() => {
                    let Some(Ok(frame)) = frame else {
                        break;
                    };
                    missed.store(0, Ordering::SeqCst);
                    match frame {
                        WsMessage::Text(text) => self.dispatch(&mut conn, text.as_str()).await,
                        WsMessage::Binary(_) => {
                            self.service
                                .hub()
                                .send_to(
                                    conn.id,
                                    ServerEvent::error("binary frames are not supported", "validation_error"),
                                )
                                .await;
                        }
                        WsMessage::Close(_) => break,
                        WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                    }
                }
            }
        }

        finished.store(true, Ordering::SeqCst);
        let connection_id = conn.id;
        let user_id = conn.identity.user_id;
        self.service.disconnect(conn).await;
        if !writer_done && timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.gateway_connections.dec();
        }
        info!(connection_id = %connection_id, user_id = %user_id, "gateway connection closed");
    }

    async fn dispatch(&self, conn: &mut Connection, text: &str) {
        let event: ClientEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(err) => {
                debug!(?err, connection_id = %conn.id, "rejected malformed gateway frame");
                self.record_event("unknown", "validation_error");
                self.service
                    .hub()
                    .send_to(
                        conn.id,
                        ServerEvent::error("unrecognized or malformed event", "validation_error"),
                    )
                    .await;
                return;
            }
        };

        let name = event.name();
        match self.service.handle(conn, event).await {
            Ok(()) => self.record_event(name, "ok"),
            Err(err) => {
                if err.is_server_side() {
                    error!(?err, event = name, user_id = %conn.identity.user_id, "gateway operation failed");
                } else {
                    warn!(code = err.code(), event = name, user_id = %conn.identity.user_id, "gateway operation rejected: {err}");
                }
                self.record_event(name, err.code());
                self.service.hub().send_to(conn.id, err.to_event()).await;
            }
        }
    }

    fn record_event(&self, event: &str, outcome: &str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_event(event, outcome);
        }
        #[cfg(not(feature = "metrics"))]
        {
            let _ = (event, outcome);
        }
    }
}

async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
    missed: Arc<AtomicU32>,
    finished: Arc<AtomicBool>,
    heartbeat: Duration,
    max_missed: u32,
) {
    let mut ticker = interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(event) = outbound else {
                    // The hub dropped our queue without the reader finishing: evicted.
                    if !finished.load(Ordering::SeqCst) {
                        close(&mut sink, "outbound queue overflow").await;
                    }
                    break;
                };
                let text = match serde_json::to_string(&*event) {
                    Ok(text) => text,
                    Err(err) => {
                        error!(?err, "failed to encode gateway event");
                        continue;
                    }
                };
                match timeout(SEND_TIMEOUT, sink.send(WsMessage::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!("gateway send timeout");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if missed.fetch_add(1, Ordering::SeqCst) >= max_missed {
                    debug!("gateway heartbeat timed out");
                    close(&mut sink, "heartbeat timeout").await;
                    break;
                }
                let ping = timeout(SEND_TIMEOUT, sink.send(WsMessage::Ping(Bytes::new()))).await;
                if !matches!(ping, Ok(Ok(()))) {
                    break;
                }
            }
        }
    }
}

async fn close(sink: &mut futures::stream::SplitSink<WebSocket, WsMessage>, reason: &'static str) {
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Utf8Bytes::from_static(reason),
    };
    let _ = timeout(SEND_TIMEOUT, sink.send(WsMessage::Close(Some(frame)))).await;
}

pub async fn gateway_socket(
    State(state): State<AppState>,
    Query(params): Query<GatewayParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers));
    state.gateway().open(token, ws).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::InMemoryChatStore, users::InMemoryUserDirectory};
    use huddle_core::identity::Role;
    use huddle_crypto::SigningSecret;

    async fn gateway() -> (Gateway, Identity) {
        let users = Arc::new(InMemoryUserDirectory::new());
        let record = users
            .add_user("ana", "ana@example.org", Role::Member, None)
            .await;
        let config = GatewayConfig::default();
        let service = Arc::new(MessagingService::new(
            Arc::new(InMemoryChatStore::new()),
            users.clone(),
            &config,
        ));
        let gate = IdentityGate::new(SigningSecret::generate(), users, 1);
        (
            Gateway::new(service, gate, &config),
            crate::users::identity_of(&record),
        )
    }

    #[tokio::test]
    async fn malformed_frames_answer_with_validation_error() {
        let (gateway, identity) = gateway().await;
        let mut conn = Connection::new(identity);
        let (tx, mut rx) = mpsc::channel(8);
        gateway.service().connect(&conn, tx).await;
        let _ready = rx.recv().await;

        gateway.dispatch(&mut conn, "{\"event\":\"launch_rockets\"}").await;
        match &*rx.recv().await.expect("error event") {
            ServerEvent::Error { code, .. } => assert_eq!(code, "validation_error"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_operations_only_reach_the_requester() {
        let (gateway, identity) = gateway().await;
        let mut conn = Connection::new(identity);
        let (tx, mut rx) = mpsc::channel(8);
        gateway.service().connect(&conn, tx).await;
        let _ready = rx.recv().await;

        gateway
            .dispatch(
                &mut conn,
                r#"{"event":"join_channel","data":"does-not-exist"}"#,
            )
            .await;
        match &*rx.recv().await.expect("error event") {
            ServerEvent::Error { code, .. } => assert_eq!(code, "not_found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn issued_credentials_authenticate() {
        let (gateway, identity) = gateway().await;
        let issued = gateway
            .gate()
            .issue(identity.user_id, chrono::Utc::now())
            .expect("issue");
        let resolved = gateway
            .gate()
            .authenticate(Some(&issued.token))
            .await
            .expect("valid credential");
        assert_eq!(resolved, identity);
    }
}
