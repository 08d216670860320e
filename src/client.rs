use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    Connector,
};
use tracing::{debug, info, warn};

use crate::{
    error::ApiError,
    lockfile::{discover_credentials, Credentials, InstallLocator},
};

pub const GAMEFLOW_PHASE_URI: &str = "/lol-gameflow/v1/gameflow-phase";

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(3);
const EVENT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
const REST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    GameflowPhase(String),
}

#[derive(Debug, Default)]
struct SessionShared {
    credentials: RwLock<Option<Credentials>>,
}

/// Request-capable handle over the client session. Credentials are read at
/// call time, so a handle taken before connect starts working after it.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    client: reqwest::Client,
}

impl SessionHandle {
    pub fn new() -> Result<Self> {
        // The client serves a self-signed certificate on loopback; this
        // permissive client must never be pointed at a cloud endpoint.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REST_TIMEOUT)
            .build()
            .context("failed building client session http client")?;
        Ok(Self {
            shared: Arc::new(SessionShared::default()),
            client,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.credentials().is_some()
    }

    fn credentials(&self) -> Option<Credentials> {
        self.shared
            .credentials
            .read()
            .ok()
            .and_then(|guard| guard.clone())
    }

    fn store_credentials(&self, credentials: Option<Credentials>) {
        if let Ok(mut guard) = self.shared.credentials.write() {
            *guard = credentials;
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let credentials = self.credentials().ok_or(ApiError::NotConnected)?;
        let url = format!("{}{}", credentials.base_url(), path);
        let response = self
            .client
            .get(url)
            .basic_auth("riot", Some(&credentials.secret))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body = response
            .json::<Value>()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        Ok(body)
    }
}

/// Polls for a running client every 3 s. Transitions are edge-triggered:
/// finding credentials opens the event channel and emits `Connected`; losing
/// them closes it and emits `Disconnected`. Discovery never raises.
pub fn spawn_session_worker(
    locator: Arc<dyn InstallLocator>,
    handle: SessionHandle,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_discovery_loop(locator, handle, events_tx).await;
    })
}

async fn run_discovery_loop(
    locator: Arc<dyn InstallLocator>,
    handle: SessionHandle,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut event_channel: Option<JoinHandle<()>> = None;
    loop {
        let found = discover_credentials(locator.as_ref());
        let current = handle.credentials();
        match (current, found) {
            (None, Some(credentials)) => {
                info!(
                    pid = credentials.process_id,
                    port = credentials.port,
                    "client discovered, session connected"
                );
                handle.store_credentials(Some(credentials));
                event_channel = Some(spawn_event_channel(handle.clone(), events_tx.clone()));
                if events_tx.send(SessionEvent::Connected).is_err() {
                    return;
                }
            }
            (Some(_), None) => {
                info!("client gone, session disconnected");
                handle.store_credentials(None);
                if let Some(task) = event_channel.take() {
                    task.abort();
                }
                if events_tx.send(SessionEvent::Disconnected).is_err() {
                    return;
                }
            }
            (Some(previous), Some(next)) if previous != next => {
                // Client restart under the poll interval: new port/secret.
                info!(port = next.port, "client credentials rotated, reconnecting");
                handle.store_credentials(Some(next));
                if let Some(task) = event_channel.take() {
                    task.abort();
                }
                event_channel = Some(spawn_event_channel(handle.clone(), events_tx.clone()));
                let _ = events_tx.send(SessionEvent::Disconnected);
                if events_tx.send(SessionEvent::Connected).is_err() {
                    return;
                }
            }
            _ => {}
        }
        sleep(DISCOVERY_INTERVAL).await;
    }
}

fn spawn_event_channel(
    handle: SessionHandle,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_event_channel(handle, events_tx).await;
    })
}

/// Persistent subscription to the client event bus. Reconnects after 3 s
/// while credentials remain valid; stops for good once they are cleared.
async fn run_event_channel(handle: SessionHandle, events_tx: mpsc::UnboundedSender<SessionEvent>) {
    loop {
        let Some(credentials) = handle.credentials() else {
            debug!("credentials cleared, event channel stopping");
            return;
        };
        match connect_event_socket(&credentials).await {
            Ok(mut socket) => {
                let subscribe = json!([5, "OnJsonApiEvent"]).to_string();
                if socket.send(Message::Text(subscribe)).await.is_err() {
                    warn!("failed to send event bus subscribe frame");
                } else {
                    info!("subscribed to client event bus");
                }
                while let Some(next) = socket.next().await {
                    let text = match next {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(err) => {
                            warn!(?err, "event bus read error");
                            break;
                        }
                    };
                    let Some(frame) = parse_event_frame(&text) else {
                        continue;
                    };
                    if frame.uri == GAMEFLOW_PHASE_URI {
                        let phase = frame
                            .data
                            .as_str()
                            .map(str::to_owned)
                            .unwrap_or_else(|| frame.data.to_string());
                        if events_tx.send(SessionEvent::GameflowPhase(phase)).is_err() {
                            return;
                        }
                    }
                }
                warn!("event bus disconnected, retrying");
            }
            Err(err) => {
                warn!(?err, "failed connecting to client event bus");
            }
        }
        sleep(EVENT_RECONNECT_DELAY).await;
    }
}

async fn connect_event_socket(
    credentials: &Credentials,
) -> Result<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
> {
    let mut request = credentials
        .websocket_url()
        .into_client_request()
        .context("invalid event bus url")?;
    let token = base64::engine::general_purpose::STANDARD
        .encode(format!("riot:{}", credentials.secret));
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Basic {token}"))
            .context("credentials produced an invalid auth header")?,
    );
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .context("failed building loopback tls connector")?;
    let (socket, _response) = connect_async_tls_with_config(
        request,
        None,
        false,
        Some(Connector::NativeTls(tls)),
    )
    .await
    .context("event bus handshake failed")?;
    Ok(socket)
}

#[derive(Debug)]
struct EventFrame {
    uri: String,
    data: Value,
}

/// Incoming frames look like `[8, "OnJsonApiEvent", {uri, data, eventType}]`.
/// Anything else is dropped silently.
fn parse_event_frame(text: &str) -> Option<EventFrame> {
    let root = serde_json::from_str::<Value>(text).ok()?;
    let items = root.as_array()?;
    if items.len() < 3 || items[0].as_u64() != Some(8) {
        return None;
    }
    let payload = items[2].as_object()?;
    let uri = payload.get("uri")?.as_str()?.to_owned();
    let data = payload.get("data").cloned().unwrap_or(Value::Null);
    Some(EventFrame { uri, data })
}
