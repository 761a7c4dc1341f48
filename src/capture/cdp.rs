//! Chrome DevTools Protocol capture source
//!
//! One browser-level WebSocket carries every command and event. The page is
//! attached as a flattened session, so page events arrive tagged with its
//! `sessionId` and commands for it are sent with the same tag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use dashmap::DashMap;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::headers::Headers;
use crate::{RecorderError, Result};

use super::browser::BrowserProcess;
use super::{
    ready, CaptureSource, CapturedRequest, CapturedResponse, Deferred, Exchange, Timing,
    EXCHANGE_CHANNEL_SIZE,
};

/// How long `close` waits for the browser to exit on its own
const CLOSE_TIMEOUT_MS: u64 = 5000;

type Pending = DashMap<u64, oneshot::Sender<Result<Value>>>;

/// Protocol event
#[derive(Debug, Clone, Deserialize)]
pub struct CdpEvent {
    /// Event name, e.g. `Network.loadingFinished`
    pub method: String,
    /// Event payload
    #[serde(default)]
    pub params: Value,
    /// Flattened target session the event belongs to
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

/// Command/response multiplexer over one DevTools WebSocket
pub struct CdpConnection {
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Arc<Pending>,
}

impl CdpConnection {
    /// Connect to a DevTools WebSocket endpoint
    ///
    /// Returns the connection and the stream of protocol events.
    ///
    /// # Errors
    ///
    /// Returns error if the WebSocket handshake fails
    pub async fn connect(ws_url: &str) -> Result<(Self, mpsc::UnboundedReceiver<CdpEvent>)> {
        let (stream, _) = tokio_tungstenite::connect_async(ws_url).await?;
        let (mut sink, mut stream) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: Arc<Pending> = Arc::new(DashMap::new());

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("DevTools write failed: {}", e);
                    break;
                }
            }
            sink.close().await.ok();
        });

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => route_message(&text, &reader_pending, &events_tx),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("DevTools read failed: {}", e);
                        break;
                    }
                }
            }
            // Dropping the senders fails every outstanding call
            reader_pending.clear();
            debug!("DevTools connection closed");
        });

        Ok((
            Self {
                next_id: AtomicU64::new(1),
                outgoing,
                pending,
            },
            events_rx,
        ))
    }

    /// Send a command and wait for its result
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed or the browser answers
    /// with a protocol error
    pub async fn call(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            message["sessionId"] = Value::String(session_id.to_string());
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if self.outgoing.send(Message::Text(message.to_string())).is_err() {
            self.pending.remove(&id);
            return Err(RecorderError::Protocol(format!(
                "{method}: connection closed"
            )));
        }

        rx.await.map_err(|_| {
            RecorderError::Protocol(format!("{method}: connection closed before reply"))
        })?
    }
}

/// Route one incoming frame to its pending call or the event stream
fn route_message(text: &str, pending: &Pending, events: &mpsc::UnboundedSender<CdpEvent>) {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Malformed DevTools message: {}", e);
            return;
        }
    };

    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        let Some((_, reply)) = pending.remove(&id) else {
            debug!("Reply for unknown command id {}", id);
            return;
        };
        let result = match message.get("error") {
            Some(error) => Err(RecorderError::Protocol(
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        reply.send(result).ok();
        return;
    }

    match serde_json::from_value::<CdpEvent>(message) {
        Ok(event) => {
            events.send(event).ok();
        }
        Err(e) => warn!("Unrecognized DevTools message: {}", e),
    }
}

/// Capture source backed by a locally launched Chromium
pub struct CdpCaptureSource {
    config: BrowserConfig,
    browser: Option<BrowserProcess>,
    connection: Option<Arc<CdpConnection>>,
    tracker: Option<JoinHandle<()>>,
}

impl CdpCaptureSource {
    /// Create a source; nothing is launched until `open`
    #[must_use]
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            browser: None,
            connection: None,
            tracker: None,
        }
    }

    async fn attach_page(connection: &CdpConnection) -> Result<String> {
        let target = connection
            .call("Target.createTarget", json!({ "url": "about:blank" }), None)
            .await?;
        let target_id = target
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| RecorderError::Protocol("createTarget returned no targetId".to_string()))?;

        let attached = connection
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| RecorderError::Protocol("attachToTarget returned no sessionId".to_string()))?
            .to_string();

        connection
            .call("Network.enable", json!({}), Some(&session_id))
            .await?;
        connection
            .call("Page.enable", json!({}), Some(&session_id))
            .await?;

        Ok(session_id)
    }
}

impl CaptureSource for CdpCaptureSource {
    async fn open(&mut self, url: &str) -> Result<mpsc::Receiver<Exchange>> {
        if self.browser.is_some() {
            return Err(RecorderError::InvalidState(
                "capture source already open".to_string(),
            ));
        }

        // On any error below the browser handle is dropped, which kills it
        let browser = BrowserProcess::launch(&self.config).await?;
        let (connection, events) = CdpConnection::connect(browser.ws_url()).await?;
        let connection = Arc::new(connection);
        let session_id = Self::attach_page(&connection).await?;

        let (tx, rx) = mpsc::channel(EXCHANGE_CHANNEL_SIZE);
        let tracker = NetworkTracker {
            connection: Arc::clone(&connection),
            session_id: session_id.clone(),
            exchanges: tx,
            page_url: url.to_string(),
            requests: HashMap::new(),
        };
        let tracker = tokio::spawn(tracker.run(events));

        let navigation = match connection
            .call("Page.navigate", json!({ "url": url }), Some(&session_id))
            .await
        {
            Ok(navigation) => navigation,
            Err(e) => {
                tracker.abort();
                return Err(RecorderError::Navigation(format!("{url}: {e}")));
            }
        };
        if let Some(error) = navigation
            .get("errorText")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
        {
            tracker.abort();
            return Err(RecorderError::Navigation(format!("{url}: {error}")));
        }

        info!("Navigated to {}", url);

        self.browser = Some(browser);
        self.connection = Some(connection);
        self.tracker = Some(tracker);
        Ok(rx)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(tracker) = self.tracker.take() {
            tracker.abort();
        }

        let Some(mut browser) = self.browser.take() else {
            return Ok(());
        };

        let grace = Duration::from_millis(CLOSE_TIMEOUT_MS);
        if let Some(connection) = self.connection.take() {
            // The browser usually drops the socket before it can reply
            let closing = connection.call("Browser.close", json!({}), None);
            if let Ok(Err(e)) = tokio::time::timeout(grace, closing).await {
                debug!("Browser.close: {}", e);
            }
        }

        browser.shutdown(grace).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestWillBeSent {
    request_id: String,
    request: CdpRequest,
    /// Seconds, same clock as `ResourceTiming::request_time`
    #[serde(default)]
    timestamp: Option<f64>,
    /// Response of the previous hop when this request follows a redirect
    #[serde(default)]
    redirect_response: Option<CdpResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdpRequest {
    url: String,
    method: String,
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    post_data: Option<String>,
    #[serde(default)]
    has_post_data: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseReceived {
    request_id: String,
    response: CdpResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdpResponse {
    status: u16,
    #[serde(default)]
    status_text: String,
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    timing: Option<ResourceTiming>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceTiming {
    /// Seconds, monotonic browser clock
    request_time: f64,
    /// Milliseconds relative to `request_time`
    send_start: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFinished {
    request_id: String,
    /// Seconds, same clock as `ResourceTiming::request_time`
    timestamp: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFailed {
    request_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameNavigated {
    frame: Frame,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Frame {
    #[serde(default)]
    parent_id: Option<String>,
    url: String,
}

struct TrackedRequest {
    request: CdpRequest,
    response: Option<CdpResponse>,
}

/// Correlates network events per request id and emits finished exchanges
struct NetworkTracker {
    connection: Arc<CdpConnection>,
    session_id: String,
    exchanges: mpsc::Sender<Exchange>,
    page_url: String,
    requests: HashMap<String, TrackedRequest>,
}

impl NetworkTracker {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<CdpEvent>) {
        while let Some(event) = events.recv().await {
            if event.session_id.as_deref() != Some(self.session_id.as_str()) {
                continue;
            }

            let exchange = match self.handle(event) {
                Ok(exchange) => exchange,
                Err(e) => {
                    warn!("Ignoring DevTools event: {}", e);
                    continue;
                }
            };

            if let Some(exchange) = exchange {
                if self.exchanges.send(exchange).await.is_err() {
                    debug!("Exchange receiver dropped, stopping network tracker");
                    break;
                }
            }
        }
    }

    fn handle(&mut self, event: CdpEvent) -> Result<Option<Exchange>> {
        match event.method.as_str() {
            "Network.requestWillBeSent" => {
                let sent: RequestWillBeSent = serde_json::from_value(event.params)?;
                // A redirect reuses the request id; the previous hop is
                // finished by its redirect response, which has no body
                let hop = self.requests.insert(
                    sent.request_id.clone(),
                    TrackedRequest {
                        request: sent.request,
                        response: None,
                    },
                );
                if let (Some(hop), Some(redirect)) = (hop, sent.redirect_response) {
                    return Ok(Some(self.exchange(
                        &sent.request_id,
                        hop.request,
                        redirect,
                        sent.timestamp,
                        ready(Ok(String::new())),
                    )));
                }
            }
            "Network.responseReceived" => {
                let received: ResponseReceived = serde_json::from_value(event.params)?;
                if let Some(tracked) = self.requests.get_mut(&received.request_id) {
                    tracked.response = Some(received.response);
                }
            }
            "Network.loadingFinished" => {
                let finished: LoadingFinished = serde_json::from_value(event.params)?;
                if let Some(TrackedRequest {
                    request,
                    response: Some(response),
                }) = self.requests.remove(&finished.request_id)
                {
                    let body = self.deferred_response_body(&finished.request_id);
                    return Ok(Some(self.exchange(
                        &finished.request_id,
                        request,
                        response,
                        Some(finished.timestamp),
                        body,
                    )));
                }
            }
            "Network.loadingFailed" => {
                let failed: LoadingFailed = serde_json::from_value(event.params)?;
                self.requests.remove(&failed.request_id);
            }
            "Page.frameNavigated" => {
                let navigated: FrameNavigated = serde_json::from_value(event.params)?;
                if navigated.frame.parent_id.is_none() {
                    debug!("Page navigated: {}", navigated.frame.url);
                    self.page_url = navigated.frame.url;
                }
            }
            _ => {}
        }
        Ok(None)
    }

    fn exchange(
        &self,
        request_id: &str,
        request: CdpRequest,
        response: CdpResponse,
        finished_at: Option<f64>,
        response_body: Deferred<String>,
    ) -> Exchange {
        let timing = response
            .timing
            .as_ref()
            .zip(finished_at)
            .map(|(timing, finished_at)| Timing {
                request_start_ms: timing.request_time * 1000.0 + timing.send_start,
                response_end_ms: finished_at * 1000.0,
            });

        let request_body = match request.post_data {
            Some(data) => ready(Ok(Some(data))),
            None if request.has_post_data => self.deferred_post_data(request_id),
            None => ready(Ok(None)),
        };

        Exchange {
            request: CapturedRequest {
                method: request.method,
                url: request.url,
                headers: request.headers,
                body: request_body,
            },
            response: CapturedResponse {
                status: response.status,
                status_text: response.status_text,
                headers: response.headers,
                body: response_body,
            },
            page_url: self.page_url.clone(),
            timing,
        }
    }

    fn deferred_response_body(&self, request_id: &str) -> Deferred<String> {
        let connection = Arc::clone(&self.connection);
        let session_id = self.session_id.clone();
        let params = json!({ "requestId": request_id });
        async move {
            let result = connection
                .call("Network.getResponseBody", params, Some(&session_id))
                .await?;
            decode_body(&result)
        }
        .boxed()
    }

    fn deferred_post_data(&self, request_id: &str) -> Deferred<Option<String>> {
        let connection = Arc::clone(&self.connection);
        let session_id = self.session_id.clone();
        let params = json!({ "requestId": request_id });
        async move {
            let result = connection
                .call("Network.getRequestPostData", params, Some(&session_id))
                .await?;
            Ok(result
                .get("postData")
                .and_then(Value::as_str)
                .map(str::to_owned))
        }
        .boxed()
    }
}

/// Body text from a `Network.getResponseBody` result
fn decode_body(result: &Value) -> Result<String> {
    let body = result.get("body").and_then(Value::as_str).unwrap_or_default();
    let encoded = result
        .get("base64Encoded")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if !encoded {
        return Ok(body.to_string());
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| RecorderError::Protocol(format!("invalid base64 body: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
