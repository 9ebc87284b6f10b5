//! Network delivery layer with categorized retry/backoff
//!
//! Every terminal transport error falls into one of three buckets:
//! - connectivity lost mid-request: the request parks in a shared pending
//!   list and a single delayed flush-all releases the whole list after the
//!   backoff window
//! - not connected / timeout: the same request retries after the backoff
//!   window; the window grows by a fixed increment up to a ceiling per
//!   logical flow and resets to the base delay on any success
//! - everything else (including non-2xx and undecodable bodies): terminal,
//!   surfaced to the caller as failure
//!
//! Success bodies parse as a JSON object, or a JSON array wrapped under the
//! `data` sentinel key.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::SessionHandle;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// API base path
pub const BASE_PATH: &str = "/api/v1/sdk";

/// Sentinel key wrapping JSON array responses
pub const ARRAY_SENTINEL_KEY: &str = "data";

/// Platform literal sent on every request
pub const PLATFORM: &str = "rust";

/// Header names
pub const HEADER_PROJECT_KEY: &str = "project-key";
/// Bundle identifier header
pub const HEADER_IDENTIFIER: &str = "identifier";
/// Platform header
pub const HEADER_PLATFORM: &str = "platform";
/// SDK version header
pub const HEADER_SDK_VERSION: &str = "sdk-version";
/// Session correlation id header
pub const HEADER_SESSION_ID: &str = "linksquared-id";
/// Forwarded user agent header
pub const HEADER_USER_AGENT: &str = "user-agent";

/// Backend endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Device authentication
    Authenticate,
    /// Attribution payload for the device
    DataForDevice,
    /// Attribution payload for the device and a tapped URL
    DataForDeviceAndUrl,
    /// Generate a deep link
    CreateLink,
    /// Report one attribution event
    Event,
    /// Update visitor attributes
    VisitorAttributes,
    /// List notifications for the device
    NotificationsForDevice,
    /// Unread notification count
    NumberOfUnreadNotifications,
    /// Mark one notification read
    MarkNotificationAsRead,
    /// Messages the app should display automatically
    NotificationsToDisplayAutomatically,
    /// Resolve details for a link
    LinkDetails,
}

impl Endpoint {
    /// Path under the API base
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Authenticate => "/authenticate",
            Endpoint::DataForDevice => "/data_for_device",
            Endpoint::DataForDeviceAndUrl => "/data_for_device_and_url",
            Endpoint::CreateLink => "/create_link",
            Endpoint::Event => "/event",
            Endpoint::VisitorAttributes => "/visitor_attributes",
            Endpoint::NotificationsForDevice => "/notifications_for_device",
            Endpoint::NumberOfUnreadNotifications => "/number_of_unread_notifications",
            Endpoint::MarkNotificationAsRead => "/mark_notification_as_read",
            Endpoint::NotificationsToDisplayAutomatically => {
                "/notifications_to_display_automatically"
            }
            Endpoint::LinkDetails => "/link_details",
        }
    }

    /// Key identifying the logical flow for backoff bookkeeping
    pub fn flow_key(&self) -> &'static str {
        self.path()
    }
}

/// Failure category for a terminal transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection dropped mid-request; requeue and flush later
    ConnectivityLost,
    /// No connectivity / timed out; retry the same request after backoff
    Offline,
    /// Server rejection, decode failure or anything else; surfaced to caller
    Terminal,
}

/// Categorize a reqwest transport error
pub fn classify_transport_error(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() || err.is_connect() {
        FailureKind::Offline
    } else if err.is_body() || err.is_request() {
        FailureKind::ConnectivityLost
    } else {
        FailureKind::Terminal
    }
}

/// Linear backoff state for one logical flow
#[derive(Debug, Clone)]
pub struct BackoffState {
    delay: Duration,
    base: Duration,
    increment: Duration,
    max: Duration,
}

impl BackoffState {
    /// Start at the base delay
    pub fn new(base: Duration, increment: Duration, max: Duration) -> Self {
        Self {
            delay: base,
            base,
            increment,
            max,
        }
    }

    /// Delay to wait before the next attempt; grows the window afterwards
    pub fn advance(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay + self.increment).min(self.max);
        current
    }

    /// Reset to the base delay after any success
    pub fn reset(&mut self) {
        self.delay = self.base;
    }

    /// Current window without advancing
    pub fn current(&self) -> Duration {
        self.delay
    }
}

/// Transport seam so managers can be exercised without sockets
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// POST a JSON body, returning the parsed response object
    async fn post(&self, endpoint: Endpoint, body: Value) -> Result<Value>;
}

/// Requests parked after a mid-request connectivity loss
struct PendingGate {
    waiters: parking_lot::Mutex<Vec<oneshot::Sender<()>>>,
    flush_scheduled: AtomicBool,
}

impl PendingGate {
    fn new() -> Self {
        Self {
            waiters: parking_lot::Mutex::new(Vec::new()),
            flush_scheduled: AtomicBool::new(false),
        }
    }

    fn release_all(&self) {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        let waiters = std::mem::take(&mut *self.waiters.lock());
        debug!(count = waiters.len(), "Releasing pending requests for reflush");
        for tx in waiters {
            let _ = tx.send(());
        }
    }
}

/// HTTP client for the SDK backend
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    config: Arc<Config>,
    session: SessionHandle,
    backoff: parking_lot::Mutex<HashMap<&'static str, BackoffState>>,
    pending: PendingGate,
}

impl ApiClient {
    /// Create a client bound to the process-wide session
    pub fn new(config: Arc<Config>, session: SessionHandle) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.network.request_timeout_secs))
            .build()?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                config,
                session,
                backoff: parking_lot::Mutex::new(HashMap::new()),
                pending: PendingGate::new(),
            }),
        })
    }

    /// Issue a request, retrying transient failures until success or a
    /// terminal error
    pub async fn request(&self, endpoint: Endpoint, body: Value) -> Result<Value> {
        loop {
            match self.execute(endpoint, &body).await {
                Ok(value) => {
                    self.reset_backoff(endpoint);
                    return Ok(value);
                }
                Err(RequestFailure::Transient(kind, err)) => match kind {
                    FailureKind::Offline => {
                        let delay = self.advance_backoff(endpoint);
                        warn!(
                            endpoint = endpoint.path(),
                            delay_secs = delay.as_secs(),
                            error = %err,
                            "Offline, retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    FailureKind::ConnectivityLost => {
                        let delay = self.advance_backoff(endpoint);
                        warn!(
                            endpoint = endpoint.path(),
                            delay_secs = delay.as_secs(),
                            error = %err,
                            "Connectivity lost mid-request, queueing for delayed flush"
                        );
                        self.park_until_flush(delay).await;
                    }
                    FailureKind::Terminal => unreachable!("terminal errors are not transient"),
                },
                Err(RequestFailure::Terminal(err)) => {
                    error!(endpoint = endpoint.path(), error = %err, "Request failed terminally");
                    return Err(err);
                }
            }
        }
    }

    /// Single attempt: build headers, POST, enforce status, parse body
    async fn execute(
        &self,
        endpoint: Endpoint,
        body: &Value,
    ) -> std::result::Result<Value, RequestFailure> {
        let url = format!("{}{}{}", self.inner.config.base_url, BASE_PATH, endpoint.path());

        let mut request = self
            .inner
            .http
            .post(&url)
            .header(HEADER_PROJECT_KEY, self.inner.config.wire_project_key())
            .header(HEADER_IDENTIFIER, &self.inner.config.bundle_id)
            .header(HEADER_PLATFORM, PLATFORM)
            .header(HEADER_SDK_VERSION, env!("CARGO_PKG_VERSION"))
            .json(body);

        {
            let session = self.inner.session.snapshot();
            if let Some(id) = &session.linksquared_id {
                request = request.header(HEADER_SESSION_ID, id);
            }
            if let Some(agent) = &session.user_agent {
                request = request.header(HEADER_USER_AGENT, agent);
            }
        }

        let response = request.send().await.map_err(|e| {
            let kind = classify_transport_error(&e);
            match kind {
                FailureKind::Terminal => RequestFailure::Terminal(Error::Http(e.to_string())),
                _ => RequestFailure::Transient(kind, Error::Http(e.to_string())),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RequestFailure::Terminal(Error::Server(status.as_u16())));
        }

        let raw: Value = response.json().await.map_err(|e| {
            RequestFailure::Terminal(Error::Decode(e.to_string()))
        })?;

        parse_response_shape(raw).map_err(RequestFailure::Terminal)
    }

    /// Park the caller until the shared delayed flush fires
    async fn park_until_flush(&self, window: Duration) {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.waiters.lock().push(tx);

        if !self
            .inner
            .pending
            .flush_scheduled
            .swap(true, Ordering::SeqCst)
        {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                inner.pending.release_all();
            });
        }

        // Sender dropped only if the client itself is dropped
        let _ = rx.await;
    }

    fn advance_backoff(&self, endpoint: Endpoint) -> Duration {
        let net = &self.inner.config.network;
        let mut table = self.inner.backoff.lock();
        table
            .entry(endpoint.flow_key())
            .or_insert_with(|| {
                BackoffState::new(
                    net.base_retry_delay(),
                    net.retry_delay_increment(),
                    net.max_retry_delay(),
                )
            })
            .advance()
    }

    fn reset_backoff(&self, endpoint: Endpoint) {
        if let Some(state) = self.inner.backoff.lock().get_mut(endpoint.flow_key()) {
            state.reset();
        }
    }
}

#[async_trait]
impl ApiTransport for ApiClient {
    async fn post(&self, endpoint: Endpoint, body: Value) -> Result<Value> {
        self.request(endpoint, body).await
    }
}

enum RequestFailure {
    Transient(FailureKind, Error),
    Terminal(Error),
}

/// Accept a JSON object as-is, wrap an array under the sentinel key, and
/// reject every other shape
pub fn parse_response_shape(raw: Value) -> Result<Value> {
    match raw {
        Value::Object(_) => Ok(raw),
        Value::Array(items) => {
            let mut wrapped = serde_json::Map::new();
            wrapped.insert(ARRAY_SENTINEL_KEY.to_string(), Value::Array(items));
            Ok(Value::Object(wrapped))
        }
        other => Err(Error::Decode(format!(
            "unexpected response shape: {other}"
        ))),
    }
}
