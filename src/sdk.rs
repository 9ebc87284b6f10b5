//! SDK facade
//!
//! One `Grovs` instance per process, built by [`Grovs::configure`]. Wires
//! the durable stores, the event and payment managers, the auth gate and
//! the network client together, and exposes the public gated operations.

use crate::actions::{ActionKind, AuthGate, AuthState};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventLogManager;
use crate::lifecycle::LifecycleNotifier;
use crate::network::{ApiClient, ApiTransport, Endpoint, PLATFORM};
use crate::payments::{PaymentEventManager, PurchaseHistoryProvider};
use crate::session::SessionHandle;
use crate::storage::{
    DurableStore, StateStore, COLLECTION_EVENTS, COLLECTION_HANDLED, COLLECTION_PAYMENTS,
};
use crate::types::TransactionRecord;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Process-wide SDK instance
pub struct Grovs {
    config: Arc<Config>,
    session: SessionHandle,
    transport: Arc<dyn ApiTransport>,
    gate: Arc<AuthGate>,
    events: Arc<EventLogManager>,
    payments: Arc<PaymentEventManager>,
    lifecycle: Arc<LifecycleNotifier>,
    state: Arc<StateStore>,
    // Stale-result suppression for attribution fetches
    attribution_generation: AtomicU64,
}

impl Grovs {
    /// Configure the SDK and kick off authentication in the background
    ///
    /// Panics when the API key is empty: the one intentional hard stop.
    /// Every other configuration gap logs and short-circuits instead.
    pub async fn configure(
        config: Config,
        purchase_history: Option<Arc<dyn PurchaseHistoryProvider>>,
    ) -> Result<Arc<Self>> {
        assert!(
            !config.api_key.is_empty(),
            "Grovs: configure() called without a project API key"
        );

        let config = Arc::new(config);
        let session = SessionHandle::new(config.uri_scheme.clone(), config.user_agent.clone());
        let client = ApiClient::new(config.clone(), session.clone())?;

        let sdk = Self::assemble(config, session, Arc::new(client), purchase_history).await?;

        let auth_sdk = sdk.clone();
        tokio::spawn(async move {
            if let Err(e) = auth_sdk.authenticate().await {
                error!(error = %e, "Background authentication failed");
            }
        });

        Ok(sdk)
    }

    /// Configure against a custom transport (proxies, tests)
    pub async fn configure_with_transport(
        config: Config,
        transport: Arc<dyn ApiTransport>,
        purchase_history: Option<Arc<dyn PurchaseHistoryProvider>>,
    ) -> Result<Arc<Self>> {
        assert!(
            !config.api_key.is_empty(),
            "Grovs: configure() called without a project API key"
        );

        let config = Arc::new(config);
        let session = SessionHandle::new(config.uri_scheme.clone(), config.user_agent.clone());
        Self::assemble(config, session, transport, purchase_history).await
    }

    async fn assemble(
        config: Arc<Config>,
        session: SessionHandle,
        transport: Arc<dyn ApiTransport>,
        purchase_history: Option<Arc<dyn PurchaseHistoryProvider>>,
    ) -> Result<Arc<Self>> {
        let state = Arc::new(StateStore::open(&config.data_dir)?);
        let event_store = Arc::new(DurableStore::open(&config.data_dir, COLLECTION_EVENTS)?);
        let payment_store = Arc::new(DurableStore::open(&config.data_dir, COLLECTION_PAYMENTS)?);
        let handled_store = Arc::new(DurableStore::open(&config.data_dir, COLLECTION_HANDLED)?);

        let events = Arc::new(EventLogManager::new(
            event_store,
            state.clone(),
            transport.clone(),
            config.events.clone(),
        ));
        let payments = Arc::new(PaymentEventManager::new(
            payment_store,
            handled_store,
            transport.clone(),
            purchase_history,
        ));

        let lifecycle = Arc::new(LifecycleNotifier::new());
        lifecycle.register(events.clone());
        lifecycle.register(payments.clone());

        // Construction-time lifecycle hooks run before anything can flush
        events.start().await?;

        info!(bundle_id = %config.bundle_id, "Grovs SDK configured");

        Ok(Arc::new(Self {
            config,
            session,
            transport,
            gate: Arc::new(AuthGate::new()),
            events,
            payments,
            lifecycle,
            state,
            attribution_generation: AtomicU64::new(0),
        }))
    }

    /// Authenticate the device and resolve the pending-action queue
    pub async fn authenticate(self: &Arc<Self>) -> Result<()> {
        self.gate.begin_authenticating();

        let device_id = self.state.ensure_device_id().await?;
        let snapshot = self.session.snapshot();
        let payload = json!({
            "device_id": device_id,
            "bundle": self.config.bundle_id,
            "platform": PLATFORM,
            "sdk_version": env!("CARGO_PKG_VERSION"),
            "uri_scheme": snapshot.uri_scheme,
            "identifier": snapshot.identifier,
            "attributes": snapshot.attributes,
        });

        match self.transport.post(Endpoint::Authenticate, payload).await {
            Ok(response) => {
                let Some(id) = response.get("linksquared").and_then(Value::as_str) else {
                    self.gate.resolve_failure();
                    return Err(Error::AuthFailed(
                        "authenticate response missing session id".to_string(),
                    ));
                };

                self.session.set_linksquared_id(id);
                info!("Device authenticated");
                self.gate.resolve_success();

                // Purchase rescan and any queued events can go out now
                if let Err(e) = self.payments.start().await {
                    warn!(error = %e, "Payment manager start failed");
                }
                if let Err(e) = self.events.flush_all().await {
                    warn!(error = %e, "Post-auth event flush failed");
                }
                Ok(())
            }
            Err(e) => {
                self.gate.resolve_failure();
                Err(Error::AuthFailed(e.to_string()))
            }
        }
    }

    /// Current authentication state
    pub fn auth_state(&self) -> AuthState {
        self.gate.auth_state()
    }

    // Lifecycle forwarding

    /// Host app moved to the foreground
    pub async fn on_foreground(&self) {
        self.lifecycle.notify_foreground().await;
    }

    /// Host app moved to the background
    pub async fn on_background(&self) {
        self.lifecycle.notify_background().await;
    }

    /// Record that a platform delegate callback fired (flush gating input)
    pub fn delegate_callback_received(&self) {
        self.events.mark_delegate_seen();
    }

    // Attribution

    /// Fetch attribution data for the device, optionally for a tapped URL
    ///
    /// A newer fetch supersedes an in-flight one of the same kind; the stale
    /// result is dropped. Completion (with or without a link) unlocks event
    /// flushing.
    pub async fn fetch_attribution(self: &Arc<Self>, url: Option<&str>) -> Result<Option<String>> {
        let generation = self.attribution_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (endpoint, payload) = match url {
            Some(url) => (Endpoint::DataForDeviceAndUrl, json!({ "url": url })),
            None => (Endpoint::DataForDevice, json!({})),
        };

        let response = self.transport.post(endpoint, payload).await?;

        if self.attribution_generation.load(Ordering::SeqCst) != generation {
            // A newer fetch was issued while this one was in flight
            warn!("Dropping stale attribution result");
            return Ok(None);
        }

        let link = response
            .get("link")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.events.mark_attribution_resolved(link.clone());

        if let Err(e) = self.events.flush_all().await {
            warn!(error = %e, "Post-attribution flush failed");
        }

        Ok(link)
    }

    // Identity

    /// Set the developer-provided user identifier
    pub async fn set_identifier(self: &Arc<Self>, identifier: impl Into<String>) -> Result<()> {
        self.session.set_identifier(identifier);
        self.push_visitor_attributes().await
    }

    /// Set the developer-provided visitor attributes
    pub async fn set_attributes(self: &Arc<Self>, attributes: Value) -> Result<()> {
        self.session.set_attributes(attributes);
        self.push_visitor_attributes().await
    }

    /// Push identifier/attributes once a session exists; pre-auth values
    /// ride along in the authenticate payload instead
    async fn push_visitor_attributes(self: &Arc<Self>) -> Result<()> {
        if !self.session.is_established() {
            return Ok(());
        }
        let snapshot = self.session.snapshot();
        self.transport
            .post(
                Endpoint::VisitorAttributes,
                json!({
                    "identifier": snapshot.identifier,
                    "attributes": snapshot.attributes,
                }),
            )
            .await?;
        Ok(())
    }

    // Gated public operations

    /// Generate a deep link
    ///
    /// Returns `None` (after logging) when no URI scheme is configured.
    pub async fn generate_link(
        self: &Arc<Self>,
        title: Option<String>,
        subtitle: Option<String>,
        image_url: Option<String>,
        data: Option<Value>,
        tags: Option<Vec<String>>,
    ) -> Result<Option<String>> {
        if self.session.snapshot().uri_scheme.is_none() {
            error!("generate_link called without a configured URI scheme");
            return Ok(None);
        }

        self.gated(ActionKind::GenerateLink, move |sdk| async move {
            let response = sdk
                .transport
                .post(
                    Endpoint::CreateLink,
                    json!({
                        "title": title,
                        "subtitle": subtitle,
                        "image_url": image_url,
                        "data": data,
                        "tags": tags,
                    }),
                )
                .await?;
            Ok(response
                .get("link")
                .and_then(Value::as_str)
                .map(str::to_string))
        })
        .await
    }

    /// List notifications for this device
    pub async fn notifications(self: &Arc<Self>, page: u32) -> Result<Vec<Value>> {
        self.gated(ActionKind::Notifications, move |sdk| async move {
            let response = sdk
                .transport
                .post(Endpoint::NotificationsForDevice, json!({ "page": page }))
                .await?;
            Ok(extract_array(&response, "notifications"))
        })
        .await
    }

    /// Number of unread notifications
    pub async fn unread_notifications_count(self: &Arc<Self>) -> Result<u64> {
        self.gated(ActionKind::UnreadCount, move |sdk| async move {
            let response = sdk
                .transport
                .post(Endpoint::NumberOfUnreadNotifications, json!({}))
                .await?;
            Ok(response
                .get("number_of_unread_notifications")
                .and_then(Value::as_u64)
                .unwrap_or(0))
        })
        .await
    }

    /// Mark one notification as read
    pub async fn mark_notification_read(self: &Arc<Self>, notification_id: u64) -> Result<bool> {
        self.gated(ActionKind::MarkNotificationRead, move |sdk| async move {
            sdk.transport
                .post(
                    Endpoint::MarkNotificationAsRead,
                    json!({ "notification_id": notification_id }),
                )
                .await?;
            Ok(true)
        })
        .await
    }

    /// Messages the app should display automatically
    pub async fn messages_to_display(self: &Arc<Self>) -> Result<Vec<Value>> {
        self.gated(ActionKind::DisplayMessages, move |sdk| async move {
            let response = sdk
                .transport
                .post(Endpoint::NotificationsToDisplayAutomatically, json!({}))
                .await?;
            Ok(extract_array(&response, "notifications"))
        })
        .await
    }

    /// Resolve details for a link path
    pub async fn link_details(self: &Arc<Self>, path: String) -> Result<Option<Value>> {
        self.gated(ActionKind::LinkDetails, move |sdk| async move {
            let response = sdk
                .transport
                .post(Endpoint::LinkDetails, json!({ "path": path }))
                .await?;
            Ok(Some(response))
        })
        .await
    }

    // Purchases

    /// Report a platform-store purchase (idempotent per transaction id)
    pub async fn log_in_app_purchase(&self, record: TransactionRecord) -> Result<()> {
        self.payments.log_in_app_purchase(record).await
    }

    /// Report a developer-defined purchase (fire and forget)
    pub async fn log_custom_purchase(&self, record: TransactionRecord) -> Result<()> {
        self.payments.log_custom_purchase(record).await
    }

    /// Run `op` now when authenticated, otherwise buffer it and settle the
    /// caller when authentication resolves
    async fn gated<T, F, Fut>(self: &Arc<Self>, kind: ActionKind, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Grovs>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        // Only one thunk ever runs; both need to own the sender
        let slot = Arc::new(Mutex::new(Some(tx)));
        let failure_slot = slot.clone();
        let sdk = self.clone();

        self.gate.run_or_enqueue(
            kind,
            move || {
                if let Some(tx) = slot.lock().take() {
                    let fut = op(sdk);
                    tokio::spawn(async move {
                        let _ = tx.send(fut.await);
                    });
                }
            },
            move || {
                if let Some(tx) = failure_slot.lock().take() {
                    let _ = tx.send(Err(Error::AuthFailed(
                        "SDK authentication failed".to_string(),
                    )));
                }
            },
        );

        rx.await
            .map_err(|_| Error::Concurrency("gated operation dropped".to_string()))?
    }
}

/// Pull a named array out of a response object, falling back to the array
/// sentinel key
fn extract_array(response: &Value, field: &str) -> Vec<Value> {
    response
        .get(field)
        .or_else(|| response.get(crate::network::ARRAY_SENTINEL_KEY))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}
