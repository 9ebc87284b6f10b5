//! Event log manager
//!
//! Owns lifecycle-event generation, deduplication and flush scheduling for
//! the durable event queue. Events are only ever removed on a confirmed
//! backend ack; everything else leaves them queued for the next flush.

use crate::config::EventConfig;
use crate::dedup::dedup_lifecycle_events;
use crate::error::Result;
use crate::lifecycle::LifecycleObserver;
use crate::network::{ApiTransport, Endpoint};
use crate::storage::{DurableStore, StateStore, StoredRecord};
use crate::types::{Event, EventType};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Manager for the durable attribution event queue
pub struct EventLogManager {
    store: Arc<DurableStore<Event>>,
    state: Arc<StateStore>,
    transport: Arc<dyn ApiTransport>,
    config: EventConfig,
    constructed_at: Instant,

    // Flush gating
    delegate_seen: AtomicBool,
    attribution_resolved: AtomicBool,
    attribution_link: parking_lot::Mutex<Option<String>>,

    // One in-flight batch per category
    sending_events: AtomicBool,
    sending_time_spent: AtomicBool,
}

impl EventLogManager {
    /// Create the manager; call [`EventLogManager::start`] right after to run
    /// the construction-time lifecycle hooks
    pub fn new(
        store: Arc<DurableStore<Event>>,
        state: Arc<StateStore>,
        transport: Arc<dyn ApiTransport>,
        config: EventConfig,
    ) -> Self {
        Self {
            store,
            state,
            transport,
            config,
            constructed_at: Instant::now(),
            delegate_seen: AtomicBool::new(false),
            attribution_resolved: AtomicBool::new(false),
            attribution_link: parking_lot::Mutex::new(None),
            sending_events: AtomicBool::new(false),
            sending_time_spent: AtomicBool::new(false),
        }
    }

    /// Construction-time lifecycle hooks, in order: install-or-reinstall,
    /// reactivation, app open, open-count increment
    pub async fn start(&self) -> Result<()> {
        self.add_install_if_needed().await?;
        self.add_reactivation_if_needed().await?;
        self.add_open_event().await?;
        self.state.increment_open_count().await?;
        Ok(())
    }

    /// Log `install` (or `reinstall` when a device identifier already
    /// exists) on the very first open
    async fn add_install_if_needed(&self) -> Result<()> {
        if self.state.open_count().await? != 0 {
            return Ok(());
        }

        let event_type = if self.state.device_id().await?.is_some() {
            EventType::Reinstall
        } else {
            EventType::Install
        };

        info!(?event_type, "Logging first-open lifecycle event");
        self.add_event(Event::new(event_type)).await
    }

    /// Log `reactivation` when the app was last resigned long enough ago;
    /// always refresh the last-start timestamp
    async fn add_reactivation_if_needed(&self) -> Result<()> {
        let now = Utc::now();

        if let Some(resigned_at) = self.state.last_resign().await? {
            let idle = now.signed_duration_since(resigned_at);
            if idle.num_days() >= self.config.reactivation_threshold_days {
                info!(idle_days = idle.num_days(), "Logging reactivation");
                self.add_event(Event::new(EventType::Reactivation)).await?;
            }
        }

        self.state.set_last_start(now).await
    }

    /// Log `appOpen` unconditionally
    async fn add_open_event(&self) -> Result<()> {
        self.add_event(Event::new(EventType::AppOpen)).await
    }

    /// Persist one event, running lifecycle dedup over the union of the
    /// stored set and the incoming event
    pub async fn add_event(&self, event: Event) -> Result<()> {
        self.add_events(vec![event]).await
    }

    /// Persist a batch, running lifecycle dedup over the union of the
    /// stored set and the batch
    pub async fn add_events(&self, events: Vec<Event>) -> Result<()> {
        self.store
            .transform(move |mut existing| {
                for event in events {
                    // Same identity key the store itself uses
                    let key = event.store_key();
                    match existing.iter_mut().find(|e| e.store_key() == key) {
                        Some(slot) => *slot = event,
                        None => existing.push(event),
                    }
                }
                dedup_lifecycle_events(existing)
            })
            .await?;
        Ok(())
    }

    /// Record that a platform delegate callback has fired at least once
    pub fn mark_delegate_seen(&self) {
        self.delegate_seen.store(true, Ordering::SeqCst);
    }

    /// Record that attribution resolution finished (with or without a link)
    pub fn mark_attribution_resolved(&self, link: Option<String>) {
        *self.attribution_link.lock() = link;
        self.attribution_resolved.store(true, Ordering::SeqCst);
    }

    /// A flush is permitted only after a delegate callback, after
    /// attribution resolution, and once the startup grace window has passed
    fn can_flush(&self) -> bool {
        self.delegate_seen.load(Ordering::SeqCst)
            && self.attribution_resolved.load(Ordering::SeqCst)
            && self.constructed_at.elapsed() >= self.config.startup_grace()
    }

    /// Flush both categories; `timeSpent` goes through its dedicated path
    pub async fn flush_all(&self) -> Result<()> {
        self.flush_time_spent().await?;
        self.flush_events().await
    }

    /// Flush every queued non-`timeSpent` event
    pub async fn flush_events(&self) -> Result<()> {
        if !self.can_flush() {
            debug!("Flush gated, skipping");
            return Ok(());
        }
        if self.sending_events.swap(true, Ordering::SeqCst) {
            // Already sending; re-entrant flushes complete as no-ops
            return Ok(());
        }

        let snapshot: Vec<Event> = match self.store.get_all().await {
            Ok(all) => all
                .into_iter()
                .filter(|e| e.event_type != EventType::TimeSpent)
                .collect(),
            Err(e) => {
                self.sending_events.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.send_batch(snapshot).await;
        self.sending_events.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Flush queued `timeSpent` events whose engagement was already computed
    ///
    /// Unstamped events wait for the next foreground backfill so the
    /// duration is always computed before transmission.
    pub async fn flush_time_spent(&self) -> Result<()> {
        if !self.can_flush() {
            debug!("TimeSpent flush gated, skipping");
            return Ok(());
        }
        if self.sending_time_spent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot: Vec<Event> = match self.store.get_all().await {
            Ok(all) => all
                .into_iter()
                .filter(|e| {
                    e.event_type == EventType::TimeSpent && e.engagement_time.is_some()
                })
                .collect(),
            Err(e) => {
                self.sending_time_spent.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.send_batch(snapshot).await;
        self.sending_time_spent.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Dispatch sends concurrently and wait for the whole batch to settle;
    /// each confirmed ack removes exactly that event
    async fn send_batch(&self, snapshot: Vec<Event>) {
        if snapshot.is_empty() {
            return;
        }

        debug!(count = snapshot.len(), "Flushing event batch");
        let sends = snapshot.into_iter().map(|event| self.send_one(event));
        join_all(sends).await;
    }

    async fn send_one(&self, event: Event) {
        let mut payload_event = event.clone();
        if payload_event.link.is_none() {
            payload_event.link = self.attribution_link.lock().clone();
        }

        let payload = match serde_json::to_value(&payload_event) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to encode event, leaving queued");
                return;
            }
        };

        match self.transport.post(Endpoint::Event, payload).await {
            Ok(_) => {
                if let Err(e) = self.store.remove(&event).await {
                    warn!(error = %e, "Acked event could not be removed");
                }
            }
            Err(e) => {
                warn!(event_type = ?event.event_type, error = %e, "Event send failed, retrying next flush");
            }
        }
    }

    /// Foreground hook: backfill engagement for old `timeSpent` events, or
    /// start a fresh one when there is no resign marker yet
    pub async fn handle_foreground(&self) -> Result<()> {
        let now = Utc::now();

        if let Some(resigned_at) = self.state.last_resign().await? {
            self.store
                .transform(move |mut events| {
                    for event in events.iter_mut() {
                        if event.event_type != EventType::TimeSpent {
                            continue;
                        }
                        // Single-write: a stamped engagement is never recomputed
                        if event.engagement_time.is_some() {
                            continue;
                        }
                        if event.created_at >= now {
                            continue;
                        }
                        let engaged = resigned_at
                            .signed_duration_since(event.created_at)
                            .num_seconds();
                        if engaged > 0 {
                            event.engagement_time = Some(engaged as u64);
                        }
                    }
                    events
                })
                .await?;
        } else {
            self.add_event(Event::new(EventType::TimeSpent)).await?;
        }

        // Backfill completes before the dedicated timeSpent flush runs
        self.flush_all().await
    }

    /// Background hook: record the resign timestamp, no event logging
    pub async fn handle_background(&self) -> Result<()> {
        self.state.set_last_resign(Utc::now()).await
    }
}

#[async_trait]
impl LifecycleObserver for EventLogManager {
    async fn on_foreground(&self) {
        if let Err(e) = self.handle_foreground().await {
            warn!(error = %e, "Foreground handling failed");
        }
    }

    async fn on_background(&self) {
        if let Err(e) = self.handle_background().await {
            warn!(error = %e, "Background handling failed");
        }
    }
}
