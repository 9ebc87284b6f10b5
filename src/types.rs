//! Core data types for the event and payment pipelines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Wire date format: `yyyy-MM-dd'T'HH:mm:ss.SSSZ` (POSIX locale)
pub const WIRE_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

/// Serde adapter for the wire date format
pub mod wire_date {
    use super::WIRE_DATE_FORMAT;
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a timestamp in the wire format
    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date.format(WIRE_DATE_FORMAT).to_string())
    }

    /// Deserialize a timestamp from the wire format
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_str(&s, WIRE_DATE_FORMAT)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

// Last identity stamp handed out, in wire-precision milliseconds
static LAST_EVENT_STAMP: AtomicI64 = AtomicI64::new(0);

/// A creation timestamp unique within the process at wire precision
///
/// Identity is `created_at` at millisecond resolution; two events minted in
/// the same millisecond would collide and overwrite each other. When the
/// clock has not advanced past the previous stamp the new one is bumped one
/// millisecond past it, so a burst of events may run slightly ahead of the
/// wall clock but never share an identity.
fn unique_event_stamp() -> DateTime<Utc> {
    let mut last = LAST_EVENT_STAMP.load(Ordering::Relaxed);
    loop {
        let candidate = Utc::now().timestamp_millis().max(last + 1);
        match LAST_EVENT_STAMP.compare_exchange_weak(
            last,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return DateTime::from_timestamp_millis(candidate).unwrap_or_else(Utc::now),
            Err(observed) => last = observed,
        }
    }
}

/// Clamp a timestamp to wire precision so the in-memory identity always
/// matches what survives a serialization round trip
fn truncate_to_wire_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// Attribution event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// First open on a device with no prior identifier
    Install,
    /// First open on a device that already has an identifier
    Reinstall,
    /// App open after a configurable period of inactivity
    Reactivation,
    /// Every app open
    AppOpen,
    /// Session duration marker, engagement backfilled on next foreground
    TimeSpent,
}

impl EventType {
    /// Whether this type participates in install-class deduplication
    pub fn is_lifecycle_class(&self) -> bool {
        matches!(self, EventType::Install | EventType::Reinstall)
    }
}

/// Attribution event. Identity (and dedup key) is `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event type
    #[serde(rename = "event")]
    pub event_type: EventType,

    /// Creation timestamp at wire (millisecond) precision; unique per
    /// event, collisions overwrite
    #[serde(with = "wire_date")]
    pub created_at: DateTime<Utc>,

    /// Attribution link the event is correlated with, when resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,

    /// Engagement duration in seconds, backfilled for `TimeSpent` events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engagement_time: Option<u64>,
}

impl Event {
    /// Create an event stamped now, with a process-unique identity
    pub fn new(event_type: EventType) -> Self {
        Self::at(event_type, unique_event_stamp())
    }

    /// Create an event with an explicit timestamp
    ///
    /// The timestamp is clamped to wire precision up front; equal clamped
    /// timestamps are the same identity.
    pub fn at(event_type: EventType, created_at: DateTime<Utc>) -> Self {
        Self {
            event_type,
            created_at: truncate_to_wire_precision(created_at),
            link: None,
            engagement_time: None,
        }
    }
}

/// Purchase event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Purchase or renewal
    Buy,
    /// Cancellation / refund
    Cancel,
}

/// Purchase record reported to the backend
///
/// `transaction_id` is the idempotency key for platform-store purchases.
/// Custom (developer-reported) purchases carry no id and are never
/// deduplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Local queue identity, not interpreted by the backend
    pub record_id: Uuid,

    /// Buy or cancel
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,

    /// Price in cents, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_cents: Option<i64>,

    /// Platform transaction identifier (idempotency key)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<u64>,

    /// Prior transaction identifier for renewals/upgrades
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_transaction_id: Option<u64>,

    /// ISO currency code
    pub currency: String,

    /// Product identifier
    pub product_id: String,

    /// Bundle identifier of the reporting app
    pub bundle_id: String,

    /// Purchase start date
    #[serde(with = "wire_date")]
    pub start_date: DateTime<Utc>,

    /// True for platform-store purchases, false for custom purchases
    pub store_purchase: bool,
}

impl TransactionRecord {
    /// Build a platform-store purchase record
    pub fn store_purchase(
        transaction_type: TransactionType,
        transaction_id: u64,
        product_id: impl Into<String>,
        bundle_id: impl Into<String>,
        currency: impl Into<String>,
        price_cents: Option<i64>,
        start_date: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            transaction_type,
            price_cents,
            transaction_id: Some(transaction_id),
            old_transaction_id: None,
            currency: currency.into(),
            product_id: product_id.into(),
            bundle_id: bundle_id.into(),
            start_date,
            store_purchase: true,
        }
    }

    /// Build a developer-reported custom purchase (no idempotency key)
    pub fn custom_purchase(
        price_cents: i64,
        currency: impl Into<String>,
        product_id: impl Into<String>,
        bundle_id: impl Into<String>,
        start_date: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            transaction_type: TransactionType::Buy,
            price_cents: Some(price_cents),
            transaction_id: None,
            old_transaction_id: None,
            currency: currency.into(),
            product_id: product_id.into(),
            bundle_id: bundle_id.into(),
            start_date,
            store_purchase: false,
        }
    }
}
