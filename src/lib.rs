//! Grovs SDK
//!
//! Deep-link attribution client with a durable event delivery pipeline.
//!
//! # Architecture
//!
//! - **Durable queues**: attribution events and purchase records persist
//!   locally and are only removed on a confirmed backend ack
//! - **Lifecycle dedup**: install-class events collapse to a single survivor
//!   however long the device stays offline
//! - **Gated operations**: calls made before authentication resolves buffer
//!   and replay in order
//! - **Categorized retry**: connectivity loss requeues, offline retries with
//!   linear backoff, everything else surfaces to the caller
//!
//! # Invariants
//!
//! - At most one uncommitted `install` or `reinstall` event exists at any
//!   time, never both
//! - A transaction id is reported to the backend at most once across app
//!   launches and history rescans
//! - Nothing leaves a durable store except on confirmed success

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod actions;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod network;
pub mod payments;
pub mod sdk;
pub mod session;
pub mod storage;
pub mod types;

// Re-exports
pub use actions::{ActionKind, AuthGate, AuthState};
pub use config::{Config, EventConfig, NetworkConfig};
pub use error::{Error, Result};
pub use events::EventLogManager;
pub use lifecycle::{LifecycleNotifier, LifecycleObserver};
pub use network::{ApiClient, ApiTransport, BackoffState, Endpoint, FailureKind};
pub use payments::{PaymentEventManager, PurchaseHistoryProvider};
pub use sdk::Grovs;
pub use session::{AuthSession, SessionHandle};
pub use storage::{DurableStore, HandledTransaction, StateStore, StoredRecord};
pub use types::{Event, EventType, TransactionRecord, TransactionType};
