//! Integration tests for the full SDK pipeline
//!
//! Tests the system end-to-end through the public facade:
//! - Startup → authentication → attribution → event flush
//! - Durable queue survival across simulated app launches
//! - At-most-once transaction reporting across launches

use async_trait::async_trait;
use chrono::Utc;
use grovs_sdk::{
    ApiTransport, Config, Endpoint, Error, Grovs, PurchaseHistoryProvider, Result,
    TransactionRecord, TransactionType,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Transport that records every call and optionally rejects event posts
struct RecordingTransport {
    calls: Mutex<Vec<(&'static str, Value)>>,
    fail_events: AtomicBool,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_events: AtomicBool::new(false),
        })
    }

    fn rejecting_events() -> Arc<Self> {
        let transport = Self::new();
        transport.fail_events.store(true, Ordering::SeqCst);
        transport
    }

    /// Bodies posted to `/event` that are attribution events
    fn event_bodies(&self) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(path, body)| *path == Endpoint::Event.path() && body.get("event").is_some())
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Bodies posted to `/event` that are purchase records
    fn transaction_bodies(&self) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(path, body)| *path == Endpoint::Event.path() && body.get("type").is_some())
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl ApiTransport for RecordingTransport {
    async fn post(&self, endpoint: Endpoint, body: Value) -> Result<Value> {
        self.calls.lock().push((endpoint.path(), body));
        match endpoint {
            Endpoint::Authenticate => Ok(json!({"linksquared": "lsq-test"})),
            Endpoint::DataForDevice => Ok(json!({"link": "https://grovs.io/attributed"})),
            Endpoint::Event if self.fail_events.load(Ordering::SeqCst) => Err(Error::Server(500)),
            _ => Ok(json!({})),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn launch_config(data_dir: &Path) -> Config {
    let mut config = Config::new("key123", "com.example.app");
    config.uri_scheme = Some("exampleapp".to_string());
    config.data_dir = data_dir.to_path_buf();
    config.events.startup_grace_secs = 0;
    config
}

/// Simulate one app launch: configure, authenticate, delegate callback,
/// attribution fetch
async fn launch(
    data_dir: &Path,
    transport: Arc<RecordingTransport>,
    history: Option<Arc<dyn PurchaseHistoryProvider>>,
) -> Arc<Grovs> {
    init_tracing();
    let sdk = Grovs::configure_with_transport(launch_config(data_dir), transport, history)
        .await
        .unwrap();
    sdk.authenticate().await.unwrap();
    sdk.delegate_callback_received();
    sdk.fetch_attribution(None).await.unwrap();
    sdk
}

#[tokio::test]
async fn test_first_launch_reports_install_with_attribution_link() {
    let temp = TempDir::new().unwrap();
    let transport = RecordingTransport::new();

    launch(temp.path(), transport.clone(), None).await;

    let events = transport.event_bodies();
    let install: Vec<_> = events
        .iter()
        .filter(|b| b["event"] == json!("install"))
        .collect();
    assert_eq!(install.len(), 1);
    // The resolved attribution link is stamped onto unlinked events
    assert_eq!(install[0]["link"], json!("https://grovs.io/attributed"));

    assert!(events.iter().any(|b| b["event"] == json!("app_open")));
}

#[tokio::test]
async fn test_second_launch_reports_open_but_no_install() {
    let temp = TempDir::new().unwrap();

    let first = RecordingTransport::new();
    launch(temp.path(), first, None).await;

    let second = RecordingTransport::new();
    launch(temp.path(), second.clone(), None).await;

    let events = second.event_bodies();
    assert!(events.iter().all(|b| b["event"] != json!("install")));
    assert!(events.iter().any(|b| b["event"] == json!("app_open")));
}

#[tokio::test]
async fn test_queued_events_survive_restart_and_flush_once() {
    let temp = TempDir::new().unwrap();

    // First launch: the backend rejects every event post
    let broken = RecordingTransport::rejecting_events();
    launch(temp.path(), broken.clone(), None).await;
    assert!(!broken.event_bodies().is_empty());

    // Second launch against a healthy backend drains the surviving queue
    let healthy = RecordingTransport::new();
    launch(temp.path(), healthy.clone(), None).await;

    let events = healthy.event_bodies();
    let installs = events
        .iter()
        .filter(|b| b["event"] == json!("install"))
        .count();
    assert_eq!(installs, 1);

    // Nothing left queued: a third launch sends only its own app open
    let third = RecordingTransport::new();
    launch(temp.path(), third.clone(), None).await;
    let events = third.event_bodies();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], json!("app_open"));
}

struct FixedHistory {
    transactions: Vec<TransactionRecord>,
}

#[async_trait]
impl PurchaseHistoryProvider for FixedHistory {
    async fn all_transactions(&self) -> Result<Vec<TransactionRecord>> {
        Ok(self.transactions.clone())
    }
}

#[tokio::test]
async fn test_transaction_reported_once_across_launches() {
    let temp = TempDir::new().unwrap();
    let history: Arc<dyn PurchaseHistoryProvider> = Arc::new(FixedHistory {
        transactions: vec![TransactionRecord::store_purchase(
            TransactionType::Buy,
            11,
            "premium.monthly",
            "com.example.app",
            "USD",
            Some(499),
            Utc::now(),
        )],
    });

    let first = RecordingTransport::new();
    launch(temp.path(), first.clone(), Some(history.clone())).await;
    assert_eq!(first.transaction_bodies().len(), 1);

    // Second launch rescans the same history; the handled set blocks a
    // duplicate report
    let second = RecordingTransport::new();
    launch(temp.path(), second.clone(), Some(history)).await;
    assert!(second.transaction_bodies().is_empty());
}

#[tokio::test]
async fn test_direct_purchase_and_rescan_never_double_report() {
    let temp = TempDir::new().unwrap();
    let record = TransactionRecord::store_purchase(
        TransactionType::Buy,
        77,
        "coins.large",
        "com.example.app",
        "USD",
        Some(999),
        Utc::now(),
    );
    let history: Arc<dyn PurchaseHistoryProvider> = Arc::new(FixedHistory {
        transactions: vec![record.clone()],
    });

    let transport = RecordingTransport::new();
    let sdk = launch(temp.path(), transport.clone(), Some(history)).await;

    // The rescan already reported id 77; the direct call must be dropped
    sdk.log_in_app_purchase(record).await.unwrap();
    assert_eq!(transport.transaction_bodies().len(), 1);
}
