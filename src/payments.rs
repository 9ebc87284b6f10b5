//! Payment event manager
//!
//! Mirrors the event pipeline with its own durable queue plus a persisted
//! handled-transaction set. A platform transaction id is reported at most
//! once across app launches and history rescans; custom purchases carry no
//! id and are fire-and-forget.

use crate::error::Result;
use crate::lifecycle::LifecycleObserver;
use crate::network::{ApiTransport, Endpoint};
use crate::storage::{DurableStore, HandledTransaction};
use crate::types::TransactionRecord;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Platform purchase history (StoreKit 2 equivalent); enumeration of all
/// verified transactions since install
#[async_trait]
pub trait PurchaseHistoryProvider: Send + Sync {
    /// All verified transactions, oldest first
    async fn all_transactions(&self) -> Result<Vec<TransactionRecord>>;
}

/// Manager for the durable purchase queue and handled-transaction tracker
pub struct PaymentEventManager {
    store: Arc<DurableStore<TransactionRecord>>,
    handled: Arc<DurableStore<HandledTransaction>>,
    transport: Arc<dyn ApiTransport>,
    provider: Option<Arc<dyn PurchaseHistoryProvider>>,
    sending: AtomicBool,
}

impl PaymentEventManager {
    /// Create the manager; call [`PaymentEventManager::start`] right after
    pub fn new(
        store: Arc<DurableStore<TransactionRecord>>,
        handled: Arc<DurableStore<HandledTransaction>>,
        transport: Arc<dyn ApiTransport>,
        provider: Option<Arc<dyn PurchaseHistoryProvider>>,
    ) -> Self {
        Self {
            store,
            handled,
            transport,
            provider,
            sending: AtomicBool::new(false),
        }
    }

    /// Startup hook: rescan purchase history and flush the queue
    pub async fn start(&self) -> Result<()> {
        self.rescan_purchase_history().await
    }

    /// Enumerate purchase history and queue every transaction whose id has
    /// not been reported yet, then flush
    ///
    /// Re-run on every foreground transition to catch purchases made outside
    /// the app (e.g. store-level restores).
    pub async fn rescan_purchase_history(&self) -> Result<()> {
        let provider = match &self.provider {
            Some(p) => p.clone(),
            None => {
                debug!("No purchase history provider configured, skipping rescan");
                return self.flush_queue().await;
            }
        };

        let transactions = provider.all_transactions().await?;
        let queued = self.store.get_all().await?;

        let mut fresh = Vec::new();
        for record in transactions {
            let Some(tid) = record.transaction_id else {
                continue; // history never yields id-less records
            };
            if self.is_handled(tid).await? {
                continue;
            }
            if queued
                .iter()
                .any(|r| r.transaction_id == Some(tid))
            {
                continue;
            }
            fresh.push(record);
        }

        if !fresh.is_empty() {
            info!(count = fresh.len(), "Queueing unreported transactions from history rescan");
            self.store.add_or_replace(fresh).await?;
        }

        self.flush_queue().await
    }

    /// Report a platform-store purchase; idempotent per transaction id
    pub async fn log_in_app_purchase(&self, record: TransactionRecord) -> Result<()> {
        if let Some(tid) = record.transaction_id {
            if self.is_handled(tid).await? {
                debug!(transaction_id = tid, "Transaction already reported, skipping");
                return Ok(());
            }
        }
        self.store.add(record).await?;
        self.flush_queue().await
    }

    /// Report a developer-defined purchase; no idempotency key, never
    /// retried through the handled set
    pub async fn log_custom_purchase(&self, record: TransactionRecord) -> Result<()> {
        self.store.add(record).await?;
        self.flush_queue().await
    }

    /// Send every queued record; confirmed success removes it and marks its
    /// transaction id handled
    pub async fn flush_queue(&self) -> Result<()> {
        if self.sending.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot = match self.store.get_all().await {
            Ok(all) => all,
            Err(e) => {
                self.sending.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        if !snapshot.is_empty() {
            debug!(count = snapshot.len(), "Flushing payment queue");
            let sends = snapshot
                .into_iter()
                .map(|record| self.send_transaction_to_backend(record));
            join_all(sends).await;
        }

        self.sending.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Single path every purchase report routes through
    async fn send_transaction_to_backend(&self, record: TransactionRecord) {
        let payload = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to encode transaction, leaving queued");
                return;
            }
        };

        match self.transport.post(Endpoint::Event, payload).await {
            Ok(_) => {
                if let Some(tid) = record.transaction_id {
                    if let Err(e) = self.mark_transaction_as_handled(tid).await {
                        warn!(transaction_id = tid, error = %e, "Failed to persist handled mark");
                    }
                }
                if let Err(e) = self.store.remove(&record).await {
                    warn!(error = %e, "Acked transaction could not be removed");
                }
            }
            Err(e) => {
                warn!(
                    transaction_id = ?record.transaction_id,
                    error = %e,
                    "Transaction send failed, retrying next flush"
                );
            }
        }
    }

    /// Persist a transaction id as reported; duplicate marks collapse
    pub async fn mark_transaction_as_handled(&self, transaction_id: u64) -> Result<()> {
        self.handled
            .add(HandledTransaction { transaction_id })
            .await
    }

    /// Whether a transaction id was already reported
    pub async fn is_handled(&self, transaction_id: u64) -> Result<bool> {
        Ok(self
            .handled
            .get_all()
            .await?
            .iter()
            .any(|h| h.transaction_id == transaction_id))
    }
}

#[async_trait]
impl LifecycleObserver for PaymentEventManager {
    async fn on_foreground(&self) {
        if let Err(e) = self.rescan_purchase_history().await {
            warn!(error = %e, "Purchase history rescan failed");
        }
    }

    async fn on_background(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::{COLLECTION_HANDLED, COLLECTION_PAYMENTS};
    use crate::types::TransactionType;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct MockTransport {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl MockTransport {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl ApiTransport for MockTransport {
        async fn post(&self, _endpoint: Endpoint, _body: Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::Server(500))
            } else {
                Ok(json!({}))
            }
        }
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

    fn store_record(tid: u64) -> TransactionRecord {
        TransactionRecord::store_purchase(
            TransactionType::Buy,
            tid,
            "premium.monthly",
            "com.example.app",
            "USD",
            Some(499),
            Utc::now(),
        )
    }

    struct Fixture {
        manager: PaymentEventManager,
        store: Arc<DurableStore<TransactionRecord>>,
        handled: Arc<DurableStore<HandledTransaction>>,
        _temp: TempDir,
    }

    fn fixture(
        transport: Arc<dyn ApiTransport>,
        provider: Option<Arc<dyn PurchaseHistoryProvider>>,
    ) -> Fixture {
        let temp = TempDir::new().unwrap();
        let store: Arc<DurableStore<TransactionRecord>> =
            Arc::new(DurableStore::open(temp.path(), COLLECTION_PAYMENTS).unwrap());
        let handled: Arc<DurableStore<HandledTransaction>> =
            Arc::new(DurableStore::open(temp.path(), COLLECTION_HANDLED).unwrap());
        let manager =
            PaymentEventManager::new(store.clone(), handled.clone(), transport, provider);
        Fixture {
            manager,
            store,
            handled,
            _temp: temp,
        }
    }

    #[tokio::test]
    async fn test_mark_handled_twice_keeps_one_copy() {
        let f = fixture(MockTransport::ok(), None);

        f.manager.mark_transaction_as_handled(42).await.unwrap();
        f.manager.mark_transaction_as_handled(42).await.unwrap();

        assert_eq!(f.handled.get_all().await.unwrap().len(), 1);
        assert!(f.manager.is_handled(42).await.unwrap());
    }

    #[tokio::test]
    async fn test_rescan_reports_unhandled_transactions_once() {
        let transport = MockTransport::ok();
        let history = Arc::new(FixedHistory {
            transactions: vec![store_record(1), store_record(2)],
        });
        let f = fixture(transport.clone(), Some(history));

        f.manager.start().await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert!(f.store.get_all().await.unwrap().is_empty());
        assert!(f.manager.is_handled(1).await.unwrap());
        assert!(f.manager.is_handled(2).await.unwrap());

        // A second rescan (foreground) sends nothing new
        f.manager.rescan_purchase_history().await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rescan_skips_already_queued_ids() {
        let transport = MockTransport::failing();
        let history = Arc::new(FixedHistory {
            transactions: vec![store_record(7)],
        });
        let f = fixture(transport.clone(), Some(history));

        // First rescan queues and fails to send
        f.manager.start().await.unwrap();
        assert_eq!(f.store.get_all().await.unwrap().len(), 1);

        // Second rescan must not queue a duplicate of the same id
        f.manager.rescan_purchase_history().await.unwrap();
        assert_eq!(f.store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_in_app_purchase_idempotent_per_id() {
        let transport = MockTransport::ok();
        let f = fixture(transport.clone(), None);

        f.manager.log_in_app_purchase(store_record(9)).await.unwrap();
        f.manager.log_in_app_purchase(store_record(9)).await.unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_purchase_fire_and_forget() {
        let transport = MockTransport::ok();
        let f = fixture(transport.clone(), None);

        let record = TransactionRecord::custom_purchase(
            999,
            "EUR",
            "coins.large",
            "com.example.app",
            Utc::now(),
        );
        f.manager.log_custom_purchase(record).await.unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(f.store.get_all().await.unwrap().is_empty());
        // No idempotency key, so the handled set stays empty
        assert!(f.handled.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_keeps_record_queued_and_unhandled() {
        let transport = MockTransport::failing();
        let f = fixture(transport.clone(), None);

        f.manager.log_in_app_purchase(store_record(5)).await.unwrap();

        assert_eq!(f.store.get_all().await.unwrap().len(), 1);
        assert!(!f.manager.is_handled(5).await.unwrap());

        // Backend recovers; next flush drains the queue
        transport.fail.store(false, Ordering::SeqCst);
        f.manager.flush_queue().await.unwrap();
        assert!(f.store.get_all().await.unwrap().is_empty());
        assert!(f.manager.is_handled(5).await.unwrap());
    }
}
