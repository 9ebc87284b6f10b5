//! App lifecycle observer capability
//!
//! The host application drives foreground/background transitions; the event
//! and payment managers only need the two hooks, not the platform broadcast
//! mechanism.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Component reacting to app lifecycle transitions
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    /// App moved to the foreground
    async fn on_foreground(&self);

    /// App moved to the background
    async fn on_background(&self);
}

/// Registry dispatching lifecycle transitions to observers
#[derive(Default)]
pub struct LifecycleNotifier {
    observers: Mutex<Vec<Arc<dyn LifecycleObserver>>>,
}

impl LifecycleNotifier {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; registration order is dispatch order
    pub fn register(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers.lock().push(observer);
    }

    /// Dispatch a foreground transition to every observer
    pub async fn notify_foreground(&self) {
        let observers = self.observers.lock().clone();
        debug!(count = observers.len(), "Dispatching foreground transition");
        for observer in observers {
            observer.on_foreground().await;
        }
    }

    /// Dispatch a background transition to every observer
    pub async fn notify_background(&self) {
        let observers = self.observers.lock().clone();
        debug!(count = observers.len(), "Dispatching background transition");
        for observer in observers {
            observer.on_background().await;
        }
    }
}
