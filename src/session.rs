//! Process-wide session state
//!
//! Built once per `configure()` call and shared by reference with every
//! component. Lives for the process; there is no teardown API.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

/// Authenticated session state
#[derive(Debug, Clone, Default)]
pub struct AuthSession {
    /// Backend-issued session correlation id
    pub linksquared_id: Option<String>,

    /// URI scheme registered for deep links
    pub uri_scheme: Option<String>,

    /// Developer-provided user identifier
    pub identifier: Option<String>,

    /// Developer-provided visitor attributes
    pub attributes: Option<Value>,

    /// User agent forwarded on outbound requests
    pub user_agent: Option<String>,
}

/// Shared handle over the session state
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<RwLock<AuthSession>>,
}

impl SessionHandle {
    /// Create a handle with the configured scheme and user agent pre-filled
    pub fn new(uri_scheme: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(AuthSession {
                uri_scheme,
                user_agent,
                ..AuthSession::default()
            })),
        }
    }

    /// Point-in-time copy of the session
    pub fn snapshot(&self) -> AuthSession {
        self.inner.read().clone()
    }

    /// Record the backend-issued session correlation id
    pub fn set_linksquared_id(&self, id: impl Into<String>) {
        self.inner.write().linksquared_id = Some(id.into());
    }

    /// Record the developer-provided user identifier
    pub fn set_identifier(&self, identifier: impl Into<String>) {
        self.inner.write().identifier = Some(identifier.into());
    }

    /// Record the developer-provided visitor attributes
    pub fn set_attributes(&self, attributes: Value) {
        self.inner.write().attributes = Some(attributes);
    }

    /// Whether authentication has populated the correlation id
    pub fn is_established(&self) -> bool {
        self.inner.read().linksquared_id.is_some()
    }
}
