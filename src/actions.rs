//! Authentication-gated action queue
//!
//! Public operations invoked before the SDK finishes authenticating buffer
//! here and replay, in call order, once authentication resolves. On failure
//! the queue drains through the failure thunks instead, so caller callbacks
//! always complete. Nothing in this queue survives a process restart.

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Authentication state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Initial state, before configure() triggers authentication
    Unauthenticated,
    /// Authentication request in flight
    Authenticating,
    /// Session established; gated operations execute directly
    Authenticated,
    /// Authentication failed; gated operations complete with failure
    Failed,
}

/// What a buffered operation was going to do, for dispatch and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Deep link generation
    GenerateLink,
    /// Notification list fetch
    Notifications,
    /// Unread notification count fetch
    UnreadCount,
    /// Mark-notification-read call
    MarkNotificationRead,
    /// Link detail lookup
    LinkDetails,
    /// Automatic message-UI fetch
    DisplayMessages,
}

type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// One deferred operation: consumed exactly once on auth resolution
pub struct PendingAction {
    /// Operation tag
    pub kind: ActionKind,
    on_success: Thunk,
    on_failure: Thunk,
}

struct GateState {
    auth: AuthState,
    queue: Vec<PendingAction>,
}

/// Auth state plus the ordered queue of deferred operations
pub struct AuthGate {
    state: Mutex<GateState>,
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthGate {
    /// Start in the unauthenticated state with an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                auth: AuthState::Unauthenticated,
                queue: Vec::new(),
            }),
        }
    }

    /// Current authentication state
    pub fn auth_state(&self) -> AuthState {
        self.state.lock().auth
    }

    /// Number of buffered operations
    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Mark an authentication attempt as in flight
    pub fn begin_authenticating(&self) {
        let mut state = self.state.lock();
        state.auth = AuthState::Authenticating;
    }

    /// Run the operation now or buffer it until authentication resolves
    ///
    /// When authenticated, `on_success` runs immediately (outside the lock)
    /// and `true` is returned. While unauthenticated or authenticating the
    /// pair is queued in call order. After a failed authentication the
    /// failure thunk runs immediately; a later `begin_authenticating` call
    /// reopens buffering with a fresh queue. The check and the enqueue
    /// happen under one lock so a concurrent auth resolution cannot slip
    /// between them.
    pub fn run_or_enqueue<S, F>(&self, kind: ActionKind, on_success: S, on_failure: F) -> bool
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let auth = {
            let mut state = self.state.lock();
            match state.auth {
                AuthState::Unauthenticated | AuthState::Authenticating => {
                    debug!(?kind, auth = ?state.auth, "Buffering operation until authentication resolves");
                    state.queue.push(PendingAction {
                        kind,
                        on_success: Box::new(on_success),
                        on_failure: Box::new(on_failure),
                    });
                    return false;
                }
                auth => auth,
            }
        };
        match auth {
            AuthState::Authenticated => {
                on_success();
                true
            }
            _ => {
                debug!(?kind, "Authentication already failed, completing with failure");
                on_failure();
                false
            }
        }
    }

    /// Transition to `Authenticated` and replay the queue in FIFO order
    pub fn resolve_success(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.auth = AuthState::Authenticated;
            std::mem::take(&mut state.queue)
        };

        if !drained.is_empty() {
            info!(count = drained.len(), "Replaying operations buffered during authentication");
        }
        // Thunks run outside the lock; a replayed call may re-enter the gate
        for action in drained {
            (action.on_success)();
        }
    }

    /// Transition to `Failed` and drain the queue through the failure thunks
    pub fn resolve_failure(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.auth = AuthState::Failed;
            std::mem::take(&mut state.queue)
        };

        if !drained.is_empty() {
            warn!(count = drained.len(), "Failing operations buffered during authentication");
        }
        for action in drained {
            (action.on_failure)();
        }
    }
}
