//! In-memory browser session record (spec §3 "BrowserSession").
//!
//! Never persisted across coordinator restarts — the Browser Pool
//! (`matrix-browser`) is the sole owner of these.

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered with the pool but no remote window has been opened yet.
    Unopened,
    Idle,
    Busy,
    Error,
}

impl SessionState {
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Busy)
    }
}

/// A live connection to an open browser-control window, keyed by the
/// account's window name.
#[derive(Debug, Clone)]
pub struct BrowserSession {
    /// Pool-generated identity.
    pub pool_id: Uuid,
    /// Identity returned by the external browser-control API, once opened.
    pub window_id: Option<String>,
    /// The window name this session is bound to (1:1 with an account).
    pub window_name: String,
    pub state: SessionState,
    pub upload_count: u64,
    pub error_count: u64,
    pub last_activity: DateTime<Utc>,
    pub is_logged_in: bool,
    pub debug_endpoint: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_leased_at: Option<DateTime<Utc>>,
}

impl BrowserSession {
    /// A freshly registered, not-yet-opened slot for `window_name`.
    pub fn new(window_name: impl Into<String>) -> Self {
        Self {
            pool_id: Uuid::new_v4(),
            window_id: None,
            window_name: window_name.into(),
            state: SessionState::Unopened,
            upload_count: 0,
            error_count: 0,
            last_activity: Utc::now(),
            is_logged_in: false,
            debug_endpoint: None,
            opened_at: None,
            last_leased_at: None,
        }
    }

    pub fn mark_open(&mut self, window_id: impl Into<String>, debug_endpoint: impl Into<String>) {
        self.window_id = Some(window_id.into());
        self.debug_endpoint = Some(debug_endpoint.into());
        self.state = SessionState::Idle;
        self.opened_at = Some(Utc::now());
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn record_upload(&mut self) {
        self.upload_count += 1;
        self.touch();
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
        self.state = SessionState::Error;
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_unopened() {
        let session = BrowserSession::new("acct-1");
        assert_eq!(session.state, SessionState::Unopened);
        assert!(!session.state.is_live());
        assert!(session.window_id.is_none());
    }

    #[test]
    fn mark_open_transitions_to_idle() {
        let mut session = BrowserSession::new("acct-1");
        session.mark_open("win-123", "ws://127.0.0.1:9000/devtools/1");
        assert!(session.state.is_live());
        assert_eq!(session.window_id.as_deref(), Some("win-123"));
        assert!(session.opened_at.is_some());
    }
}
