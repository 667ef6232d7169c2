use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

/// The git operation being attempted, as seen by the authorization callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitOperation {
    Pull,
    Push,
}

impl GitOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
        }
    }
}

/// Authorization level granted by the host-supplied callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationLevel {
    Denied,
    ReadOnly,
    Restricted,
    Allowed,
}

/// Per-request context populated by the authorization callback and consumed
/// by the reference discovery filter and the policy engine.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub username: Option<String>,
    pub is_admin: bool,
    pub can_view: bool,
    pub can_edit: bool,
    pub has_solved: bool,
}

/// Outcome of the authorization callback. When the level is `Denied` and
/// `challenge` is set, the front responds 401 with a `WWW-Authenticate`
/// header; otherwise a plain 403.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationResponse {
    pub level: AuthorizationLevel,
    pub challenge: bool,
}

impl AuthorizationResponse {
    #[must_use]
    pub fn granted(level: AuthorizationLevel) -> Self {
        Self {
            level,
            challenge: false,
        }
    }

    #[must_use]
    pub fn denied(challenge: bool) -> Self {
        Self {
            level: AuthorizationLevel::Denied,
            challenge,
        }
    }
}

pub type AuthorizationCallback = Arc<
    dyn Fn(&mut RequestContext, &HeaderMap, &str, GitOperation) -> AuthorizationResponse
        + Send
        + Sync,
>;

/// Filter deciding whether a reference is advertised to this request.
pub type ReferenceDiscoveryCallback =
    Arc<dyn Fn(&RequestContext, &str) -> bool + Send + Sync>;

/// Hard wall-time bound for a single push. Validators and the interactive
/// compiler observe it and abort once elapsed.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    #[must_use]
    pub fn new(limit: Duration) -> Self {
        Self {
            end: Instant::now() + limit,
        }
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }

    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline() {
        let deadline = Deadline::new(Duration::from_secs(60));
        assert!(!deadline.expired());
        assert!(deadline.remaining() <= Duration::from_secs(60));

        let elapsed = Deadline::new(Duration::ZERO);
        assert!(elapsed.expired());
        assert_eq!(elapsed.remaining(), Duration::ZERO);
    }
}
