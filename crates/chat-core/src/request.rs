use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Identifier for one submitted request.
///
/// This changes on every submit so late events from a superseded request can be
/// told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "req-{}", self.0)
    }
}

/// Cancellation handle bound to exactly one request.
#[derive(Debug, Clone)]
pub struct RequestToken {
    id: RequestId,
    signal: CancellationToken,
}

impl RequestToken {
    fn new(id: RequestId) -> Self {
        Self {
            id,
            signal: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Resolves once the request has been cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.signal.cancelled()
    }

    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }
}

/// Single-flight owner of the in-flight request token.
#[derive(Debug)]
pub struct RequestController {
    next_id: u64,
    active: Option<RequestToken>,
}

impl RequestController {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            active: None,
        }
    }

    /// Starts a new request, cancelling any request that is still active.
    ///
    /// Returns the new token and the id of the request it superseded.
    pub fn begin(&mut self) -> (RequestToken, Option<RequestId>) {
        let superseded = self.cancel();
        let token = RequestToken::new(RequestId::new(self.next_id));
        self.next_id = self.next_id.saturating_add(1);
        self.active = Some(token.clone());
        (token, superseded)
    }

    /// Signals cancellation of the active request. No-op when idle.
    pub fn cancel(&mut self) -> Option<RequestId> {
        let token = self.active.take()?;
        token.signal.cancel();
        Some(token.id)
    }

    /// Cancels `token` only if it is still the active request.
    pub fn cancel_token(&mut self, token: &RequestToken) -> bool {
        if !self.is_active(token) {
            return false;
        }
        self.cancel().is_some()
    }

    /// Marks the active request as completed without signalling it.
    pub fn settle(&mut self, id: RequestId) -> bool {
        match &self.active {
            Some(active) if active.id == id => {
                self.active = None;
                true
            }
            Some(_) | None => false,
        }
    }

    /// Forgets the active request without signalling it.
    pub fn detach(&mut self) -> Option<RequestId> {
        self.active.take().map(|token| token.id)
    }

    pub fn is_active(&self, token: &RequestToken) -> bool {
        self.active_id() == Some(token.id) && !token.is_cancelled()
    }

    pub fn active_id(&self) -> Option<RequestId> {
        self.active.as_ref().map(|token| token.id)
    }
}

impl Default for RequestController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_supersedes_and_cancels_previous() {
        let mut controller = RequestController::new();
        let (first, superseded) = controller.begin();
        assert_eq!(superseded, None);

        let (second, superseded) = controller.begin();

        assert_eq!(superseded, Some(first.id()));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(controller.is_active(&second));
        assert!(!controller.is_active(&first));
        assert!(second.id() > first.id());
    }

    #[test]
    fn cancel_is_noop_once_settled_or_cancelled() {
        let mut controller = RequestController::new();
        let (token, _) = controller.begin();

        assert!(controller.settle(token.id()));
        assert_eq!(controller.cancel(), None);
        assert!(!controller.cancel_token(&token));
        assert!(!token.is_cancelled());

        let (token, _) = controller.begin();
        assert!(controller.cancel_token(&token));
        assert!(!controller.cancel_token(&token));
        assert_eq!(controller.cancel(), None);
    }

    #[test]
    fn settle_ignores_foreign_ids() {
        let mut controller = RequestController::new();
        let (token, _) = controller.begin();

        assert!(!controller.settle(RequestId::new(999)));
        assert_eq!(controller.active_id(), Some(token.id()));
    }

    #[test]
    fn detach_does_not_signal() {
        let mut controller = RequestController::new();
        let (token, _) = controller.begin();

        assert_eq!(controller.detach(), Some(token.id()));
        assert!(!token.is_cancelled());
        assert!(!controller.is_active(&token));
    }
}
