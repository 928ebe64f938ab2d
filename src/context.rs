//! Request-scoped context threaded through every engine call.
//!
//! Gateway-injected identity and deadlines are carried explicitly instead of
//! living in ambient task-local storage.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::errors::{InventoryError, Result};

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub actor: String,
    pub deadline: Option<DateTime<Utc>>,
}

impl RequestContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            actor: actor.into(),
            deadline: None,
        }
    }

    /// Context for internal callers (sweeper, bus consumer).
    pub fn system(component: &str) -> Self {
        Self::new(component)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Utc::now() + timeout;
        self.with_deadline(deadline)
    }

    /// Checked at entry to each engine operation and before every
    /// authoritative store call.
    pub fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Utc::now() >= deadline => Err(InventoryError::Cancelled),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_deadline_is_active() {
        let ctx = RequestContext::new("tester");
        assert!(ctx.check_deadline().is_ok());
        assert_eq!(ctx.actor, "tester");
    }

    #[test]
    fn test_past_deadline_cancels() {
        let ctx = RequestContext::new("tester").with_deadline(Utc::now() - Duration::seconds(1));
        assert!(matches!(
            ctx.check_deadline(),
            Err(InventoryError::Cancelled)
        ));
    }

    #[test]
    fn test_future_deadline_is_active() {
        let ctx = RequestContext::new("tester").with_timeout(Duration::minutes(1));
        assert!(ctx.check_deadline().is_ok());
    }
}
