//! Webhook idempotency guard
//!
//! Journal of provider event ids. Reconciliation is idempotent on its own, so
//! ledger failures are logged and processing continues. The admission reports
//! whether the event made it into the journal, since an unjournaled event is
//! invisible to the replay job.

use std::sync::Arc;

use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Side effects already committed; acknowledge without reprocessing
    AlreadyProcessed,
    /// Process the event, then mark it processed
    Proceed {
        /// Whether a ledger row exists for replay to find
        journaled: bool,
    },
}

pub struct IdempotencyGuard {
    store: Arc<dyn BillingStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Decide whether an event needs processing and journal it if so
    pub async fn admit(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Admission {
        match self.store.find_webhook_event(event_id).await {
            Ok(Some(row)) if row.processed => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Webhook event already processed, skipping"
                );
                return Admission::AlreadyProcessed;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    event_id = %event_id,
                    error = %e,
                    "Webhook ledger lookup failed, processing anyway"
                );
            }
        }

        match self
            .store
            .record_webhook_event(event_id, event_type, payload)
            .await
        {
            Ok(()) => Admission::Proceed { journaled: true },
            Err(e) => {
                tracing::warn!(
                    event_id = %event_id,
                    error = %e,
                    "Failed to journal webhook event, processing anyway"
                );
                Admission::Proceed { journaled: false }
            }
        }
    }

    /// Mark an event processed, retrying once
    ///
    /// Returns whether the mark stuck. A failure is never fatal: the provider
    /// redelivers and the replay job picks the row up again.
    pub async fn mark_processed(&self, event_id: &str) -> bool {
        for attempt in 1..=2 {
            match self.store.mark_webhook_event_processed(event_id).await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(
                        event_id = %event_id,
                        attempt = attempt,
                        error = %e,
                        "Failed to mark webhook event processed"
                    );
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBillingStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_first_sight_is_journaled_unprocessed() {
        let store = InMemoryBillingStore::new();
        let guard = IdempotencyGuard::new(Arc::new(store.clone()));

        let admission = guard.admit("evt_1", "checkout.session.completed", &json!({"a": 1})).await;
        assert_eq!(admission, Admission::Proceed { journaled: true });

        let row = store.webhook_event("evt_1").unwrap();
        assert!(!row.processed);
        assert_eq!(row.event_type, "checkout.session.completed");
    }

    #[tokio::test]
    async fn test_unprocessed_row_is_refreshed_and_readmitted() {
        let store = InMemoryBillingStore::new();
        let guard = IdempotencyGuard::new(Arc::new(store.clone()));

        guard.admit("evt_1", "old.type", &json!({"v": 1})).await;
        let admission = guard.admit("evt_1", "new.type", &json!({"v": 2})).await;

        assert_eq!(admission, Admission::Proceed { journaled: true });
        let row = store.webhook_event("evt_1").unwrap();
        assert_eq!(row.event_type, "new.type");
        assert_eq!(row.payload, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_processed_event_short_circuits() {
        let store = InMemoryBillingStore::new();
        let guard = IdempotencyGuard::new(Arc::new(store.clone()));

        guard.admit("evt_1", "t", &json!({})).await;
        assert!(guard.mark_processed("evt_1").await);
        assert_eq!(guard.admit("evt_1", "t", &json!({})).await, Admission::AlreadyProcessed);
    }

    #[tokio::test]
    async fn test_ledger_failure_still_proceeds() {
        let store = InMemoryBillingStore::new();
        store.fail_ledger(true);
        let guard = IdempotencyGuard::new(Arc::new(store.clone()));

        assert_eq!(
            guard.admit("evt_1", "t", &json!({})).await,
            Admission::Proceed { journaled: false }
        );
        assert!(!guard.mark_processed("evt_1").await);
    }
}
