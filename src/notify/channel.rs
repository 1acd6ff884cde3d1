//! Notification channel plug-in interface (spec.md §6).

use async_trait::async_trait;

use crate::models::{EventKind, StockEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered { id: String },
    Failed { reason: String, retryable: bool },
}

/// A delivery transport. The core ships no concrete channel — only this
/// seam and the in-memory fakes below, exercised by `dispatcher` tests.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    fn supports(&self, kind: EventKind) -> bool;
    async fn send(&self, subscriber_ref: &str, event: &StockEvent) -> DeliveryResult;
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use parking_lot::Mutex;

    /// Records every delivery attempt; always succeeds.
    pub struct RecordingChannel {
        pub sent: Mutex<Vec<(String, StockEvent)>>,
    }

    impl RecordingChannel {
        pub fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }
        fn supports(&self, kind: EventKind) -> bool {
            matches!(kind, EventKind::NewInStock)
        }
        async fn send(&self, subscriber_ref: &str, event: &StockEvent) -> DeliveryResult {
            self.sent.lock().push((subscriber_ref.to_string(), event.clone()));
            DeliveryResult::Delivered { id: format!("{}-{}", subscriber_ref, event.product_key) }
        }
    }

    /// Always fails, for exercising the dedup cache's interaction with
    /// failed deliveries.
    pub struct FailingChannel;

    #[async_trait]
    impl NotificationChannel for FailingChannel {
        fn name(&self) -> &str {
            "failing"
        }
        fn supports(&self, _kind: EventKind) -> bool {
            true
        }
        async fn send(&self, _subscriber_ref: &str, _event: &StockEvent) -> DeliveryResult {
            DeliveryResult::Failed { reason: "simulated failure".into(), retryable: true }
        }
    }
}
