//! Notification Dispatcher (spec.md §4.7).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::warn;

use super::channel::{DeliveryResult, NotificationChannel};
use crate::models::{EventKind, StockEvent, Subscription};

const BROADCAST_ID: &str = "broadcast";

/// `(subscriber_or_broadcast, product_canonical_key, event_kind)` dedup
/// cache. An LRU capacity bound plus a time window (spec.md §4.7, §5):
/// entries past `window` are treated as absent without being proactively
/// swept, so eviction for capacity never drops a still-relevant entry
/// before a still-older one.
struct DedupCache {
    entries: Mutex<(HashMap<String, DateTime<Utc>>, VecDeque<String>)>,
    capacity: usize,
    window: Duration,
}

impl DedupCache {
    fn new(capacity: usize, window: Duration) -> Self {
        Self {
            entries: Mutex::new((HashMap::new(), VecDeque::new())),
            capacity,
            window,
        }
    }

    /// Returns `true` (and records the emission) the first time `key` is
    /// seen, or once the prior record has aged past `window`.
    fn should_emit(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut guard = self.entries.lock();
        let (map, order) = &mut *guard;

        if let Some(last) = map.get(key) {
            if now.signed_duration_since(*last) < chrono::Duration::from_std(self.window).unwrap() {
                return false;
            }
        }

        map.insert(key.to_string(), now);
        order.push_back(key.to_string());
        while map.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                map.remove(&oldest);
            } else {
                break;
            }
        }
        true
    }
}

fn dedup_key(subscriber_id: &str, event: &StockEvent) -> String {
    format!("{subscriber_id}|{}|{}", event.product_key, event.kind.as_str())
}

/// (a)-(d) of spec.md §4.7. Locale constraints have no carrier on
/// `StockEvent` in this core (events are retailer/price/stock facts, not
/// locale-scoped) so a configured locale is always treated as satisfied;
/// enforcing it is left to the channel transport, which does see the
/// subscriber's locale.
fn matches(sub: &Subscription, event: &StockEvent) -> bool {
    if !sub.notify_on_stock {
        return false;
    }
    let item_matches = sub.item_match == event.product_key
        || event
            .product_name
            .to_lowercase()
            .contains(&sub.item_match.to_lowercase());
    if !item_matches {
        return false;
    }
    if let Some(target) = sub.target_price {
        match event.price {
            Some(price) if price <= target => {}
            _ => return false,
        }
    }
    true
}

/// How often a broadcast failure for the same channel is allowed to reach
/// the logs (spec.md §4.7: "logged once per channel per 5 minutes to
/// prevent log flooding"). Per-subscriber failures are not rate-limited —
/// they are comparatively rare and each one matters to that subscriber.
const BROADCAST_FAILURE_LOG_WINDOW: Duration = Duration::from_secs(5 * 60);

pub struct NotificationDispatcher {
    channels: Vec<Box<dyn NotificationChannel>>,
    dedup: DedupCache,
    broadcast_failure_log: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl NotificationDispatcher {
    pub fn new(channels: Vec<Box<dyn NotificationChannel>>, dedup_capacity: usize, dedup_window: Duration) -> Self {
        Self {
            channels,
            dedup: DedupCache::new(dedup_capacity, dedup_window),
            broadcast_failure_log: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` the first time a broadcast failure is seen for
    /// `channel` or once `BROADCAST_FAILURE_LOG_WINDOW` has elapsed since
    /// the last logged one.
    fn should_log_broadcast_failure(&self, channel: &str) -> bool {
        let now = Utc::now();
        let mut last = self.broadcast_failure_log.lock();
        match last.get(channel) {
            Some(prev) if now.signed_duration_since(*prev) < ChronoDuration::from_std(BROADCAST_FAILURE_LOG_WINDOW).unwrap() => {
                false
            }
            _ => {
                last.insert(channel.to_string(), now);
                true
            }
        }
    }

    /// Matches `event` against `subscriptions`, deduplicates per spec.md
    /// §4.7, and fans out to every channel that supports the event kind.
    /// `lost_stock` events are informational only (spec.md §4.6) — they are
    /// still matched and deduplicated the same way, leaving the decision to
    /// suppress them to channel policy, not the dispatcher.
    pub async fn emit(
        &self,
        event: &StockEvent,
        subscriptions: &[Subscription],
    ) -> Vec<(String, DeliveryResult)> {
        let mut receipts = Vec::new();

        if event.kind == EventKind::NewInStock {
            for sub in subscriptions.iter().filter(|s| matches(s, event)) {
                if !self.dedup.should_emit(&dedup_key(&sub.user_id, event)) {
                    continue;
                }
                for channel in self.channels.iter().filter(|c| c.supports(event.kind)) {
                    let result = channel.send(&sub.user_id, event).await;
                    if let DeliveryResult::Failed { reason, .. } = &result {
                        warn!(channel = channel.name(), subscriber = %sub.user_id, %reason, "delivery failed");
                    }
                    receipts.push((sub.user_id.clone(), result));
                }
            }
        }

        if self.dedup.should_emit(&dedup_key(BROADCAST_ID, event)) {
            for channel in self.channels.iter().filter(|c| c.supports(event.kind)) {
                let result = channel.send(BROADCAST_ID, event).await;
                if let DeliveryResult::Failed { reason, .. } = &result {
                    if self.should_log_broadcast_failure(channel.name()) {
                        warn!(channel = channel.name(), %reason, "broadcast delivery failed");
                    }
                }
                receipts.push((BROADCAST_ID.to_string(), result));
            }
        }

        receipts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::channel::fakes::{FailingChannel, RecordingChannel};
    use std::sync::Arc;

    fn event(kind: EventKind, key: &str, name: &str, price: Option<f64>) -> StockEvent {
        StockEvent {
            kind,
            retailer: "target".into(),
            product_key: key.into(),
            product_name: name.into(),
            url: None,
            price,
            market_price: None,
            delta_pct: None,
            observed_at: Utc::now(),
            source_task_id: 1,
        }
    }

    fn sub(user_id: &str, item_match: &str, target_price: Option<f64>) -> Subscription {
        Subscription {
            user_id: user_id.into(),
            item_match: item_match.into(),
            target_price,
            notify_on_stock: true,
            locale: None,
        }
    }

    #[tokio::test]
    async fn matches_by_canonical_key_and_delivers() {
        let recording = Arc::new(RecordingChannel::new());
        let recording2 = recording.clone();
        let dispatcher = NotificationDispatcher::new(
            vec![Box::new(RecordingChannelHandle(recording2))],
            10_000,
            Duration::from_secs(1800),
        );
        let e = event(EventKind::NewInStock, "target|sku1", "Widget", Some(9.99));
        let subs = vec![sub("alice", "target|sku1", None)];

        let receipts = dispatcher.emit(&e, &subs).await;
        // one per-subscriber delivery + one broadcast delivery
        assert_eq!(receipts.len(), 2);
        assert_eq!(recording.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn target_price_filters_out_subscriber() {
        let recording = Arc::new(RecordingChannel::new());
        let dispatcher = NotificationDispatcher::new(
            vec![Box::new(RecordingChannelHandle(recording.clone()))],
            10_000,
            Duration::from_secs(1800),
        );
        let e = event(EventKind::NewInStock, "target|sku1", "Widget", Some(25.00));
        let subs = vec![sub("alice", "target|sku1", Some(20.00))];

        dispatcher.emit(&e, &subs).await;
        // only the broadcast send happens, not the per-subscriber one
        assert_eq!(recording.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_emission_within_window_is_suppressed() {
        let recording = Arc::new(RecordingChannel::new());
        let dispatcher = NotificationDispatcher::new(
            vec![Box::new(RecordingChannelHandle(recording.clone()))],
            10_000,
            Duration::from_secs(1800),
        );
        let e = event(EventKind::NewInStock, "target|sku1", "Widget", Some(9.99));
        let subs = vec![sub("alice", "target|sku1", None)];

        dispatcher.emit(&e, &subs).await;
        let second = dispatcher.emit(&e, &subs).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn one_failed_channel_does_not_block_another() {
        let recording = Arc::new(RecordingChannel::new());
        let dispatcher = NotificationDispatcher::new(
            vec![Box::new(FailingChannel), Box::new(RecordingChannelHandle(recording.clone()))],
            10_000,
            Duration::from_secs(1800),
        );
        let e = event(EventKind::NewInStock, "target|sku1", "Widget", Some(9.99));
        let subs = vec![sub("alice", "target|sku1", None)];

        let receipts = dispatcher.emit(&e, &subs).await;
        assert!(receipts.iter().any(|(_, r)| matches!(r, DeliveryResult::Delivered { .. })));
        assert!(receipts.iter().any(|(_, r)| matches!(r, DeliveryResult::Failed { .. })));
    }

    #[test]
    fn broadcast_failure_log_suppressed_within_window() {
        let dispatcher = NotificationDispatcher::new(Vec::new(), 10_000, Duration::from_secs(1800));
        assert!(dispatcher.should_log_broadcast_failure("webhook"));
        assert!(!dispatcher.should_log_broadcast_failure("webhook"));
        assert!(dispatcher.should_log_broadcast_failure("sms"));
    }

    /// Wraps the `Arc<RecordingChannel>` test fixture so it can be boxed as
    /// a trait object while the test still holds a handle to inspect it.
    struct RecordingChannelHandle(Arc<RecordingChannel>);

    #[async_trait::async_trait]
    impl NotificationChannel for RecordingChannelHandle {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn supports(&self, kind: EventKind) -> bool {
            self.0.supports(kind)
        }
        async fn send(&self, subscriber_ref: &str, event: &StockEvent) -> DeliveryResult {
            self.0.send(subscriber_ref, event).await
        }
    }
}
