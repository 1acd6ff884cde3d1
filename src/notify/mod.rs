//! Notification Dispatcher (spec.md §4.7).

mod channel;
mod dispatcher;

pub use channel::{DeliveryResult, NotificationChannel};
pub use dispatcher::NotificationDispatcher;
