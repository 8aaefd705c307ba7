//! Broker metrics.
//!
//! Each metric family has a label struct so label names and arity are fixed
//! at compile time.

use metrics::{counter, gauge};

use crate::traits::Backend;

/// Metric names.
pub mod names {
    pub const PUBLISH_TOTAL: &str = "huddle_broker_publish_total";
    pub const PUBLISH_ERRORS_TOTAL: &str = "huddle_broker_publish_errors_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "huddle_broker_subscriptions_active";
    pub const RESTARTS_TOTAL: &str = "huddle_broker_restarts_total";
}

/// Labels for per-topic publish counters.
#[derive(Debug, Clone, Copy)]
pub struct TopicLabels<'a> {
    pub topic: &'a str,
    pub backend: Backend,
}

impl TopicLabels<'_> {
    fn to_labels(self) -> [(&'static str, String); 2] {
        [
            ("topic", self.topic.to_string()),
            ("backend", self.backend.as_str().to_string()),
        ]
    }
}

/// Labels for publish failures.
#[derive(Debug, Clone, Copy)]
pub struct PublishErrorLabels<'a> {
    pub topic: &'a str,
    pub backend: Backend,
    pub category: &'static str,
}

impl PublishErrorLabels<'_> {
    fn to_labels(self) -> [(&'static str, String); 3] {
        [
            ("topic", self.topic.to_string()),
            ("backend", self.backend.as_str().to_string()),
            ("category", self.category.to_string()),
        ]
    }
}

/// Labels for per-backend gauges and counters.
#[derive(Debug, Clone, Copy)]
pub struct BackendLabels {
    pub backend: Backend,
}

impl BackendLabels {
    #[must_use]
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    fn to_labels(self) -> [(&'static str, String); 1] {
        [("backend", self.backend.as_str().to_string())]
    }
}

/// Register descriptions with the installed recorder.
pub fn describe() {
    metrics::describe_counter!(names::PUBLISH_TOTAL, "Messages published to the broker");
    metrics::describe_counter!(
        names::PUBLISH_ERRORS_TOTAL,
        "Broker publishes that failed, by category"
    );
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Currently registered broker subscriptions"
    );
    metrics::describe_counter!(names::RESTARTS_TOTAL, "Completed broker recovery cycles");
}

pub fn record_publish(labels: &TopicLabels<'_>) {
    counter!(names::PUBLISH_TOTAL, &labels.to_labels()).increment(1);
}

pub fn record_publish_error(labels: &PublishErrorLabels<'_>) {
    counter!(names::PUBLISH_ERRORS_TOTAL, &labels.to_labels()).increment(1);
}

pub fn subscription_opened(labels: &BackendLabels) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE, &labels.to_labels()).increment(1.0);
}

pub fn subscription_closed(labels: &BackendLabels) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE, &labels.to_labels()).decrement(1.0);
}

pub fn record_restart(labels: &BackendLabels) {
    counter!(names::RESTARTS_TOTAL, &labels.to_labels()).increment(1);
}
