//! Fan-out and replication metrics.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const FANOUT_DELIVERIES_TOTAL: &str = "huddle_fanout_deliveries_total";
    pub const FANOUT_FAILURES_TOTAL: &str = "huddle_fanout_failures_total";
    pub const REPLICATION_RECEIVED_TOTAL: &str = "huddle_replication_received_total";
    pub const REPLICATION_SELF_ECHO_TOTAL: &str = "huddle_replication_self_echo_total";
    pub const REPLICATION_DECODE_ERRORS_TOTAL: &str = "huddle_replication_decode_errors_total";
    pub const VOICE_REJECTIONS_TOTAL: &str = "huddle_voice_rejections_total";
}

/// Labels keyed by topic kind (`presence`, `typing`, `voice`).
#[derive(Debug, Clone, Copy)]
pub struct KindLabels<'a> {
    pub kind: &'a str,
}

impl<'a> KindLabels<'a> {
    #[must_use]
    pub fn new(kind: &'a str) -> Self {
        Self { kind }
    }

    fn to_labels(self) -> [(&'static str, String); 1] {
        [("kind", self.kind.to_string())]
    }
}

/// Labels keyed by replication topic.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationLabels<'a> {
    pub topic: &'a str,
}

impl ReplicationLabels<'_> {
    fn to_labels(self) -> [(&'static str, String); 1] {
        [("topic", self.topic.to_string())]
    }
}

/// Register descriptions with the installed recorder.
pub fn describe() {
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Registered local connections by topic kind");
    metrics::describe_counter!(names::FANOUT_DELIVERIES_TOTAL, "Payloads delivered to local sockets");
    metrics::describe_counter!(names::FANOUT_FAILURES_TOTAL, "Local socket sends that failed");
    metrics::describe_counter!(
        names::REPLICATION_RECEIVED_TOTAL,
        "Remote envelopes applied from the broker"
    );
    metrics::describe_counter!(
        names::REPLICATION_SELF_ECHO_TOTAL,
        "Envelopes dropped because this node published them"
    );
    metrics::describe_counter!(
        names::REPLICATION_DECODE_ERRORS_TOTAL,
        "Broker payloads that failed to decode"
    );
    metrics::describe_counter!(names::VOICE_REJECTIONS_TOTAL, "Rejected voice mutations by reason");
}

pub fn connection_opened(labels: &KindLabels<'_>) {
    gauge!(names::CONNECTIONS_ACTIVE, &labels.to_labels()).increment(1.0);
}

pub fn connection_closed(labels: &KindLabels<'_>) {
    gauge!(names::CONNECTIONS_ACTIVE, &labels.to_labels()).decrement(1.0);
}

pub fn record_delivery(labels: &KindLabels<'_>) {
    counter!(names::FANOUT_DELIVERIES_TOTAL, &labels.to_labels()).increment(1);
}

pub fn record_delivery_failure(labels: &KindLabels<'_>) {
    counter!(names::FANOUT_FAILURES_TOTAL, &labels.to_labels()).increment(1);
}

pub fn record_received(labels: &ReplicationLabels<'_>) {
    counter!(names::REPLICATION_RECEIVED_TOTAL, &labels.to_labels()).increment(1);
}

pub fn record_self_echo(labels: &ReplicationLabels<'_>) {
    counter!(names::REPLICATION_SELF_ECHO_TOTAL, &labels.to_labels()).increment(1);
}

pub fn record_decode_error(labels: &ReplicationLabels<'_>) {
    counter!(names::REPLICATION_DECODE_ERRORS_TOTAL, &labels.to_labels()).increment(1);
}

pub fn record_voice_rejection(reason: &'static str) {
    counter!(names::VOICE_REJECTIONS_TOTAL, "reason" => reason).increment(1);
}
