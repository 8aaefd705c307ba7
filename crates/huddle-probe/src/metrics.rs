//! Probe metrics, labeled by endpoint.

use std::time::UNIX_EPOCH;

use metrics::{counter, gauge};

use crate::endpoint::TurnEndpoint;
use crate::probe::TurnCheckResult;

/// Metric names.
pub mod names {
    pub const PORT_AVAILABLE: &str = "turn_probe_port_available";
    pub const AUTH_VALID: &str = "turn_probe_auth_valid";
    pub const DURATION_SECONDS: &str = "turn_probe_duration_seconds";
    pub const LAST_CHECK_TIMESTAMP_SECONDS: &str = "turn_probe_last_check_timestamp_seconds";
    pub const SUCCESS_TOTAL: &str = "turn_probe_success_total";
    pub const FAILURE_TOTAL: &str = "turn_probe_failure_total";
}

/// `{server, port, transport}`.
#[derive(Debug, Clone, Copy)]
pub struct EndpointLabels<'a> {
    pub endpoint: &'a TurnEndpoint,
}

impl<'a> EndpointLabels<'a> {
    #[must_use]
    pub fn new(endpoint: &'a TurnEndpoint) -> Self {
        Self { endpoint }
    }

    fn to_labels(self) -> [(&'static str, String); 3] {
        [
            ("server", self.endpoint.host.clone()),
            ("port", self.endpoint.port.to_string()),
            ("transport", self.endpoint.transport.as_str().to_string()),
        ]
    }
}

/// Endpoint labels plus the failure category.
#[derive(Debug, Clone, Copy)]
pub struct FailureLabels<'a> {
    pub endpoint: EndpointLabels<'a>,
    pub category: &'static str,
}

impl FailureLabels<'_> {
    fn to_labels(self) -> [(&'static str, String); 4] {
        let [server, port, transport] = self.endpoint.to_labels();
        [server, port, transport, ("category", self.category.to_string())]
    }
}

/// Register descriptions with the installed recorder.
pub fn describe() {
    metrics::describe_gauge!(names::PORT_AVAILABLE, "1 if the TURN endpoint answered");
    metrics::describe_gauge!(names::AUTH_VALID, "1 if the TURN endpoint accepted the credentials");
    metrics::describe_gauge!(names::DURATION_SECONDS, "Duration of the last check");
    metrics::describe_gauge!(
        names::LAST_CHECK_TIMESTAMP_SECONDS,
        "Unix time of the last check"
    );
    metrics::describe_counter!(names::SUCCESS_TOTAL, "Checks that passed");
    metrics::describe_counter!(names::FAILURE_TOTAL, "Checks that failed by category");
}

/// Publish one check outcome.
pub fn record(result: &TurnCheckResult) {
    let labels = EndpointLabels::new(&result.endpoint);
    let flag = |on: bool| if on { 1.0 } else { 0.0 };

    gauge!(names::PORT_AVAILABLE, &labels.to_labels()).set(flag(result.reachable));
    gauge!(names::AUTH_VALID, &labels.to_labels()).set(flag(result.auth_valid));
    gauge!(names::DURATION_SECONDS, &labels.to_labels()).set(result.duration.as_secs_f64());

    let timestamp = result
        .checked_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    gauge!(names::LAST_CHECK_TIMESTAMP_SECONDS, &labels.to_labels()).set(timestamp);

    match &result.error {
        None => counter!(names::SUCCESS_TOTAL, &labels.to_labels()).increment(1),
        Some(error) => {
            let failure = FailureLabels {
                endpoint: labels,
                category: error.category(),
            };
            counter!(names::FAILURE_TOTAL, &failure.to_labels()).increment(1);
        }
    }
}
