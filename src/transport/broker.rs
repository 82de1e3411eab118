#![forbid(unsafe_code)]

use crate::transport::{Publisher, TransportError};
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};

pub fn payload_to_bytes(topic: &str, payload: &JsonValue) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(payload).map_err(|err| TransportError::Publish {
        topic: topic.to_string(),
        reason: format!("failed to serialise payload: {err}"),
    })
}

/// Publishes through `publisher` and records count and latency per topic.
pub async fn publish_instrumented<P>(
    publisher: &P,
    topic: &str,
    payload: &JsonValue,
) -> Result<(), TransportError>
where
    P: Publisher + ?Sized,
{
    let start = Instant::now();
    let result = publisher.publish(topic, payload).await;
    let status = if result.is_ok() { "success" } else { "error" };
    record_publish_metrics(topic, status, start.elapsed());
    result
}

fn record_publish_metrics(topic: &str, status: &'static str, elapsed: Duration) {
    metrics::counter!(
        "syntised_publish_total",
        "topic" => topic.to_owned(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!("syntised_publish_elapsed_ms", "topic" => topic.to_owned())
        .record(elapsed.as_secs_f64() * 1000.0);
}
