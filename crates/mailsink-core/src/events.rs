//! Ingest event publishing
//!
//! Accepted messages produce a best-effort event on the bus. The SMTP hot
//! path must never wait on bus health: `publish` hands the event to a
//! bounded in-process queue and returns immediately; a drain task gathers
//! whatever is queued into a batch, fans the sends out concurrently with a
//! hard per-event deadline, and moves the published/error counters once
//! per batch completion. When the queue is full the event is dropped and
//! counted.

use crate::metrics::SmtpMetrics;
use futures::future::join_all;
use mailsink_common::config::KafkaConfig;
use mailsink_common::{Error, Result};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Per-event publish deadline.
const PUBLISH_TIMEOUT: Duration = Duration::from_millis(800);

/// Bounded depth of the in-process handoff queue.
const QUEUE_DEPTH: usize = 1024;

/// Most events drained into one publish completion.
const MAX_BATCH: usize = 100;

/// One accepted message, as seen on the bus. Mirrors the spool metadata
/// plus the spool file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    pub id: String,
    pub trace_id: String,
    pub received_at: String,
    pub remote_ip: String,
    pub domain: String,
    pub mailbox: String,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub bytes: u64,
    pub sha256: String,
    pub meta_path: String,
    pub eml_path: String,
}

impl IngestEvent {
    /// Messages for one mailbox land on one partition.
    pub fn partition_key(&self) -> String {
        format!("{}/{}", self.domain, self.mailbox)
    }
}

/// Non-blocking sink for ingest events. The SMTP session fires and
/// forgets; delivery is at-least-once and the index upserts make
/// duplicates harmless.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: IngestEvent);
}

/// Kafka-backed sink.
pub struct KafkaEventSink {
    tx: mpsc::Sender<IngestEvent>,
    metrics: SmtpMetrics,
}

impl KafkaEventSink {
    /// Create the producer and spawn the drain task.
    pub fn start(config: &KafkaConfig, metrics: SmtpMetrics) -> Result<Arc<Self>> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("message.timeout.ms", PUBLISH_TIMEOUT.as_millis().to_string())
            .create()
            .map_err(|e| Error::Publish(format!("create producer: {}", e)))?;

        let (tx, mut rx) = mpsc::channel::<IngestEvent>(QUEUE_DEPTH);
        let topic = config.topic.clone();
        let drain_metrics = metrics.clone();

        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                // Gather everything already queued into one batch.
                let mut batch = vec![first];
                while batch.len() < MAX_BATCH {
                    match rx.try_recv() {
                        Ok(event) => batch.push(event),
                        Err(_) => break,
                    }
                }

                let mut encode_errors = 0u64;
                let mut outgoing = Vec::with_capacity(batch.len());
                for event in &batch {
                    match serde_json::to_vec(event) {
                        Ok(payload) => {
                            outgoing.push((event.id.clone(), event.partition_key(), payload))
                        }
                        Err(e) => {
                            warn!(error = %e, id = %event.id, "encode ingest event failed");
                            encode_errors += 1;
                        }
                    }
                }

                let sends = outgoing.iter().map(|(_, key, payload)| {
                    producer.send(
                        FutureRecord::to(&topic).key(key).payload(payload),
                        Timeout::After(PUBLISH_TIMEOUT),
                    )
                });
                let results = join_all(sends).await;

                // Batched completion: counters move once per batch by the
                // success and failure counts, not per ack.
                let mut published = 0u64;
                let mut failed = encode_errors;
                for ((id, _, _), result) in outgoing.iter().zip(&results) {
                    match result {
                        Ok(_) => published += 1,
                        Err((e, _)) => {
                            warn!(error = %e, id = %id, "event publish failed");
                            failed += 1;
                        }
                    }
                }
                if published > 0 {
                    drain_metrics.inc_published(published);
                }
                if failed > 0 {
                    drain_metrics.inc_publish_errors(failed);
                }
            }
        });

        info!(brokers = %config.brokers.join(","), topic = %config.topic, "event publisher started");

        Ok(Arc::new(Self { tx, metrics }))
    }
}

impl EventSink for KafkaEventSink {
    fn publish(&self, event: IngestEvent) {
        if let Err(e) = self.tx.try_send(event) {
            // Queue full or drain task gone; drop rather than block the
            // SMTP 250.
            warn!(error = %e, "event queue overflow, dropping ingest event");
            self.metrics.inc_publish_errors(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key() {
        let event = IngestEvent {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            trace_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            received_at: "2026-02-14T00:00:00Z".to_string(),
            remote_ip: "1.2.3.4".to_string(),
            domain: "example.com".to_string(),
            mailbox: "inbound".to_string(),
            mail_from: "from@example.net".to_string(),
            rcpt_to: vec!["inbound@example.com".to_string()],
            bytes: 19,
            sha256: "ab".repeat(32),
            meta_path: "/spool/x.json".to_string(),
            eml_path: "/spool/x.eml".to_string(),
        };
        assert_eq!(event.partition_key(), "example.com/inbound");
    }
}
