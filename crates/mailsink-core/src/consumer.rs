//! Bus consumer
//!
//! The optional second path from ingest to index: consumes ingest events
//! from the bus and upserts them into the message table. Both this and the
//! spool-scanning indexer are idempotent, so running them side by side is
//! safe.

use crate::events::IngestEvent;
use crate::metrics::WorkerMetrics;
use mailsink_common::config::KafkaConfig;
use mailsink_common::{Error, Result};
use mailsink_storage::{IndexDb, MessageRow};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct IngestConsumer {
    consumer: StreamConsumer,
    db: IndexDb,
    metrics: WorkerMetrics,
}

impl IngestConsumer {
    pub fn new(
        config: &KafkaConfig,
        group_id: &str,
        db: IndexDb,
        metrics: WorkerMetrics,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| Error::Publish(format!("create consumer: {}", e)))?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| Error::Publish(format!("subscribe {}: {}", config.topic, e)))?;

        info!(topic = %config.topic, group = %group_id, "bus consumer started");

        Ok(Self {
            consumer,
            db,
            metrics,
        })
    }

    pub async fn run(&self) {
        loop {
            let message = match self.consumer.recv().await {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, "bus fetch failed");
                    self.metrics.record_error();
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            let Some(payload) = message.payload() else {
                continue;
            };
            let event: IngestEvent = match serde_json::from_slice(payload) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable ingest event");
                    self.metrics.record_error();
                    continue;
                }
            };

            if let Err(e) = self.db.upsert_message(&message_row(&event)).await {
                error!(error = %e, id = %event.id, "index upsert failed");
                self.metrics.record_error();
                continue;
            }
            self.metrics.record_run(1, 1);
        }
    }
}

fn message_row(event: &IngestEvent) -> MessageRow {
    let rcpt_to_json =
        serde_json::to_string(&event.rcpt_to).unwrap_or_else(|_| "[]".to_string());
    MessageRow {
        id: event.id.clone(),
        trace_id: event.trace_id.clone(),
        received_at: event.received_at.clone(),
        remote_ip: event.remote_ip.clone(),
        domain: event.domain.clone(),
        mailbox: event.mailbox.clone(),
        mail_from: event.mail_from.clone(),
        rcpt_to_json,
        bytes: event.bytes as i64,
        sha256: event.sha256.clone(),
        eml_path: event.eml_path.clone(),
        meta_path: event.meta_path.clone(),
        object_key: String::new(),
    }
}
