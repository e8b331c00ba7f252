//! Spool indexer
//!
//! A periodic scanner that drains committed spool metadata into the index
//! database. Every run walks `<spool>/incoming/**/*.json`, upserting the
//! message row and an `ingest.received` event row per file. The first file
//! error aborts the run; the next tick retries and the upserts are
//! idempotent, so no progress is lost.

use crate::metrics::WorkerMetrics;
use mailsink_common::types::MessageMeta;
use mailsink_common::{Error, Result};
use mailsink_storage::{EventRow, IndexDb, MessageRow};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info};

pub struct Indexer {
    db: IndexDb,
    spool_dir: PathBuf,
    metrics: WorkerMetrics,
}

impl Indexer {
    pub fn new(db: IndexDb, spool_dir: impl Into<PathBuf>, metrics: WorkerMetrics) -> Self {
        Self {
            db,
            spool_dir: spool_dir.into(),
            metrics,
        }
    }

    /// Tick forever; never returns.
    pub async fn run(&self, interval: Duration) {
        info!(spool_dir = %self.spool_dir.display(), interval_secs = interval.as_secs(), "indexer started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok((scanned, indexed)) => {
                    self.metrics.record_run(scanned, indexed);
                    debug!(scanned, indexed, "indexer run");
                }
                Err(e) => {
                    self.metrics.record_error();
                    error!(error = %e, "indexer run failed");
                }
            }
        }
    }

    /// One scan over the spool. Returns `(scanned, indexed)`.
    pub async fn run_once(&self) -> Result<(u64, u64)> {
        let incoming = self.spool_dir.join("incoming");
        // A spool that has not seen a message yet is not an error.
        let incoming = match fs::canonicalize(&incoming).await {
            Ok(dir) => dir,
            Err(_) => return Ok((0, 0)),
        };

        let mut scanned = 0u64;
        let mut indexed = 0u64;

        for path in collect_meta_files(&incoming).await? {
            scanned += 1;

            let bytes = fs::read(&path)
                .await
                .map_err(|e| Error::Spool(format!("read meta {}: {}", path.display(), e)))?;
            let meta: MessageMeta = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Spool(format!("parse meta {}: {}", path.display(), e)))?;

            let eml_path = path.with_extension("eml");
            let rcpt_to_json =
                serde_json::to_string(&meta.rcpt_to).unwrap_or_else(|_| "[]".to_string());

            self.db
                .upsert_message(&MessageRow {
                    id: meta.id.clone(),
                    trace_id: meta.trace_id.clone(),
                    received_at: meta.received_at.clone(),
                    remote_ip: meta.remote_ip.clone(),
                    domain: meta.domain.clone(),
                    mailbox: meta.mailbox.clone(),
                    mail_from: meta.mail_from.clone(),
                    rcpt_to_json,
                    bytes: meta.bytes as i64,
                    sha256: meta.sha256.clone(),
                    eml_path: eml_path.display().to_string(),
                    meta_path: path.display().to_string(),
                    object_key: meta.object_key.clone(),
                })
                .await?;

            let payload = serde_json::json!({
                "meta_path": path.display().to_string(),
                "eml_path": eml_path.display().to_string(),
                "object_key": meta.object_key,
            });
            self.db
                .upsert_event(&EventRow {
                    key: format!("ingest.received:{}", meta.id),
                    trace_id: meta.trace_id.clone(),
                    message_id: meta.id.clone(),
                    event_type: "ingest.received".to_string(),
                    occurred_at: meta.received_at.clone(),
                    payload_json: payload.to_string(),
                })
                .await?;

            indexed += 1;
        }

        Ok((scanned, indexed))
    }
}

/// Walk a directory tree collecting `.json` files in lexical order.
/// Temporary `.json.tmp` siblings never match.
pub(crate) async fn collect_meta_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut reader = fs::read_dir(&dir)
            .await
            .map_err(|e| Error::Spool(format!("read dir {}: {}", dir.display(), e)))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| Error::Spool(format!("read dir {}: {}", dir.display(), e)))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| Error::Spool(format!("stat {}: {}", path.display(), e)))?;
            if file_type.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                out.push(path);
            }
        }
    }

    out.sort();
    Ok(out)
}
