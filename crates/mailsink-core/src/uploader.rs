//! Spool uploader
//!
//! A periodic scanner that replicates committed bodies to the object
//! store. After a successful put it rewrites the metadata atomically with
//! the `object_key`/`uploaded_at` pair; the next scan sees the populated
//! key and skips, which is what makes the uploader effectively
//! exactly-once. Bodies are never deleted here; retention is an operator
//! concern.

use crate::indexer::collect_meta_files;
use crate::metrics::WorkerMetrics;
use crate::spool::write_file_0640;
use async_trait::async_trait;
use chrono::Utc;
use mailsink_common::types::rfc3339_nanos;
use mailsink_common::{Error, Result};
use mailsink_storage::ObjectStore;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncRead;
use tracing::{debug, error, info};

/// The uploader's view of the object store, narrow enough to fake in
/// tests.
#[async_trait]
pub trait ObjectSink: Send + Sync {
    async fn put(
        &self,
        key: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<()>;
}

#[async_trait]
impl ObjectSink for ObjectStore {
    async fn put(
        &self,
        key: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<()> {
        ObjectStore::put(self, key, body, content_type).await
    }
}

pub struct Uploader<O: ObjectSink> {
    store: Arc<O>,
    spool_dir: PathBuf,
    metrics: WorkerMetrics,
}

impl<O: ObjectSink> Uploader<O> {
    pub fn new(store: Arc<O>, spool_dir: impl Into<PathBuf>, metrics: WorkerMetrics) -> Self {
        Self {
            store,
            spool_dir: spool_dir.into(),
            metrics,
        }
    }

    /// Tick forever; never returns.
    pub async fn run(&self, interval: Duration) {
        info!(spool_dir = %self.spool_dir.display(), interval_secs = interval.as_secs(), "uploader started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok((scanned, uploaded)) => {
                    self.metrics.record_run(scanned, uploaded);
                    debug!(scanned, uploaded, "uploader run");
                }
                Err(e) => {
                    self.metrics.record_error();
                    error!(error = %e, "uploader run failed");
                }
            }
        }
    }

    /// One scan over the spool. Returns `(scanned, uploaded)`.
    pub async fn run_once(&self) -> Result<(u64, u64)> {
        let incoming = self.spool_dir.join("incoming");
        let incoming = match fs::canonicalize(&incoming).await {
            Ok(dir) => dir,
            Err(_) => return Ok((0, 0)),
        };

        let mut scanned = 0u64;
        let mut uploaded = 0u64;

        for path in collect_meta_files(&incoming).await? {
            scanned += 1;

            let bytes = fs::read(&path)
                .await
                .map_err(|e| Error::Spool(format!("read meta {}: {}", path.display(), e)))?;
            // Raw JSON so unknown fields survive the rewrite.
            let mut raw: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Spool(format!("parse meta {}: {}", path.display(), e)))?;

            let already_uploaded = raw
                .get("object_key")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|key| !key.is_empty());
            if already_uploaded {
                continue;
            }

            let id = json_str(&raw, "id");
            let domain = json_str(&raw, "domain");
            let mailbox = json_str(&raw, "mailbox");
            let received_at = json_str(&raw, "received_at");

            let eml_path = path.with_extension("eml");
            fs::metadata(&eml_path)
                .await
                .map_err(|e| Error::Spool(format!("stat eml {}: {}", eml_path.display(), e)))?;
            let mut body = fs::File::open(&eml_path)
                .await
                .map_err(|e| Error::Spool(format!("open eml {}: {}", eml_path.display(), e)))?;

            let key = object_key(&domain, &mailbox, &received_at, &id);
            self.store.put(&key, &mut body, "message/rfc822").await?;
            uploaded += 1;

            raw["object_key"] = serde_json::Value::String(key);
            raw["uploaded_at"] = serde_json::Value::String(rfc3339_nanos(Utc::now()));
            let mut out = serde_json::to_vec_pretty(&raw)
                .map_err(|e| Error::Spool(format!("marshal meta {}: {}", path.display(), e)))?;
            out.push(b'\n');

            let tmp = append_tmp(&path);
            write_file_0640(&tmp, &out)
                .await
                .map_err(|e| Error::Spool(format!("write meta tmp {}: {}", tmp.display(), e)))?;
            fs::rename(&tmp, &path)
                .await
                .map_err(|e| Error::Spool(format!("rename meta {}: {}", path.display(), e)))?;
        }

        Ok((scanned, uploaded))
    }
}

fn json_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn append_tmp(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// `<domain>/<mailbox>/<YYYY>/<MM>/<DD>/<id>.eml`, dateless when the
/// metadata timestamp cannot be split.
fn object_key(domain: &str, mailbox: &str, received_at: &str, id: &str) -> String {
    let date = if received_at.len() >= 10 {
        &received_at[..10]
    } else {
        "unknown"
    };
    let parts: Vec<&str> = date.split('-').collect();
    if parts.len() == 3 {
        format!(
            "{}/{}/{}/{}/{}/{}.eml",
            domain, mailbox, parts[0], parts[1], parts[2], id
        )
    } else {
        format!("{}/{}/{}.eml", domain, mailbox, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::spool::{Spool, StoreRequest};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct MemorySink {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        puts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectSink for MemorySink {
        async fn put(
            &self,
            key: &str,
            body: &mut (dyn AsyncRead + Send + Unpin),
            _content_type: &str,
        ) -> Result<()> {
            let mut data = Vec::new();
            body.read_to_end(&mut data)
                .await
                .map_err(|e| Error::ObjectStore(e.to_string()))?;
            self.objects.lock().insert(key.to_string(), data);
            self.puts.lock().push(key.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_upload_once_then_skip() {
        let spool_dir = tempfile::TempDir::new().unwrap();
        let spool = Spool::new(spool_dir.path());
        let res = spool
            .store(
                StoreRequest {
                    max_bytes: 1024,
                    remote_ip: "1.2.3.4".to_string(),
                    mail_from: "from@example.net".to_string(),
                    rcpt_to: vec!["inbound@example.com".to_string()],
                    domain: "example.com".to_string(),
                    mailbox: "inbound".to_string(),
                    received_at: Some(Utc.with_ymd_and_hms(2026, 2, 14, 0, 0, 0).unwrap()),
                    trace_id: None,
                },
                b"Subject: hi\r\n\r\nbody".as_slice(),
            )
            .await
            .unwrap();

        let sink = Arc::new(MemorySink::default());
        let metrics = Metrics::new().unwrap();
        let uploader = Uploader::new(sink.clone(), spool_dir.path(), metrics.uploader);

        assert_eq!(uploader.run_once().await.unwrap(), (1, 1));
        // Second run sees the populated object_key and skips.
        assert_eq!(uploader.run_once().await.unwrap(), (1, 0));
        assert_eq!(sink.puts.lock().len(), 1);

        let expected_key = format!("example.com/inbound/2026/02/14/{}.eml", res.id);
        assert_eq!(
            sink.objects.lock().get(&expected_key).map(Vec::as_slice),
            Some(b"Subject: hi\r\n\r\nbody".as_slice())
        );

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&res.meta_path).unwrap()).unwrap();
        assert_eq!(raw["object_key"], expected_key.as_str());
        assert!(raw["uploaded_at"].as_str().unwrap().ends_with('Z'));
        // The rest of the metadata survives the rewrite.
        assert_eq!(raw["sha256"], res.sha256.as_str());
    }

    #[tokio::test]
    async fn test_missing_body_aborts_run() {
        let spool_dir = tempfile::TempDir::new().unwrap();
        let incoming = spool_dir.path().join("incoming/2026/02/14");
        std::fs::create_dir_all(&incoming).unwrap();
        std::fs::write(
            incoming.join("01NOBODY.json"),
            r#"{"id": "01NOBODY", "domain": "example.com", "mailbox": "inbound", "received_at": "2026-02-14T00:00:00Z"}"#,
        )
        .unwrap();

        let sink = Arc::new(MemorySink::default());
        let metrics = Metrics::new().unwrap();
        let uploader = Uploader::new(sink.clone(), spool_dir.path(), metrics.uploader);

        assert!(uploader.run_once().await.is_err());
        assert!(sink.puts.lock().is_empty());
    }

    #[test]
    fn test_object_key_date_fallback() {
        assert_eq!(
            object_key("example.com", "inbound", "2026-02-14T00:00:00Z", "ID"),
            "example.com/inbound/2026/02/14/ID.eml"
        );
        assert_eq!(
            object_key("example.com", "inbound", "garbage", "ID"),
            "example.com/inbound/ID.eml"
        );
        assert_eq!(
            object_key("example.com", "inbound", "", "ID"),
            "example.com/inbound/ID.eml"
        );
    }
}
