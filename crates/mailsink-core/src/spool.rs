//! Atomic spool
//!
//! Every accepted message becomes a pair of files under
//! `<base>/incoming/YYYY/MM/DD/`: the raw body (`<id>.eml`) and its
//! metadata (`<id>.json`). Both are written to `.tmp` siblings first and
//! renamed body-first, so a visible `.json` always has a complete body
//! whose size and SHA-256 match the metadata. Workers treat the `.json` as
//! the commit marker and ignore bodies without one.

use chrono::{DateTime, Utc};
use mailsink_common::types::{new_ulid, rfc3339_nanos, MessageMeta};
use mailsink_common::{Error, Result};
use sha2::{Digest, Sha256};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::debug;

/// Everything the spool needs to know about one delivery.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Inclusive size limit; a body reaching it is rejected.
    pub max_bytes: u64,
    pub remote_ip: String,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub domain: String,
    pub mailbox: String,
    /// Defaults to now; also selects the date partition.
    pub received_at: Option<DateTime<Utc>>,
    /// Defaults to the allocated message id.
    pub trace_id: Option<String>,
}

/// Outcome of a committed store.
#[derive(Debug, Clone)]
pub struct StoreResult {
    pub id: String,
    pub trace_id: String,
    pub bytes: u64,
    pub sha256: String,
    pub eml_path: PathBuf,
    pub meta_path: PathBuf,
}

/// Filesystem spool rooted at a base directory.
pub struct Spool {
    base_dir: PathBuf,
}

impl Spool {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Stream a body into the spool and commit the `{body, metadata}` pair.
    ///
    /// The body is hashed while it is written, fsynced, and published with
    /// a body-then-metadata rename. Any failure removes the temporary
    /// files; the one exception is a failed metadata rename, which leaves
    /// the body in place for operator reconciliation and surfaces the
    /// error.
    pub async fn store<R>(&self, req: StoreRequest, mut body: R) -> Result<StoreResult>
    where
        R: AsyncRead + Unpin,
    {
        let ts = req.received_at.unwrap_or_else(Utc::now);
        let id = new_ulid(ts);

        let date_dir = self
            .base_dir
            .join("incoming")
            .join(ts.format("%Y/%m/%d").to_string());
        fs::create_dir_all(&date_dir)
            .await
            .map_err(|e| Error::Spool(format!("mkdir {}: {}", date_dir.display(), e)))?;
        let _ = fs::set_permissions(&date_dir, std::fs::Permissions::from_mode(0o750)).await;
        let date_dir = fs::canonicalize(&date_dir)
            .await
            .map_err(|e| Error::Spool(format!("resolve {}: {}", date_dir.display(), e)))?;

        let tmp_eml = date_dir.join(format!("{}.eml.tmp", id));
        let eml_path = date_dir.join(format!("{}.eml", id));
        let tmp_meta = date_dir.join(format!("{}.json.tmp", id));
        let meta_path = date_dir.join(format!("{}.json", id));

        let mut options = fs::OpenOptions::new();
        options.create_new(true).write(true).mode(0o640);
        let file = options
            .open(&tmp_eml)
            .await
            .map_err(|e| Error::Spool(format!("create tmp eml: {}", e)))?;

        let mut writer = BufWriter::with_capacity(32 * 1024, file);
        let mut hasher = Sha256::new();
        let mut remaining = req.max_bytes;
        let mut written: u64 = 0;
        let mut buf = vec![0u8; 32 * 1024];

        let copied: Result<()> = loop {
            // The limit is inclusive: once the budget is spent the body is
            // rejected even if the reader would have hit EOF next.
            if remaining == 0 {
                break Err(Error::TooLarge);
            }
            let cap = buf.len().min(remaining as usize);
            match body.read(&mut buf[..cap]).await {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    hasher.update(&buf[..n]);
                    if let Err(e) = writer.write_all(&buf[..n]).await {
                        break Err(Error::Spool(format!("write body: {}", e)));
                    }
                    written += n as u64;
                    remaining -= n as u64;
                }
                Err(e) => break Err(Error::Spool(format!("read body: {}", e))),
            }
        };

        if let Err(e) = writer.flush().await {
            remove_quiet(&tmp_eml).await;
            return Err(Error::Spool(format!("flush: {}", e)));
        }
        let file = writer.into_inner();
        if let Err(e) = file.sync_all().await {
            remove_quiet(&tmp_eml).await;
            return Err(Error::Spool(format!("fsync: {}", e)));
        }
        drop(file);

        if let Err(e) = copied {
            remove_quiet(&tmp_eml).await;
            return Err(e);
        }

        let trace_id = req
            .trace_id
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| id.clone());
        let sha256 = hex::encode(hasher.finalize());

        let meta = MessageMeta {
            id: id.clone(),
            trace_id: trace_id.clone(),
            received_at: rfc3339_nanos(ts),
            remote_ip: req.remote_ip,
            mail_from: req.mail_from,
            rcpt_to: req.rcpt_to,
            domain: req.domain,
            mailbox: req.mailbox,
            bytes: written,
            sha256: sha256.clone(),
            object_key: String::new(),
            uploaded_at: String::new(),
        };
        let mut meta_bytes = match serde_json::to_vec_pretty(&meta) {
            Ok(b) => b,
            Err(e) => {
                remove_quiet(&tmp_eml).await;
                return Err(Error::Spool(format!("marshal meta: {}", e)));
            }
        };
        meta_bytes.push(b'\n');

        if let Err(e) = write_file_0640(&tmp_meta, &meta_bytes).await {
            remove_quiet(&tmp_eml).await;
            return Err(Error::Spool(format!("write meta: {}", e)));
        }

        // Atomic publish: body first, then the metadata commit marker.
        if let Err(e) = fs::rename(&tmp_eml, &eml_path).await {
            remove_quiet(&tmp_eml).await;
            remove_quiet(&tmp_meta).await;
            return Err(Error::Spool(format!("rename eml: {}", e)));
        }
        if let Err(e) = fs::rename(&tmp_meta, &meta_path).await {
            // Body stays behind; invisible to workers until reconciled.
            remove_quiet(&tmp_meta).await;
            return Err(Error::Spool(format!("rename meta: {}", e)));
        }

        debug!(id = %id, bytes = written, "spooled message");

        Ok(StoreResult {
            id,
            trace_id,
            bytes: written,
            sha256,
            eml_path,
            meta_path,
        })
    }
}

/// Write a spool-adjacent file with the same 0640 mode the spool uses for
/// its own bodies and metadata.
pub(crate) async fn write_file_0640(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.create(true).truncate(true).write(true).mode(0o640);
    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.flush().await
}

async fn remove_quiet(path: &Path) {
    let _ = fs::remove_file(path).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn request(max_bytes: u64) -> StoreRequest {
        StoreRequest {
            max_bytes,
            remote_ip: "1.2.3.4".to_string(),
            mail_from: "from@example.net".to_string(),
            rcpt_to: vec!["inbound@example.com".to_string()],
            domain: "example.com".to_string(),
            mailbox: "inbound".to_string(),
            received_at: Some(Utc.with_ymd_and_hms(2026, 2, 14, 0, 0, 0).unwrap()),
            trace_id: None,
        }
    }

    fn spooled_files(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            if let Ok(entries) = std::fs::read_dir(&d) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else {
                        out.push(path);
                    }
                }
            }
        }
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_store_writes_body_and_meta() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        let body = b"Subject: hi\r\n\r\nbody";

        let res = spool.store(request(1024), body.as_slice()).await.unwrap();

        assert_eq!(res.id.len(), 26);
        assert_eq!(res.trace_id, res.id);
        assert_eq!(res.bytes, body.len() as u64);
        assert!(res.eml_path.ends_with(format!("{}.eml", res.id)));
        assert!(res.eml_path.to_str().unwrap().contains("incoming/2026/02/14"));

        let stored = std::fs::read(&res.eml_path).unwrap();
        assert_eq!(stored, body);

        let meta: MessageMeta =
            serde_json::from_slice(&std::fs::read(&res.meta_path).unwrap()).unwrap();
        assert_eq!(meta.id, res.id);
        assert_eq!(meta.bytes, body.len() as u64);
        assert_eq!(meta.sha256, hex::encode(Sha256::digest(body)));
        assert_eq!(meta.domain, "example.com");
        assert_eq!(meta.mailbox, "inbound");
        assert!(meta.object_key.is_empty());
    }

    #[tokio::test]
    async fn test_store_too_large() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());

        let err = spool
            .store(request(5), b"123456".as_slice())
            .await
            .unwrap_err();
        assert!(err.is_too_large());
        assert!(spooled_files(dir.path()).is_empty(), "no files may remain");
    }

    #[tokio::test]
    async fn test_store_limit_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());

        // A body of exactly max_bytes is rejected; one byte less passes.
        let err = spool
            .store(request(5), b"12345".as_slice())
            .await
            .unwrap_err();
        assert!(err.is_too_large());

        let res = spool.store(request(5), b"1234".as_slice()).await.unwrap();
        assert_eq!(res.bytes, 4);
    }

    #[tokio::test]
    async fn test_store_zero_limit_rejects_everything() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        let err = spool.store(request(0), b"".as_slice()).await.unwrap_err();
        assert!(err.is_too_large());
    }

    #[tokio::test]
    async fn test_store_empty_body() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        let res = spool.store(request(1024), b"".as_slice()).await.unwrap();
        assert_eq!(res.bytes, 0);
        // SHA-256 of the empty input.
        assert_eq!(
            res.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(std::fs::metadata(&res.eml_path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_store_keeps_explicit_trace_id() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path());
        let mut req = request(1024);
        req.trace_id = Some("01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string());

        let res = spool.store(req, b"x".as_slice()).await.unwrap();
        assert_eq!(res.trace_id, "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_ne!(res.trace_id, res.id);
    }
}
