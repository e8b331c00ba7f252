//! Configuration for mailsink
//!
//! All knobs come from the environment so the same binary can run as a
//! container with nothing but variables, matching how the service is
//! deployed.

use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    /// SMTP receive path configuration
    pub smtp: SmtpConfig,

    /// Path to the domain allowlist snapshot JSON
    pub snapshot_path: PathBuf,

    /// Base directory of the on-disk spool
    pub spool_dir: PathBuf,

    /// Path of the SQLite index database
    pub index_db: PathBuf,

    /// Event bus configuration; absent when no brokers are set
    pub kafka: Option<KafkaConfig>,

    /// Object store configuration; absent when no endpoint is set
    pub object_store: Option<ObjectStoreConfig>,

    /// Listen address for the Prometheus text endpoint (localhost only)
    pub metrics_listen: String,

    /// Admin API configuration
    pub admin: AdminConfig,

    /// Indexer scan interval
    pub index_interval: Duration,

    /// Uploader scan interval
    pub upload_interval: Duration,

    /// Snapshot reload interval
    pub snapshot_reload_interval: Duration,
}

/// SMTP server configuration
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Bind address
    pub listen: String,

    /// Hard cap on a single message body in bytes
    pub max_msg_bytes: u64,

    /// Maximum concurrent connections
    pub max_conns: usize,

    /// Maximum recipients per message
    pub max_rcpt_count: usize,

    /// Per-connection read timeout
    pub read_timeout: Duration,

    /// Per-connection write timeout
    pub write_timeout: Duration,

    /// TLS keypair; STARTTLS is advertised when both are set
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2525".to_string(),
            max_msg_bytes: 20 * 1024 * 1024,
            max_conns: 2000,
            max_rcpt_count: 50,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            tls_cert_file: None,
            tls_key_file: None,
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Broker list
    pub brokers: Vec<String>,

    /// Ingest topic
    pub topic: String,

    /// Consumer group; the bus consumer only runs when this is set
    pub group_id: Option<String>,
}

/// Object store configuration (MinIO or any S3-compatible endpoint)
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub secure: bool,
}

/// Admin API configuration
#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Bind address; localhost by default
    pub listen: String,

    /// Shared secret for the X-Admin-Key header; unset means open
    pub api_key: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            api_key: None,
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let smtp = SmtpConfig {
            listen: getenv("SMTP_LISTEN", "0.0.0.0:2525"),
            max_msg_bytes: getenv_u64("MAX_MSG_BYTES", 20 * 1024 * 1024)?,
            max_conns: getenv_u64("MAX_CONNS", 2000)? as usize,
            max_rcpt_count: getenv_u64("MAX_RCPT_COUNT", 50)? as usize,
            tls_cert_file: getenv_opt("TLS_CERT_FILE").map(PathBuf::from),
            tls_key_file: getenv_opt("TLS_KEY_FILE").map(PathBuf::from),
            ..SmtpConfig::default()
        };
        if smtp.tls_cert_file.is_some() != smtp.tls_key_file.is_some() {
            return Err(Error::Config(
                "TLS_CERT_FILE and TLS_KEY_FILE must be set together".to_string(),
            ));
        }

        let kafka = getenv_opt("KAFKA_BROKERS").map(|brokers| KafkaConfig {
            brokers: brokers
                .split([',', ' '])
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            topic: getenv("KAFKA_TOPIC", "mail.ingest.v1"),
            group_id: getenv_opt("KAFKA_GROUP"),
        });

        let object_store = match getenv_opt("MINIO_ENDPOINT") {
            Some(endpoint) => Some(ObjectStoreConfig {
                endpoint,
                access_key: require("MINIO_ACCESS_KEY")?,
                secret_key: require("MINIO_SECRET_KEY")?,
                bucket: require("MINIO_BUCKET")?,
                secure: getenv("MINIO_SECURE", "false") == "true",
            }),
            None => None,
        };

        Ok(Self {
            smtp,
            snapshot_path: PathBuf::from(getenv("SNAPSHOT_PATH", "./data/snapshot.json")),
            spool_dir: PathBuf::from(getenv("SPOOL_DIR", "./data/spool")),
            index_db: PathBuf::from(getenv("INDEX_DB", "./data/index.db")),
            kafka,
            object_store,
            metrics_listen: getenv("METRICS_LISTEN", "127.0.0.1:9090"),
            admin: AdminConfig {
                listen: getenv("ADMIN_LISTEN", "127.0.0.1:8080"),
                api_key: getenv_opt("ADMIN_API_KEY"),
            },
            index_interval: getenv_secs("INDEX_INTERVAL", 2)?,
            upload_interval: getenv_secs("UPLOAD_INTERVAL", 2)?,
            snapshot_reload_interval: Duration::from_secs(2),
        })
    }
}

fn getenv(key: &str, default: &str) -> String {
    getenv_opt(key).unwrap_or_else(|| default.to_string())
}

fn getenv_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn require(key: &str) -> Result<String> {
    getenv_opt(key).ok_or_else(|| Error::Config(format!("{} is required", key)))
}

fn getenv_u64(key: &str, default: u64) -> Result<u64> {
    match getenv_opt(key) {
        Some(v) => v
            .parse::<u64>()
            .map_err(|e| Error::Config(format!("invalid {}: {}", key, e))),
        None => Ok(default),
    }
}

fn getenv_secs(key: &str, default: u64) -> Result<Duration> {
    getenv_u64(key, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smtp_defaults() {
        let smtp = SmtpConfig::default();
        assert_eq!(smtp.listen, "0.0.0.0:2525");
        assert_eq!(smtp.max_msg_bytes, 20 * 1024 * 1024);
        assert_eq!(smtp.max_conns, 2000);
        assert_eq!(smtp.max_rcpt_count, 50);
    }

    #[test]
    fn test_admin_defaults() {
        let admin = AdminConfig::default();
        assert_eq!(admin.listen, "127.0.0.1:8080");
        assert!(admin.api_key.is_none());
    }
}
