//! Common types for mailsink

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};

/// Email address split into local part and domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let (local, domain) = s.split_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self::new(local, domain))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Config("invalid email address".to_string()))
    }
}

/// Spool metadata record, the commit marker of one accepted message.
///
/// Serialized pretty-printed as the `.json` sibling of the raw body. The
/// `object_key`/`uploaded_at` pair only appears after the uploader has
/// replicated the body to the object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: String,
    pub trace_id: String,
    pub received_at: String,
    pub remote_ip: String,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub domain: String,
    pub mailbox: String,
    pub bytes: u64,
    pub sha256: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object_key: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uploaded_at: String,
}

static ULID_GENERATOR: Lazy<Mutex<Generator>> = Lazy::new(|| Mutex::new(Generator::new()));

/// Allocate a 26-character lexicographically sortable identifier.
///
/// Monotonic within a millisecond through a process-wide generator; falls
/// back to fresh randomness if the monotonic counter overflows.
pub fn new_ulid(at: DateTime<Utc>) -> String {
    let mut generator = ULID_GENERATOR.lock();
    match generator.generate_from_datetime(at.into()) {
        Ok(id) => id.to_string(),
        Err(_) => Ulid::from_datetime(at.into()).to_string(),
    }
}

/// Format a timestamp the way every record in the system stores it:
/// RFC3339 with nanoseconds, UTC.
pub fn rfc3339_nanos(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_address_parse() {
        let email = EmailAddress::parse("user@example.com").unwrap();
        assert_eq!(email.local, "user");
        assert_eq!(email.domain, "example.com");
        assert_eq!(email.to_string(), "user@example.com");
    }

    #[test]
    fn test_email_address_invalid() {
        assert!(EmailAddress::parse("invalid").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
        assert!(EmailAddress::parse("user@").is_none());
    }

    #[test]
    fn test_ulid_shape_and_ordering() {
        let at = Utc::now();
        let a = new_ulid(at);
        let b = new_ulid(at);
        assert_eq!(a.len(), 26);
        assert_eq!(b.len(), 26);
        assert!(a < b, "ids within one millisecond must be monotonic");
    }

    #[test]
    fn test_meta_roundtrip_skips_empty_upload_fields() {
        let meta = MessageMeta {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            trace_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            received_at: "2026-02-14T00:00:00Z".to_string(),
            remote_ip: "1.2.3.4".to_string(),
            mail_from: "from@example.net".to_string(),
            rcpt_to: vec!["inbound@example.com".to_string()],
            domain: "example.com".to_string(),
            mailbox: "inbound".to_string(),
            bytes: 19,
            sha256: "ab".repeat(32),
            object_key: String::new(),
            uploaded_at: String::new(),
        };
        let json = serde_json::to_string_pretty(&meta).unwrap();
        assert!(!json.contains("object_key"));
        let parsed: MessageMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, meta.id);
        assert_eq!(parsed.object_key, "");
    }
}
