//! Mailsink core - the mail ingestion pipeline
//!
//! This crate carries the three load-bearing subsystems: the SMTP receive
//! path (session state machine, rate limiting, recipient resolution), the
//! atomic on-disk spool, and the follow-on workers (indexer, uploader, bus
//! consumer) that drain the spool into the index and object store.

pub mod consumer;
pub mod events;
pub mod indexer;
pub mod metrics;
pub mod ratelimit;
pub mod resolver;
pub mod smtp;
pub mod spool;
pub mod uploader;

pub use consumer::IngestConsumer;
pub use events::{EventSink, IngestEvent, KafkaEventSink};
pub use indexer::Indexer;
pub use metrics::{require_localhost, Metrics};
pub use ratelimit::IpLimiterCache;
pub use resolver::{Resolver, Snapshot, SnapshotLoader};
pub use smtp::SmtpServer;
pub use spool::{Spool, StoreRequest, StoreResult};
pub use uploader::{ObjectSink, Uploader};
