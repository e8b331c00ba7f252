//! Prometheus metrics
//!
//! One registry per process; the counters here are the observable surface
//! of the pipeline (accepted/rejected messages, worker runs, publisher
//! completions). The metrics listener refuses to bind anywhere but
//! localhost.

use chrono::Utc;
use mailsink_common::{Error, Result};
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// SMTP receive path counters and gauges.
#[derive(Clone)]
pub struct SmtpMetrics {
    pub accepted_total: IntCounter,
    pub rejected_total: IntCounterVec,
    pub received_bytes_total: IntCounter,
    pub spool_errors_total: IntCounter,
    pub active_connections: IntGauge,
    pub ratelimit_ip_cache_size: IntGauge,
    pub resolver_domains: IntGauge,
    pub resolver_mailboxes: IntGauge,
    pub published_total: IntCounter,
    pub publish_errors_total: IntCounter,
}

impl SmtpMetrics {
    pub fn inc_accepted(&self, bytes: u64) {
        self.accepted_total.inc();
        self.received_bytes_total.inc_by(bytes);
    }

    pub fn inc_rejected(&self, reason: &str) {
        self.rejected_total.with_label_values(&[reason]).inc();
    }

    pub fn inc_spool_error(&self) {
        self.spool_errors_total.inc();
    }

    pub fn conn_open(&self) {
        self.active_connections.inc();
    }

    pub fn conn_close(&self) {
        self.active_connections.dec();
    }

    /// Completion counters for the event publisher; `n` is the number of
    /// messages in the completed batch.
    pub fn inc_published(&self, n: u64) {
        self.published_total.inc_by(n);
    }

    pub fn inc_publish_errors(&self, n: u64) {
        self.publish_errors_total.inc_by(n);
    }
}

/// Run counters shared by the periodic workers (indexer, uploader) and the
/// bus consumer.
#[derive(Clone)]
pub struct WorkerMetrics {
    pub runs_total: IntCounter,
    pub errors_total: IntCounter,
    pub scanned_total: IntCounter,
    pub processed_total: IntCounter,
    pub last_run_unix: Gauge,
}

impl WorkerMetrics {
    fn new(worker: &str) -> Result<Self> {
        Ok(Self {
            runs_total: IntCounter::new(
                format!("mailsink_{}_runs_total", worker),
                format!("Total {} runs", worker),
            )
            .map_err(metric_error)?,
            errors_total: IntCounter::new(
                format!("mailsink_{}_errors_total", worker),
                format!("Total {} run errors", worker),
            )
            .map_err(metric_error)?,
            scanned_total: IntCounter::new(
                format!("mailsink_{}_scanned_total", worker),
                "Total metadata files scanned".to_string(),
            )
            .map_err(metric_error)?,
            processed_total: IntCounter::new(
                format!("mailsink_{}_processed_total", worker),
                "Total metadata files processed".to_string(),
            )
            .map_err(metric_error)?,
            last_run_unix: Gauge::new(
                format!("mailsink_{}_last_run_unix", worker),
                "Last run time (unix seconds)".to_string(),
            )
            .map_err(metric_error)?,
        })
    }

    pub fn record_run(&self, scanned: u64, processed: u64) {
        self.runs_total.inc();
        self.scanned_total.inc_by(scanned);
        self.processed_total.inc_by(processed);
        self.mark_run();
    }

    pub fn record_error(&self) {
        self.errors_total.inc();
        self.mark_run();
    }

    fn mark_run(&self) {
        self.last_run_unix.set(Utc::now().timestamp() as f64);
    }
}

/// Process-wide metrics registry.
pub struct Metrics {
    pub registry: Registry,
    pub smtp: SmtpMetrics,
    pub indexer: WorkerMetrics,
    pub uploader: WorkerMetrics,
    pub consumer: WorkerMetrics,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let smtp = SmtpMetrics {
            accepted_total: IntCounter::new(
                "mailsink_accepted_total",
                "Total accepted SMTP messages",
            )
            .map_err(metric_error)?,
            rejected_total: IntCounterVec::new(
                Opts::new("mailsink_rejected_total", "Total rejected SMTP commands"),
                &["reason"],
            )
            .map_err(metric_error)?,
            received_bytes_total: IntCounter::new(
                "mailsink_received_bytes_total",
                "Total bytes accepted",
            )
            .map_err(metric_error)?,
            spool_errors_total: IntCounter::new(
                "mailsink_spool_errors_total",
                "Total spool store errors",
            )
            .map_err(metric_error)?,
            active_connections: IntGauge::new(
                "mailsink_active_connections",
                "Current open SMTP connections",
            )
            .map_err(metric_error)?,
            ratelimit_ip_cache_size: IntGauge::new(
                "mailsink_ratelimit_ip_cache_size",
                "Current number of IP limiter entries",
            )
            .map_err(metric_error)?,
            resolver_domains: IntGauge::new(
                "mailsink_resolver_domains",
                "Number of active domains in the resolver snapshot",
            )
            .map_err(metric_error)?,
            resolver_mailboxes: IntGauge::new(
                "mailsink_resolver_mailboxes",
                "Number of active mailboxes in the resolver snapshot",
            )
            .map_err(metric_error)?,
            published_total: IntCounter::new(
                "mailsink_events_published_total",
                "Total ingest events successfully published to the bus",
            )
            .map_err(metric_error)?,
            publish_errors_total: IntCounter::new(
                "mailsink_event_publish_errors_total",
                "Total ingest event publish completions that failed or were dropped",
            )
            .map_err(metric_error)?,
        };

        let indexer = WorkerMetrics::new("indexer")?;
        let uploader = WorkerMetrics::new("uploader")?;
        let consumer = WorkerMetrics::new("consumer")?;

        for collector in [
            Box::new(smtp.accepted_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(smtp.rejected_total.clone()),
            Box::new(smtp.received_bytes_total.clone()),
            Box::new(smtp.spool_errors_total.clone()),
            Box::new(smtp.active_connections.clone()),
            Box::new(smtp.ratelimit_ip_cache_size.clone()),
            Box::new(smtp.resolver_domains.clone()),
            Box::new(smtp.resolver_mailboxes.clone()),
            Box::new(smtp.published_total.clone()),
            Box::new(smtp.publish_errors_total.clone()),
        ] {
            registry.register(collector).map_err(metric_error)?;
        }
        for worker in [&indexer, &uploader, &consumer] {
            for collector in [
                Box::new(worker.runs_total.clone()) as Box<dyn prometheus::core::Collector>,
                Box::new(worker.errors_total.clone()),
                Box::new(worker.scanned_total.clone()),
                Box::new(worker.processed_total.clone()),
                Box::new(worker.last_run_unix.clone()),
            ] {
                registry.register(collector).map_err(metric_error)?;
            }
        }

        Ok(Self {
            registry,
            smtp,
            indexer,
            uploader,
            consumer,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Other(anyhow::anyhow!("metrics: {}", e))
}

/// Refuse listen addresses that would expose the metrics endpoint beyond
/// the local host, including `:port` and `0.0.0.0:port` forms.
pub fn require_localhost(addr: &str) -> Result<()> {
    let Some((host, _port)) = addr.rsplit_once(':') else {
        return Err(Error::Config(format!(
            "invalid listen addr {:?}: missing port",
            addr
        )));
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::Config(format!(
            "invalid listen addr {:?}: host is empty (refusing to bind metrics on all interfaces)",
            addr
        )));
    }
    match host {
        "localhost" | "127.0.0.1" | "::1" => Ok(()),
        _ => Err(Error::Config(format!(
            "invalid listen addr {:?}: host must be localhost/127.0.0.1/::1",
            addr
        ))),
    }
}
