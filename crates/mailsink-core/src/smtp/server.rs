//! SMTP server
//!
//! Accepts connections on the configured address and hands each one to a
//! session task. Admission is bounded by a semaphore: at `max_conns` open
//! sessions the accept loop parks until a session finishes, and the permit
//! is released exactly once when the task ends.

use crate::events::EventSink;
use crate::metrics::SmtpMetrics;
use crate::ratelimit::IpLimiterCache;
use crate::resolver::SnapshotLoader;
use crate::smtp::session::SmtpSession;
use crate::smtp::tls::create_tls_acceptor;
use crate::spool::Spool;
use mailsink_common::config::SmtpConfig;
use mailsink_common::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

pub struct SmtpServer {
    config: SmtpConfig,
    resolver: Arc<SnapshotLoader>,
    spool: Arc<Spool>,
    limiter: Arc<IpLimiterCache>,
    events: Option<Arc<dyn EventSink>>,
    metrics: SmtpMetrics,
    tls: Option<TlsAcceptor>,
}

impl SmtpServer {
    pub fn new(
        config: SmtpConfig,
        resolver: Arc<SnapshotLoader>,
        spool: Arc<Spool>,
        limiter: Arc<IpLimiterCache>,
        events: Option<Arc<dyn EventSink>>,
        metrics: SmtpMetrics,
    ) -> Result<Self> {
        let tls = match (&config.tls_cert_file, &config.tls_key_file) {
            (Some(cert), Some(key)) => Some(create_tls_acceptor(cert, key)?),
            _ => None,
        };
        Ok(Self {
            config,
            resolver,
            spool,
            limiter,
            events,
            metrics,
            tls,
        })
    }

    /// Run the accept loop forever.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        let semaphore = Arc::new(Semaphore::new(self.config.max_conns));

        info!(
            addr = %self.config.listen,
            max_msg_bytes = self.config.max_msg_bytes,
            max_conns = self.config.max_conns,
            starttls = self.tls.is_some(),
            "smtp server listening"
        );

        loop {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                return Ok(());
            };

            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let session = SmtpSession {
                        config: self.config.clone(),
                        resolver: self.resolver.clone(),
                        spool: self.spool.clone(),
                        limiter: self.limiter.clone(),
                        events: self.events.clone(),
                        metrics: self.metrics.clone(),
                        tls: self.tls.clone(),
                        remote_ip: peer_addr.ip().to_string(),
                    };

                    self.metrics.conn_open();
                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session.handle(stream).await {
                            debug!(remote_ip = %peer_addr.ip(), error = %e, "smtp session ended with error");
                        }
                        metrics.conn_close();
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    drop(permit);
                }
            }
        }
    }
}
