//! Mailsink - mail ingestion service entry point
//!
//! One process runs every role: the SMTP listener, the snapshot reloader,
//! the indexer and uploader workers, the optional bus consumer, the admin
//! API, and the metrics endpoint.
//!
//! Exit codes: 0 clean shutdown, 1 startup I/O or dependency failure,
//! 2 invalid or missing configuration.

use mailsink_api::AppState;
use mailsink_common::config::Config;
use mailsink_core::{
    require_localhost, EventSink, Indexer, IngestConsumer, IpLimiterCache, KafkaEventSink,
    Metrics, SmtpServer, SnapshotLoader, Spool, Uploader,
};
use mailsink_storage::{IndexDb, ObjectStore};
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            exit(2);
        }
    };
    if let Err(e) = require_localhost(&config.metrics_listen) {
        error!(addr = %config.metrics_listen, error = %e, "invalid METRICS_LISTEN");
        exit(2);
    }

    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!(error = %e, "metrics init failed");
            exit(1);
        }
    };

    // The process must not start serving without a valid snapshot; at
    // runtime, reload failures keep the previous one.
    let resolver = Arc::new(SnapshotLoader::new(&config.snapshot_path));
    match resolver.load() {
        Ok(stats) => {
            info!(
                path = %config.snapshot_path.display(),
                domains = stats.domains,
                mailboxes = stats.mailboxes,
                "snapshot loaded"
            );
        }
        Err(e) => {
            error!(path = %config.snapshot_path.display(), error = %e, "failed to load snapshot");
            exit(1);
        }
    }

    let db = match IndexDb::open(&config.index_db).await {
        Ok(db) => db,
        Err(e) => {
            error!(path = %config.index_db.display(), error = %e, "index open failed");
            exit(1);
        }
    };

    let object_store = match &config.object_store {
        Some(store_config) => {
            let store = match ObjectStore::new(store_config) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!(error = %e, "object store init failed");
                    exit(1);
                }
            };
            if let Err(e) = store.ensure_bucket().await {
                error!(error = %e, "ensure bucket failed");
                exit(1);
            }
            Some(store)
        }
        None => None,
    };

    let events: Option<Arc<dyn EventSink>> = match &config.kafka {
        Some(kafka) => match KafkaEventSink::start(kafka, metrics.smtp.clone()) {
            Ok(sink) => Some(sink),
            Err(e) => {
                error!(error = %e, "event publisher init failed");
                exit(1);
            }
        },
        None => None,
    };

    let limiter = Arc::new(IpLimiterCache::default());
    let spool = Arc::new(Spool::new(&config.spool_dir));

    let mut workers = Vec::new();

    // Metrics endpoint, localhost only.
    {
        let listener = match tokio::net::TcpListener::bind(&config.metrics_listen).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %config.metrics_listen, error = %e, "metrics bind failed");
                exit(1);
            }
        };
        info!(addr = %config.metrics_listen, "metrics listening");
        let render_metrics = metrics.clone();
        let app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let metrics = render_metrics.clone();
                async move { metrics.render() }
            }),
        );
        workers.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "metrics server error");
            }
        }));
    }

    // Snapshot reload loop; also refreshes the resolver and limiter gauges.
    {
        let resolver = resolver.clone();
        let metrics = metrics.clone();
        let limiter = limiter.clone();
        let interval = config.snapshot_reload_interval;
        workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match resolver.load() {
                    Ok(stats) => {
                        metrics.smtp.resolver_domains.set(stats.domains as i64);
                        metrics.smtp.resolver_mailboxes.set(stats.mailboxes as i64);
                    }
                    Err(e) => warn!(error = %e, "snapshot reload failed"),
                }
                metrics.smtp.ratelimit_ip_cache_size.set(limiter.len() as i64);
            }
        }));
    }

    // Indexer worker.
    {
        let indexer = Indexer::new(db.clone(), config.spool_dir.clone(), metrics.indexer.clone());
        let interval = config.index_interval;
        workers.push(tokio::spawn(async move { indexer.run(interval).await }));
    }

    // Uploader worker, only when an object store is configured.
    if let Some(store) = object_store.clone() {
        let uploader = Uploader::new(store, config.spool_dir.clone(), metrics.uploader.clone());
        let interval = config.upload_interval;
        workers.push(tokio::spawn(async move { uploader.run(interval).await }));
    }

    // Bus consumer, only when a consumer group is configured.
    if let Some(kafka) = &config.kafka {
        if let Some(group_id) = &kafka.group_id {
            let consumer =
                match IngestConsumer::new(kafka, group_id, db.clone(), metrics.consumer.clone()) {
                    Ok(consumer) => consumer,
                    Err(e) => {
                        error!(error = %e, "bus consumer init failed");
                        exit(1);
                    }
                };
            workers.push(tokio::spawn(async move { consumer.run().await }));
        }
    }

    // Admin API.
    {
        let listener = match tokio::net::TcpListener::bind(&config.admin.listen).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %config.admin.listen, error = %e, "admin bind failed");
                exit(1);
            }
        };
        info!(addr = %config.admin.listen, "admin api listening");
        let state = Arc::new(AppState {
            db: db.clone(),
            object_store: object_store.clone(),
            api_key: config.admin.api_key.clone(),
        });
        let app = mailsink_api::create_router(state);
        workers.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "admin server error");
            }
        }));
    }

    // SMTP server runs in the foreground; a listener failure is fatal.
    let smtp_server = match SmtpServer::new(
        config.smtp.clone(),
        resolver.clone(),
        spool,
        limiter.clone(),
        events,
        metrics.smtp.clone(),
    ) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "smtp server init failed");
            exit(1);
        }
    };

    tokio::select! {
        result = smtp_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "smtp server stopped");
                for worker in &workers {
                    worker.abort();
                }
                exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    for worker in &workers {
        worker.abort();
    }

    info!("mailsink shutdown complete");
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mailsink=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
