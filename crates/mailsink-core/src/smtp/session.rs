//! SMTP session handler
//!
//! One session per connection, driven as an explicit state machine:
//!
//! ```text
//! Init -- EHLO/HELO -> Ready -- MAIL -> HaveMail -- RCPT -> HaveRcpt -- DATA -> Ready
//! ```
//!
//! `RSET` returns to `Ready` from anywhere, `QUIT` closes. The session
//! always answers with an SMTP code; errors never escape a command arm
//! except when the transport itself is gone.

use crate::events::{EventSink, IngestEvent};
use crate::metrics::SmtpMetrics;
use crate::ratelimit::IpLimiterCache;
use crate::resolver::SnapshotLoader;
use crate::spool::{Spool, StoreRequest};
use chrono::Utc;
use mailsink_common::config::SmtpConfig;
use mailsink_common::types::{new_ulid, rfc3339_nanos, EmailAddress};
use mailsink_common::{Error, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const SERVER_NAME: &str = "mailsink";

/// SMTP session state
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    Init,
    Ready,
    HaveMail,
    HaveRcpt,
}

#[derive(Debug, Default)]
struct Envelope {
    mail_from: String,
    rcpt_to: Vec<String>,
    /// Routing pair pinned by the first accepted recipient.
    domain: String,
    mailbox: String,
}

impl Envelope {
    fn clear(&mut self) {
        self.mail_from.clear();
        self.rcpt_to.clear();
        self.domain.clear();
        self.mailbox.clear();
    }
}

enum LoopExit<S> {
    Closed,
    StartTls(S),
}

/// One SMTP session.
pub struct SmtpSession {
    pub(crate) config: SmtpConfig,
    pub(crate) resolver: Arc<SnapshotLoader>,
    pub(crate) spool: Arc<Spool>,
    pub(crate) limiter: Arc<IpLimiterCache>,
    pub(crate) events: Option<Arc<dyn EventSink>>,
    pub(crate) metrics: SmtpMetrics,
    pub(crate) tls: Option<TlsAcceptor>,
    pub(crate) remote_ip: String,
}

impl SmtpSession {
    /// Drive the session to completion, upgrading to TLS in place when the
    /// client negotiates STARTTLS.
    pub async fn handle<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !self.limiter.allow(&self.remote_ip, Instant::now()) {
            self.metrics.inc_rejected("rate_limited");
            debug!(remote_ip = %self.remote_ip, "session rejected by rate limiter");
            let mut stream = BufStream::new(stream);
            let _ = self
                .write_line(&mut stream, "421 4.7.0 rate limited, try again later")
                .await;
            return Ok(());
        }

        match self.run(BufStream::new(stream), false).await? {
            LoopExit::Closed => Ok(()),
            LoopExit::StartTls(stream) => {
                let Some(acceptor) = self.tls.clone() else {
                    return Ok(());
                };
                let tls_stream = acceptor.accept(stream).await?;
                self.run(BufStream::new(tls_stream), true).await?;
                Ok(())
            }
        }
    }

    async fn run<S>(&self, mut stream: BufStream<S>, tls_active: bool) -> Result<LoopExit<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut state = SessionState::Init;
        let mut envelope = Envelope::default();

        if !tls_active {
            self.write_line(&mut stream, &format!("220 {} ESMTP service ready", SERVER_NAME))
                .await?;
        }

        let mut line = String::new();
        loop {
            line.clear();
            let n = self.read_line(&mut stream, &mut line).await?;
            if n == 0 {
                debug!(remote_ip = %self.remote_ip, "client disconnected");
                return Ok(LoopExit::Closed);
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            let (command, args) = parse_command(trimmed);
            debug!(remote_ip = %self.remote_ip, command = %command, "smtp command");

            match command.to_uppercase().as_str() {
                "HELO" => {
                    state = SessionState::Ready;
                    envelope.clear();
                    self.write_line(&mut stream, &format!("250 {} Hello {}", SERVER_NAME, args.trim()))
                        .await?;
                }

                "EHLO" => {
                    state = SessionState::Ready;
                    envelope.clear();

                    let mut extensions = vec![
                        format!("{} Hello {}", SERVER_NAME, args.trim()),
                        format!("SIZE {}", self.config.max_msg_bytes),
                        "8BITMIME".to_string(),
                        "PIPELINING".to_string(),
                        "ENHANCEDSTATUSCODES".to_string(),
                    ];
                    if self.tls.is_some() && !tls_active {
                        extensions.push("STARTTLS".to_string());
                    }
                    for (i, ext) in extensions.iter().enumerate() {
                        let sep = if i == extensions.len() - 1 { ' ' } else { '-' };
                        self.write_line(&mut stream, &format!("250{}{}", sep, ext))
                            .await?;
                    }
                }

                "STARTTLS" => {
                    if self.tls.is_none() || tls_active {
                        self.write_line(&mut stream, "502 5.5.1 STARTTLS not supported")
                            .await?;
                        continue;
                    }
                    self.write_line(&mut stream, "220 2.0.0 ready to start TLS")
                        .await?;
                    return Ok(LoopExit::StartTls(stream.into_inner()));
                }

                "AUTH" => {
                    self.write_line(&mut stream, "502 5.5.1 authentication not supported")
                        .await?;
                }

                "MAIL" => {
                    if state != SessionState::Ready {
                        self.write_line(&mut stream, "503 5.5.1 bad sequence of commands")
                            .await?;
                        continue;
                    }
                    match parse_mail_from(args) {
                        Some(sender) => {
                            // Empty reverse-path is fine (bounces).
                            envelope.mail_from = sender
                                .map(|a| a.to_string().to_lowercase())
                                .unwrap_or_default();
                            state = SessionState::HaveMail;
                            self.write_line(&mut stream, "250 2.1.0 OK").await?;
                        }
                        None => {
                            self.write_line(&mut stream, "501 5.1.7 bad sender address syntax")
                                .await?;
                        }
                    }
                }

                "RCPT" => {
                    if state != SessionState::HaveMail && state != SessionState::HaveRcpt {
                        self.write_line(&mut stream, "503 5.5.1 bad sequence of commands")
                            .await?;
                        continue;
                    }
                    if envelope.rcpt_to.len() >= self.config.max_rcpt_count {
                        self.metrics.inc_rejected("too_many_rcpt");
                        self.write_line(&mut stream, "452 4.5.3 too many recipients")
                            .await?;
                        continue;
                    }
                    let Some(addr) = parse_rcpt_to(args) else {
                        self.write_line(&mut stream, "501 5.1.3 bad recipient address syntax")
                            .await?;
                        continue;
                    };
                    let local = addr.local.to_lowercase();
                    let domain = addr.domain.to_lowercase();
                    if !self.resolver.allowed(&domain, &local) {
                        self.metrics.inc_rejected("mailbox_not_found");
                        self.write_line(&mut stream, "550 5.1.1 mailbox not found")
                            .await?;
                        continue;
                    }
                    // The first accepted recipient pins the routing pair;
                    // later recipients are recorded but do not re-route.
                    if envelope.domain.is_empty() {
                        envelope.domain = domain.clone();
                        envelope.mailbox = local.clone();
                    }
                    envelope.rcpt_to.push(format!("{}@{}", local, domain));
                    state = SessionState::HaveRcpt;
                    self.write_line(&mut stream, "250 2.1.5 OK").await?;
                }

                "DATA" => {
                    if state != SessionState::HaveRcpt || envelope.rcpt_to.is_empty() {
                        self.write_line(&mut stream, "503 5.5.1 need RCPT TO first")
                            .await?;
                        continue;
                    }
                    self.write_line(&mut stream, "354 start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    match self.read_data(&mut stream).await {
                        Ok(body) => self.commit(&mut stream, &envelope, &body).await?,
                        Err(e) => {
                            warn!(error = %e, "failed to read message data");
                            self.write_line(&mut stream, "451 4.3.0 error reading message")
                                .await?;
                        }
                    }

                    envelope.clear();
                    state = SessionState::Ready;
                }

                "RSET" => {
                    envelope.clear();
                    state = SessionState::Ready;
                    self.write_line(&mut stream, "250 2.0.0 OK").await?;
                }

                "NOOP" => {
                    self.write_line(&mut stream, "250 2.0.0 OK").await?;
                }

                "QUIT" => {
                    self.write_line(&mut stream, "221 2.0.0 bye").await?;
                    return Ok(LoopExit::Closed);
                }

                "VRFY" => {
                    self.write_line(&mut stream, "252 2.5.2 cannot VRFY user")
                        .await?;
                }

                "EXPN" => {
                    self.write_line(&mut stream, "502 5.5.1 EXPN not supported")
                        .await?;
                }

                _ => {
                    self.write_line(&mut stream, "500 5.5.2 command not recognized")
                        .await?;
                }
            }
        }
    }

    /// Spool the body and fan out: metrics, log line, ingest event.
    async fn commit<S>(
        &self,
        stream: &mut BufStream<S>,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let received_at = Utc::now();
        let trace_id = new_ulid(received_at);
        let start = Instant::now();

        let result = self
            .spool
            .store(
                StoreRequest {
                    max_bytes: self.config.max_msg_bytes,
                    remote_ip: self.remote_ip.clone(),
                    mail_from: envelope.mail_from.clone(),
                    rcpt_to: envelope.rcpt_to.clone(),
                    domain: envelope.domain.clone(),
                    mailbox: envelope.mailbox.clone(),
                    received_at: Some(received_at),
                    trace_id: Some(trace_id),
                },
                body,
            )
            .await;

        let res = match result {
            Err(Error::TooLarge) => {
                self.metrics.inc_rejected("too_large");
                self.write_line(stream, "552 5.3.4 message too large").await?;
                return Ok(());
            }
            Err(e) => {
                self.metrics.inc_spool_error();
                error!(error = %e, "spool store failed");
                self.write_line(stream, "451 4.3.0 temporary failure").await?;
                return Ok(());
            }
            Ok(res) => res,
        };

        self.metrics.inc_accepted(res.bytes);
        info!(
            id = %res.id,
            trace_id = %res.trace_id,
            domain = %envelope.domain,
            mailbox = %envelope.mailbox,
            bytes = res.bytes,
            sha256 = %res.sha256,
            duration_ms = start.elapsed().as_millis() as u64,
            "message accepted"
        );

        // Best-effort side channel; never delays or fails the 250.
        if let Some(events) = &self.events {
            events.publish(IngestEvent {
                id: res.id.clone(),
                trace_id: res.trace_id.clone(),
                received_at: rfc3339_nanos(received_at),
                remote_ip: self.remote_ip.clone(),
                domain: envelope.domain.clone(),
                mailbox: envelope.mailbox.clone(),
                mail_from: envelope.mail_from.clone(),
                rcpt_to: envelope.rcpt_to.clone(),
                bytes: res.bytes,
                sha256: res.sha256.clone(),
                meta_path: res.meta_path.display().to_string(),
                eml_path: res.eml_path.display().to_string(),
            });
        }

        self.write_line(stream, &format!("250 2.0.0 OK: queued as {}", res.id))
            .await
    }

    /// Read the DATA body up to `<CRLF>.<CRLF>`, undoing dot-stuffing and
    /// preserving CRLF line endings. The CRLF immediately before the
    /// terminator belongs to the terminator, not the body.
    ///
    /// Accumulation is capped just past the size limit; the rest of an
    /// oversized body is consumed and discarded so the session can answer
    /// 552 and carry on.
    async fn read_data<S>(&self, stream: &mut BufStream<S>) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let keep_limit = (self.config.max_msg_bytes as usize).saturating_add(1);
        let mut body: Vec<u8> = Vec::new();
        let mut dropped = false;
        let mut line: Vec<u8> = Vec::new();

        loop {
            line.clear();
            let n = match timeout(
                self.config.read_timeout,
                stream.read_until(b'\n', &mut line),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "read timeout during DATA",
                    )))
                }
            };
            if n == 0 {
                return Err(Error::Spool("connection closed during DATA".to_string()));
            }

            match line.as_slice() {
                b".\r\n" | b".\n" => {
                    if !dropped {
                        if body.ends_with(b"\r\n") {
                            body.truncate(body.len() - 2);
                        } else if body.ends_with(b"\n") {
                            body.truncate(body.len() - 1);
                        }
                    }
                    return Ok(body);
                }
                _ => {}
            }

            let unstuffed: &[u8] = if line.first() == Some(&b'.') {
                &line[1..]
            } else {
                &line
            };

            if body.len() < keep_limit {
                let take = unstuffed.len().min(keep_limit - body.len());
                body.extend_from_slice(&unstuffed[..take]);
                if take < unstuffed.len() {
                    dropped = true;
                }
            } else {
                dropped = true;
            }
        }
    }

    async fn write_line<S>(&self, stream: &mut BufStream<S>, response: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let write = async {
            stream.write_all(response.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await
        };
        match timeout(self.config.write_timeout, write).await {
            Ok(result) => {
                result?;
                debug!(remote_ip = %self.remote_ip, response = %response, "smtp response");
                Ok(())
            }
            Err(_) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write timeout",
            ))),
        }
    }

    async fn read_line<S>(&self, stream: &mut BufStream<S>, line: &mut String) -> Result<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match timeout(self.config.read_timeout, stream.read_line(line)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "read timeout",
            ))),
        }
    }
}

/// Split an SMTP command line into command and arguments
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, args)) => (command, args),
        None => (line, ""),
    }
}

/// Parse `MAIL FROM:<address>`; `Some(None)` is the null reverse-path.
fn parse_mail_from(args: &str) -> Option<Option<EmailAddress>> {
    let args = args.trim();
    let rest = match args.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("FROM:") => args[5..].trim(),
        _ => return None,
    };

    if rest == "<>" {
        return Some(None);
    }

    let email = extract_angle_addr(rest)?;
    if email.is_empty() {
        return Some(None);
    }
    EmailAddress::parse(email).map(Some)
}

/// Parse `RCPT TO:<address>`.
fn parse_rcpt_to(args: &str) -> Option<EmailAddress> {
    let args = args.trim();
    let rest = match args.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("TO:") => args[3..].trim(),
        _ => return None,
    };

    EmailAddress::parse(extract_angle_addr(rest)?)
}

fn extract_angle_addr(s: &str) -> Option<&str> {
    if let Some(inner) = s.strip_prefix('<') {
        let end = inner.find('>')?;
        Some(&inner[..end])
    } else {
        s.split_whitespace().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    #[test]
    fn test_parse_mail_from() {
        assert_eq!(
            parse_mail_from("FROM:<user@example.com>"),
            Some(Some(EmailAddress::new("user", "example.com")))
        );
        assert_eq!(
            parse_mail_from("FROM: <user@example.com>"),
            Some(Some(EmailAddress::new("user", "example.com")))
        );
        assert_eq!(parse_mail_from("FROM:<>"), Some(None));
        assert_eq!(parse_mail_from("FROM:<junk>"), None);
        assert_eq!(parse_mail_from("invalid"), None);
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            parse_rcpt_to("TO:<user@example.com>"),
            Some(EmailAddress::new("user", "example.com"))
        );
        assert_eq!(
            parse_rcpt_to("to: <user@example.com>"),
            Some(EmailAddress::new("user", "example.com"))
        );
        assert_eq!(parse_rcpt_to("TO:<>"), None);
        assert_eq!(parse_rcpt_to("TO:<@example.com>"), None);
        assert_eq!(parse_rcpt_to("nonsense"), None);
    }

    struct Fixture {
        _dir: TempDir,
        spool_dir: std::path::PathBuf,
        metrics: Metrics,
        session: SmtpSession,
    }

    fn fixture(snapshot: &str, max_msg_bytes: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let snapshot_path = dir.path().join("snapshot.json");
        std::fs::write(&snapshot_path, snapshot).unwrap();
        let resolver = Arc::new(SnapshotLoader::new(&snapshot_path));
        resolver.load().unwrap();

        let spool_dir = dir.path().join("spool");
        let metrics = Metrics::new().unwrap();
        let session = SmtpSession {
            config: SmtpConfig {
                max_msg_bytes,
                ..SmtpConfig::default()
            },
            resolver,
            spool: Arc::new(Spool::new(&spool_dir)),
            limiter: Arc::new(IpLimiterCache::default()),
            events: None,
            metrics: metrics.smtp.clone(),
            tls: None,
            remote_ip: "1.2.3.4".to_string(),
        };
        Fixture {
            _dir: dir,
            spool_dir,
            metrics,
            session,
        }
    }

    async fn expect_code(reader: &mut BufReader<tokio::io::ReadHalf<DuplexStream>>, code: &str) {
        // Skip continuation lines of multi-line replies.
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(
                line.starts_with(&code[..3]),
                "expected {} got {:?}",
                code,
                line
            );
            if !line.starts_with(&format!("{}-", &code[..3])) {
                return;
            }
        }
    }

    fn spooled(dir: &Path, ext: &str) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            if let Ok(entries) = std::fs::read_dir(&d) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else if path.extension().is_some_and(|e| e == ext) {
                        out.push(path);
                    }
                }
            }
        }
        out
    }

    const SNAPSHOT: &str = r#"{
  "generated_at": "2026-02-14T00:00:00Z",
  "domains": {
    "example.com": {
      "mode": "allowlist",
      "plus_tag": true,
      "mailboxes": ["inbound"],
      "disabled": false
    }
  }
}"#;

    #[tokio::test]
    async fn test_session_happy_path() {
        let fixture = fixture(SNAPSHOT, 1024);
        let spool_dir = fixture.spool_dir.clone();
        let (client, server) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(fixture.session.handle(server));

        let (read_half, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);

        expect_code(&mut reader, "220").await;
        writer.write_all(b"EHLO tester\r\n").await.unwrap();
        expect_code(&mut reader, "250").await;
        writer
            .write_all(b"MAIL FROM:<from@example.net>\r\n")
            .await
            .unwrap();
        expect_code(&mut reader, "250").await;
        writer
            .write_all(b"RCPT TO:<Inbound+123@Example.COM>\r\n")
            .await
            .unwrap();
        expect_code(&mut reader, "250").await;
        writer.write_all(b"DATA\r\n").await.unwrap();
        expect_code(&mut reader, "354").await;
        writer
            .write_all(b"Subject: hi\r\n\r\nbody\r\n.\r\n")
            .await
            .unwrap();
        expect_code(&mut reader, "250").await;
        writer.write_all(b"QUIT\r\n").await.unwrap();
        expect_code(&mut reader, "221").await;

        drop(writer);
        drop(reader);
        task.await.unwrap().unwrap();

        let bodies = spooled(&spool_dir, "eml");
        let metas = spooled(&spool_dir, "json");
        assert_eq!(bodies.len(), 1);
        assert_eq!(metas.len(), 1);

        let body = std::fs::read(&bodies[0]).unwrap();
        assert_eq!(body, b"Subject: hi\r\n\r\nbody");
        assert_eq!(body.len(), 19);

        let meta: mailsink_common::types::MessageMeta =
            serde_json::from_slice(&std::fs::read(&metas[0]).unwrap()).unwrap();
        assert_eq!(meta.domain, "example.com");
        assert_eq!(meta.mailbox, "inbound");
        assert_eq!(meta.rcpt_to, vec!["inbound+123@example.com".to_string()]);
        assert_eq!(meta.mail_from, "from@example.net");
        assert_eq!(meta.bytes, 19);

        assert_eq!(fixture.metrics.smtp.accepted_total.get(), 1);
        assert_eq!(fixture.metrics.smtp.received_bytes_total.get(), 19);
    }

    #[tokio::test]
    async fn test_session_plus_tag_disabled_rejects() {
        let snapshot = r#"{"domains": {"example.com": {"plus_tag": false, "mailboxes": ["inbound"]}}}"#;
        let fixture = fixture(snapshot, 1024);
        let spool_dir = fixture.spool_dir.clone();
        let rejected = fixture.metrics.smtp.rejected_total.clone();
        let (client, server) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(fixture.session.handle(server));

        let (read_half, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);

        expect_code(&mut reader, "220").await;
        writer.write_all(b"EHLO tester\r\n").await.unwrap();
        expect_code(&mut reader, "250").await;
        writer
            .write_all(b"MAIL FROM:<from@example.net>\r\n")
            .await
            .unwrap();
        expect_code(&mut reader, "250").await;
        writer
            .write_all(b"RCPT TO:<inbound+x@example.com>\r\n")
            .await
            .unwrap();
        expect_code(&mut reader, "550").await;
        writer.write_all(b"QUIT\r\n").await.unwrap();
        expect_code(&mut reader, "221").await;

        task.await.unwrap().unwrap();

        assert_eq!(
            rejected.with_label_values(&["mailbox_not_found"]).get(),
            1
        );
        assert!(spooled(&spool_dir, "eml").is_empty());
        assert!(spooled(&spool_dir, "json").is_empty());
    }

    #[tokio::test]
    async fn test_session_too_large() {
        let fixture = fixture(SNAPSHOT, 5);
        let spool_dir = fixture.spool_dir.clone();
        let rejected = fixture.metrics.smtp.rejected_total.clone();
        let (client, server) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(fixture.session.handle(server));

        let (read_half, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);

        expect_code(&mut reader, "220").await;
        writer.write_all(b"EHLO tester\r\n").await.unwrap();
        expect_code(&mut reader, "250").await;
        writer
            .write_all(b"MAIL FROM:<from@example.net>\r\n")
            .await
            .unwrap();
        expect_code(&mut reader, "250").await;
        writer
            .write_all(b"RCPT TO:<inbound@example.com>\r\n")
            .await
            .unwrap();
        expect_code(&mut reader, "250").await;
        writer.write_all(b"DATA\r\n").await.unwrap();
        expect_code(&mut reader, "354").await;
        writer.write_all(b"123456\r\n.\r\n").await.unwrap();
        expect_code(&mut reader, "552").await;
        writer.write_all(b"QUIT\r\n").await.unwrap();
        expect_code(&mut reader, "221").await;

        task.await.unwrap().unwrap();

        assert_eq!(rejected.with_label_values(&["too_large"]).get(), 1);
        // No files at all, including tmp leftovers.
        assert!(spooled(&spool_dir, "eml").is_empty());
        assert!(spooled(&spool_dir, "json").is_empty());
        assert!(spooled(&spool_dir, "tmp").is_empty());
    }

    #[tokio::test]
    async fn test_session_bad_sequence_and_syntax() {
        let fixture = fixture(SNAPSHOT, 1024);
        let (client, server) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(fixture.session.handle(server));

        let (read_half, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);

        expect_code(&mut reader, "220").await;
        // MAIL before EHLO.
        writer
            .write_all(b"MAIL FROM:<from@example.net>\r\n")
            .await
            .unwrap();
        expect_code(&mut reader, "503").await;
        writer.write_all(b"EHLO tester\r\n").await.unwrap();
        expect_code(&mut reader, "250").await;
        // DATA before RCPT.
        writer.write_all(b"DATA\r\n").await.unwrap();
        expect_code(&mut reader, "503").await;
        writer.write_all(b"MAIL FROM:<oops\r\n").await.unwrap();
        expect_code(&mut reader, "501").await;
        writer.write_all(b"AUTH PLAIN dGVzdA==\r\n").await.unwrap();
        expect_code(&mut reader, "502").await;
        writer.write_all(b"QUIT\r\n").await.unwrap();
        expect_code(&mut reader, "221").await;

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_dot_unstuffing() {
        let fixture = fixture(SNAPSHOT, 1024);
        let spool_dir = fixture.spool_dir.clone();
        let (client, server) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(fixture.session.handle(server));

        let (read_half, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);

        expect_code(&mut reader, "220").await;
        writer.write_all(b"EHLO tester\r\n").await.unwrap();
        expect_code(&mut reader, "250").await;
        writer
            .write_all(b"MAIL FROM:<from@example.net>\r\n")
            .await
            .unwrap();
        expect_code(&mut reader, "250").await;
        writer
            .write_all(b"RCPT TO:<inbound@example.com>\r\n")
            .await
            .unwrap();
        expect_code(&mut reader, "250").await;
        writer.write_all(b"DATA\r\n").await.unwrap();
        expect_code(&mut reader, "354").await;
        writer
            .write_all(b"..leading dot\r\nplain\r\n.\r\n")
            .await
            .unwrap();
        expect_code(&mut reader, "250").await;
        writer.write_all(b"QUIT\r\n").await.unwrap();
        expect_code(&mut reader, "221").await;

        task.await.unwrap().unwrap();

        let bodies = spooled(&spool_dir, "eml");
        assert_eq!(bodies.len(), 1);
        assert_eq!(
            std::fs::read(&bodies[0]).unwrap(),
            b".leading dot\r\nplain"
        );
    }

    #[tokio::test]
    async fn test_session_rate_limited() {
        let mut fixture = fixture(SNAPSHOT, 1024);
        // Burst of one; drain it so the session is denied at open.
        let limiter = Arc::new(IpLimiterCache::new(
            16,
            std::time::Duration::from_secs(600),
            std::time::Duration::from_millis(200),
            1,
        ));
        assert!(limiter.allow("1.2.3.4", Instant::now()));
        fixture.session.limiter = limiter;
        let rejected = fixture.metrics.smtp.rejected_total.clone();

        let (client, server) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(fixture.session.handle(server));

        let (read_half, _writer) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("421"), "got {:?}", line);

        task.await.unwrap().unwrap();
        assert_eq!(rejected.with_label_values(&["rate_limited"]).get(), 1);
    }
}
