//! Recipient resolver and snapshot loader
//!
//! The allowlist lives in a JSON snapshot file that an external system
//! regenerates. The serving path reads from an immutable in-memory build of
//! that snapshot through a single atomic pointer; reloads swap the pointer
//! and never stall readers. A reload that fails keeps the previous snapshot
//! so the ingest path stays up.

use arc_swap::ArcSwap;
use mailsink_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Per-domain validation mode. Only `allowlist` is served today; `catch_all`
/// parses but is rejected at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DomainMode {
    #[default]
    Allowlist,
    CatchAll,
}

/// Snapshot file schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub generated_at: Option<String>,

    #[serde(default)]
    pub domains: HashMap<String, DomainConfig>,
}

/// Per-domain configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DomainConfig {
    #[serde(default)]
    pub mode: DomainMode,

    #[serde(default)]
    pub plus_tag: bool,

    #[serde(default)]
    pub mailboxes: Vec<String>,

    #[serde(default)]
    pub disabled: bool,

    /// Advisory per-domain overrides; the global limits take precedence.
    #[serde(default)]
    pub max_msg_bytes: Option<u64>,

    #[serde(default)]
    pub max_rcpt_count: Option<usize>,
}

/// Counts over the active snapshot, exported as gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub domains: usize,
    pub mailboxes: usize,
}

#[derive(Debug)]
struct DomainAllow {
    plus_tag: bool,
    mailboxes: HashSet<String>,
}

/// Immutable build of one snapshot.
#[derive(Debug)]
pub struct Resolver {
    domains: HashMap<String, DomainAllow>,
    stats: ResolverStats,
}

impl Resolver {
    fn empty() -> Self {
        Self {
            domains: HashMap::new(),
            stats: ResolverStats::default(),
        }
    }

    /// Build the lookup structure from a parsed snapshot.
    ///
    /// Domain keys and mailboxes are canonicalized to lowercase; disabled
    /// domains are dropped; any mode other than `allowlist` fails the build.
    pub fn build(snapshot: &Snapshot) -> Result<Self> {
        let mut domains = HashMap::with_capacity(snapshot.domains.len());
        let mut stats = ResolverStats::default();

        for (name, config) in &snapshot.domains {
            if config.disabled {
                continue;
            }
            if config.mode != DomainMode::Allowlist {
                return Err(Error::Snapshot(format!(
                    "domain {}: unsupported mode {:?}",
                    name, config.mode
                )));
            }
            let key = name.trim_end_matches('.').to_lowercase();
            let mailboxes: HashSet<String> = config
                .mailboxes
                .iter()
                .map(|mb| mb.to_lowercase())
                .collect();
            stats.domains += 1;
            stats.mailboxes += mailboxes.len();
            domains.insert(
                key,
                DomainAllow {
                    plus_tag: config.plus_tag,
                    mailboxes,
                },
            );
        }

        Ok(Self { domains, stats })
    }

    /// Is `local@domain` an accepted recipient?
    ///
    /// Case-insensitive in both arguments; a single trailing dot on the
    /// domain is ignored. With `plus_tag`, `local+anything` is accepted when
    /// `local` is in the mailbox set.
    pub fn allowed(&self, domain: &str, local: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_lowercase();
        let local = local.to_lowercase();

        let Some(entry) = self.domains.get(&domain) else {
            return false;
        };
        if entry.mailboxes.contains(&local) {
            return true;
        }
        if entry.plus_tag {
            if let Some((base, _tag)) = local.split_once('+') {
                return entry.mailboxes.contains(base);
            }
        }
        false
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats
    }
}

/// Owns the current resolver and re-reads the snapshot file on demand.
pub struct SnapshotLoader {
    path: PathBuf,
    current: ArcSwap<Resolver>,
}

impl SnapshotLoader {
    /// Create a loader serving an empty snapshot until the first `load`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: ArcSwap::from_pointee(Resolver::empty()),
        }
    }

    /// Re-read and re-build the snapshot, atomically publishing it on
    /// success. On failure the previous snapshot stays in place.
    pub fn load(&self) -> Result<ResolverStats> {
        let bytes = std::fs::read(&self.path)
            .map_err(|e| Error::Snapshot(format!("read {}: {}", self.path.display(), e)))?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Snapshot(format!("parse {}: {}", self.path.display(), e)))?;
        let resolver = Resolver::build(&snapshot)?;
        let stats = resolver.stats();
        self.current.store(Arc::new(resolver));
        Ok(stats)
    }

    /// Lock-free check against the current snapshot.
    pub fn allowed(&self, domain: &str, local: &str) -> bool {
        self.current.load().allowed(domain, local)
    }

    pub fn stats(&self) -> ResolverStats {
        self.current.load().stats()
    }
}
