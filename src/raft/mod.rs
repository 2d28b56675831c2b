use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod engine;
pub mod protocol;
pub mod timer;

// https://stackoverflow.com/questions/106179/regular-expression-to-match-dns-hostname-or-ip-address
const HOSTNAME_PATTERN: &str = r"(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])";
const IPV4_PATTERN: &str = r"(([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])";

fn host_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!("^({}|{})$", HOSTNAME_PATTERN, IPV4_PATTERN))
            .expect("host pattern must compile")
    })
}

/// Identity of a cluster node and the address RPCs are routed to.
///
/// Equality is structural, so the same host/port pair always names the same
/// node regardless of where the value was decoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeAddr { host: host.into(), port }
    }

    /// Whether the host is a syntactically valid hostname or IPv4 address.
    /// Ports need no check beyond what the type already guarantees.
    pub fn is_valid(&self) -> bool {
        host_regex().is_match(&self.host)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A single replicated log record. Entries are immutable once created; the
/// log only ever appends or truncates whole suffixes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub key: String,
    pub value: String,
}

impl Entry {
    pub fn new(index: u64, term: u64, key: impl Into<String>, value: impl Into<String>) -> Self {
        Entry {
            index,
            term,
            key: key.into(),
            value: value.into(),
        }
    }

    /// The synthetic entry at index 0 that precedes every log. It makes
    /// "previous entry" lookups total without special-casing empty logs.
    pub fn sentinel() -> Self {
        Entry::new(0, 0, "", "")
    }
}
