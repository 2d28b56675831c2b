use std::path::PathBuf;

use thiserror::Error;

/// Failures while reading or writing the durable node state. Every caller
/// treats these as fatal: a node that cannot persist must not keep serving.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid json in {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures while decoding an inbound RPC line. These are never fatal; the
/// offending line is logged and dropped.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid rpc envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("invalid rpc direction {0}")]
    Direction(u8),

    #[error("unknown rpc type {0}")]
    UnknownType(u8),

    #[error("{0} rpc is not implemented")]
    Unimplemented(&'static str),

    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid node address {0}")]
    Address(String),
}
