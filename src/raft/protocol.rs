use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::raft::{Entry, NodeAddr};

pub const DIRECTION_REQUEST: u8 = 1;
pub const DIRECTION_RESPONSE: u8 = 2;

pub const TYPE_APPEND_ENTRIES: u8 = 1;
pub const TYPE_REQUEST_VOTE: u8 = 2;
// Reserved tags for operations this node does not serve. They must still
// decode far enough to be named in a log line before being rejected.
pub const TYPE_ADD_SERVER: u8 = 3;
pub const TYPE_REMOVE_SERVER: u8 = 4;
pub const TYPE_INSTALL_SNAPSHOT: u8 = 5;
pub const TYPE_REGISTER_CLIENT: u8 = 6;
pub const TYPE_CLIENT_REQUEST: u8 = 7;
pub const TYPE_CLIENT_QUERY: u8 = 8;

/// The outer wire document. Every datagram carries one or more of these,
/// each on its own newline-terminated line, with the actual RPC payload
/// JSON-encoded inside `content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub direction: u8,
    #[serde(rename = "type")]
    pub kind: u8,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeAddr,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub leader_commit_index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeAddr,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// A fully decoded RPC, request or response.
#[derive(Debug, Clone, PartialEq)]
pub enum Rpc {
    AppendEntries(AppendEntriesRequest),
    AppendEntriesReply(AppendEntriesResponse),
    RequestVote(RequestVoteRequest),
    RequestVoteReply(RequestVoteResponse),
}

impl Rpc {
    /// The sender's term, present on all four shapes. Observing it is the
    /// first thing every handler does.
    pub fn term(&self) -> u64 {
        match self {
            Rpc::AppendEntries(req) => req.term,
            Rpc::AppendEntriesReply(res) => res.term,
            Rpc::RequestVote(req) => req.term,
            Rpc::RequestVoteReply(res) => res.term,
        }
    }

    fn direction(&self) -> u8 {
        match self {
            Rpc::AppendEntries(_) | Rpc::RequestVote(_) => DIRECTION_REQUEST,
            Rpc::AppendEntriesReply(_) | Rpc::RequestVoteReply(_) => DIRECTION_RESPONSE,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Rpc::AppendEntries(_) | Rpc::AppendEntriesReply(_) => TYPE_APPEND_ENTRIES,
            Rpc::RequestVote(_) | Rpc::RequestVoteReply(_) => TYPE_REQUEST_VOTE,
        }
    }
}

/// Serializes an RPC into one newline-terminated envelope line.
pub fn encode(rpc: &Rpc) -> Result<String, WireError> {
    let content = match rpc {
        Rpc::AppendEntries(req) => serde_json::to_string(req),
        Rpc::AppendEntriesReply(res) => serde_json::to_string(res),
        Rpc::RequestVote(req) => serde_json::to_string(req),
        Rpc::RequestVoteReply(res) => serde_json::to_string(res),
    }
    .map_err(WireError::Envelope)?;

    let envelope = Envelope {
        direction: rpc.direction(),
        kind: rpc.kind(),
        content,
    };
    let mut line = serde_json::to_string(&envelope).map_err(WireError::Envelope)?;
    line.push('\n');
    Ok(line)
}

/// Splits a datagram into its envelope lines and decodes each one
/// independently, so one malformed line cannot take down its neighbors.
pub fn decode_datagram(payload: &[u8]) -> Vec<Result<Rpc, WireError>> {
    let text = String::from_utf8_lossy(payload);
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(decode_line)
        .collect()
}

fn decode_line(line: &str) -> Result<Rpc, WireError> {
    let envelope: Envelope = serde_json::from_str(line).map_err(WireError::Envelope)?;

    let name = match envelope.kind {
        TYPE_APPEND_ENTRIES | TYPE_REQUEST_VOTE => None,
        TYPE_ADD_SERVER => Some("AddServer"),
        TYPE_REMOVE_SERVER => Some("RemoveServer"),
        TYPE_INSTALL_SNAPSHOT => Some("InstallSnapshot"),
        TYPE_REGISTER_CLIENT => Some("RegisterClient"),
        TYPE_CLIENT_REQUEST => Some("ClientRequest"),
        TYPE_CLIENT_QUERY => Some("ClientQuery"),
        other => return Err(WireError::UnknownType(other)),
    };
    if let Some(name) = name {
        return Err(WireError::Unimplemented(name));
    }

    let rpc = match (envelope.direction, envelope.kind) {
        (DIRECTION_REQUEST, TYPE_APPEND_ENTRIES) => {
            Rpc::AppendEntries(decode_payload(&envelope.content, "AppendEntries request")?)
        }
        (DIRECTION_RESPONSE, TYPE_APPEND_ENTRIES) => {
            Rpc::AppendEntriesReply(decode_payload(&envelope.content, "AppendEntries response")?)
        }
        (DIRECTION_REQUEST, TYPE_REQUEST_VOTE) => {
            Rpc::RequestVote(decode_payload(&envelope.content, "RequestVote request")?)
        }
        (DIRECTION_RESPONSE, TYPE_REQUEST_VOTE) => {
            Rpc::RequestVoteReply(decode_payload(&envelope.content, "RequestVote response")?)
        }
        (direction, _) => return Err(WireError::Direction(direction)),
    };

    validate(&rpc)?;
    Ok(rpc)
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    content: &str,
    kind: &'static str,
) -> Result<T, WireError> {
    serde_json::from_str(content).map_err(|source| WireError::Payload { kind, source })
}

/// Structural checks that JSON decoding alone cannot express.
fn validate(rpc: &Rpc) -> Result<(), WireError> {
    match rpc {
        Rpc::AppendEntries(req) => {
            if !req.leader_id.is_valid() {
                return Err(WireError::Address(req.leader_id.to_string()));
            }
        }
        Rpc::RequestVote(req) => {
            if !req.candidate_id.is_valid() {
                return Err(WireError::Address(req.candidate_id.to_string()));
            }
        }
        Rpc::AppendEntriesReply(_) | Rpc::RequestVoteReply(_) => {}
    }
    Ok(())
}
