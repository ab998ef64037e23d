//! Wire message kinds: the vocabulary exchanged over the framed
//! peer-facing transport. Encoded with `postcard` — bounded varints, safe
//! to decode from an untrusted peer without an intermediate allocation
//! blowup, unlike `bincode`'s default unbounded length prefixes.

use crate::session::{Encoding, Mode};
use crate::types::{Nonce, RecordType, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Role {
    Publish,
    Subscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeMsg {
    pub role: Role,
    pub record_type: RecordType,
    pub digest_algorithms: Vec<String>,
    pub encodings: Vec<EncodingName>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum EncodingName {
    Xml,
    Exi,
}

impl From<EncodingName> for Encoding {
    fn from(name: EncodingName) -> Self {
        match name {
            EncodingName::Xml => Encoding::Xml,
            EncodingName::Exi => Encoding::Exi,
        }
    }
}

impl From<Encoding> for EncodingName {
    fn from(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Xml => EncodingName::Xml,
            Encoding::Exi => EncodingName::Exi,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeAckMsg {
    pub digest_algorithm: String,
    pub encoding: EncodingName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeNackMsg {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModeName {
    Archive,
    Live { timestamp: String },
}

impl ModeName {
    pub fn mode(&self) -> Mode {
        match self {
            ModeName::Archive => Mode::Archive,
            ModeName::Live { .. } => Mode::Live,
        }
    }

    /// The subscriber-supplied start timestamp for a live subscribe, if
    /// present and well-formed. `None` for archive mode, or for a
    /// malformed timestamp (the caller falls back to server-now).
    pub fn live_timestamp(&self) -> Option<Timestamp> {
        match self {
            ModeName::Archive => None,
            ModeName::Live { timestamp } => parse_timestamp(timestamp),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeMsg {
    pub mode: ModeName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalResumeMsg {
    pub network_nonce: Nonce,
    pub offset: u64,
}

/// One frame of a multi-frame `record` message. A full record is a
/// sequence of `RecordFrameMsg::Chunk` frames followed by one
/// `RecordFrameMsg::Boundary`, mirroring the feeder's phase output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordFrameMsg {
    Header { nonce: Nonce, record_type: RecordType, total_estimate: u64 },
    Chunk(Vec<u8>),
    Boundary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestMsg {
    pub entries: Vec<(Nonce, Vec<u8>)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DigestStatus {
    Confirmed,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestResponseMsg {
    pub entries: Vec<(Nonce, DigestStatus)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMsg {
    pub nonce: Nonce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishMsg;

/// The full message vocabulary. One value of this enum is exactly one
/// frame on the wire (see [`crate::net::codec`] for the length-prefixed
/// framing around it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Initialize(InitializeMsg),
    InitializeAck(InitializeAckMsg),
    InitializeNack(InitializeNackMsg),
    Subscribe(SubscribeMsg),
    JournalResume(JournalResumeMsg),
    Record(RecordFrameMsg),
    Digest(DigestMsg),
    DigestResponse(DigestResponseMsg),
    Sync(SyncMsg),
    Finish(FinishMsg),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Initialize(_) => "initialize",
            Message::InitializeAck(_) => "initialize-ack",
            Message::InitializeNack(_) => "initialize-nack",
            Message::Subscribe(_) => "subscribe",
            Message::JournalResume(_) => "journal-resume",
            Message::Record(_) => "record",
            Message::Digest(_) => "digest",
            Message::DigestResponse(_) => "digest-response",
            Message::Sync(_) => "sync",
            Message::Finish(_) => "finish",
        }
    }
}

pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    Timestamp::new(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_names_match_wire_vocabulary() {
        assert_eq!(Message::Finish(FinishMsg).kind(), "finish");
        assert_eq!(
            Message::Sync(SyncMsg { nonce: Nonce::first() }).kind(),
            "sync"
        );
    }
}
