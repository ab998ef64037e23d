//! [`Record`]: the atomic unit of storage and transmission.

use crate::segment::Segment;
use crate::types::{Nonce, RecordType, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The current on-wire/on-disk record version. Bumped only on a breaking
/// layout change; readers reject anything else.
pub const RECORD_VERSION: u32 = 1;

/// The atomic unit of storage: metadata plus up to three segments and the
/// three delivery flags. Content is frozen once constructed — only the
/// flags and `network_nonce` are mutated in place, and only by the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    pub record_type: RecordType,
    pub host_uuid: Uuid,
    pub record_uuid: Uuid,
    pub pid: u32,
    pub uid: Option<u32>,
    pub hostname: String,
    pub timestamp: Timestamp,
    pub username: Option<String>,
    pub security_label: Option<String>,
    pub version: u32,

    pub sys_metadata: Segment,
    pub app_metadata: Option<Segment>,
    pub payload: Option<Segment>,

    /// Tag distinguishing locally-produced records from those received
    /// over the network and re-published; defaults to `"localhost"` per
    /// the original `jaldb_insert_audit_helper` convention.
    pub source: String,

    /// The nonce this record had on an upstream publisher, if it arrived
    /// over the network. Used for journal-resume lookups by network-nonce
    /// index. `None` for locally-produced records.
    pub network_nonce: Option<Nonce>,

    pub sent: bool,
    pub synced: bool,
    pub confirmed: bool,
}

/// Fields supplied by a producer when inserting a new record; the store
/// fills in version, nonce, and flags. Kept separate from `Record` so the
/// store is the only thing that can construct a record with `sent` or
/// `confirmed` already set.
#[derive(Clone, Debug)]
pub struct NewRecord {
    pub record_type: RecordType,
    pub host_uuid: Uuid,
    pub record_uuid: Uuid,
    pub pid: u32,
    pub uid: Option<u32>,
    pub hostname: String,
    pub timestamp: Timestamp,
    pub username: Option<String>,
    pub security_label: Option<String>,
    pub sys_metadata: Segment,
    pub app_metadata: Option<Segment>,
    pub payload: Option<Segment>,
    pub source: String,
    pub network_nonce: Option<Nonce>,
}

impl NewRecord {
    /// Builds the minimal record a local producer submits: no network
    /// nonce, `source` defaulting to `"localhost"`.
    pub fn local(
        record_type: RecordType,
        host_uuid: Uuid,
        pid: u32,
        hostname: impl Into<String>,
        timestamp: Timestamp,
        sys_metadata: Segment,
    ) -> Self {
        NewRecord {
            record_type,
            host_uuid,
            record_uuid: Uuid::new_v4(),
            pid,
            uid: None,
            hostname: hostname.into(),
            timestamp,
            username: None,
            security_label: None,
            sys_metadata,
            app_metadata: None,
            payload: None,
            source: "localhost".to_string(),
            network_nonce: None,
        }
    }

    fn into_record(self) -> Record {
        Record {
            record_type: self.record_type,
            host_uuid: self.host_uuid,
            record_uuid: self.record_uuid,
            pid: self.pid,
            uid: self.uid,
            hostname: self.hostname,
            timestamp: self.timestamp,
            username: self.username,
            security_label: self.security_label,
            version: RECORD_VERSION,
            sys_metadata: self.sys_metadata,
            app_metadata: self.app_metadata,
            payload: self.payload,
            source: self.source,
            network_nonce: self.network_nonce,
            sent: false,
            synced: false,
            confirmed: false,
        }
    }
}

impl Record {
    /// Validates the record-type-dependent payload requirement (payload
    /// optional for log records, mandatory for journal and audit) before
    /// the store commits a transaction.
    pub fn validate(&self) -> Result<(), String> {
        if self.sys_metadata.is_empty() {
            return Err("missing system metadata".to_string());
        }
        match self.record_type {
            RecordType::Journal | RecordType::Audit => {
                if self.payload.is_none() {
                    return Err(format!(
                        "{} records require a payload",
                        self.record_type
                    ));
                }
            }
            RecordType::Log => {}
        }
        Ok(())
    }

    /// `synced ⇒ confirmed ⇒ sent` must hold at every observation point.
    pub fn flags_consistent(&self) -> bool {
        (!self.synced || self.confirmed) && (!self.confirmed || self.sent)
    }
}

pub(crate) fn build(new: NewRecord) -> Result<Record, String> {
    let record = new.into_record();
    record.validate()?;
    Ok(record)
}
