//! The record store: a primary table plus six secondary indices plus a
//! per-remote confirmation-watermark table, one set per record type,
//! backed by `sled`'s transactional multi-tree API so every write that
//! touches more than one index commits (or rolls back) atomically.

use crate::error::{JalError, Result};
use crate::record::{self, NewRecord, Record};
use crate::types::{Nonce, RecordType, Timestamp};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Tree;
use std::path::Path;

const META_MAX_NONCE: &[u8] = b"max_nonce";

struct TypeTrees {
    primary: Tree,
    ts_index: Tree,
    nonce_ts_index: Tree,
    uuid_index: Tree,
    sent_index: Tree,
    confirmed_index: Tree,
    netnonce_index: Tree,
    watermark: Tree,
    meta: Tree,
}

/// Owns every tree for every record type. One `RecordStore` per daemon
/// process, shared behind an `Arc` by the publisher loops and the
/// producer-facing listener.
pub struct RecordStore {
    _db: sled::Db,
    journal: TypeTrees,
    audit: TypeTrees,
    log: TypeTrees,
}

impl RecordStore {
    pub fn open(db_root: &Path) -> Result<Self> {
        let db = sled::open(db_root)?;
        Ok(RecordStore {
            journal: TypeTrees::open(&db, RecordType::Journal)?,
            audit: TypeTrees::open(&db, RecordType::Audit)?,
            log: TypeTrees::open(&db, RecordType::Log)?,
            _db: db,
        })
    }

    fn trees(&self, record_type: RecordType) -> &TypeTrees {
        match record_type {
            RecordType::Journal => &self.journal,
            RecordType::Audit => &self.audit,
            RecordType::Log => &self.log,
        }
    }

    /// Inserts a new record, atomically assigning it a nonce strictly
    /// greater than the current maximum for its record type and updating
    /// every secondary index in the same transaction.
    pub fn insert(&self, new: NewRecord) -> Result<Nonce> {
        let record_type = new.record_type;
        let record = record::build(new).map_err(JalError::invalid)?;
        let trees = self.trees(record_type);

        let outcome = (
            &trees.primary,
            &trees.ts_index,
            &trees.nonce_ts_index,
            &trees.uuid_index,
            &trees.sent_index,
            &trees.confirmed_index,
            &trees.netnonce_index,
            &trees.meta,
        )
            .transaction(
                |(primary, ts_index, nonce_ts_index, uuid_index, sent_index, confirmed_index, netnonce_index, meta)| {
                    let next_nonce = match meta.get(META_MAX_NONCE)? {
                        Some(v) => {
                            let s = std::str::from_utf8(&v).map_err(|_| {
                                ConflictableTransactionError::Abort(JalError::corrupted(
                                    "max_nonce is not valid utf-8",
                                ))
                            })?;
                            let current = Nonce::parse(s).ok_or_else(|| {
                                ConflictableTransactionError::Abort(JalError::corrupted(
                                    "max_nonce is not a valid nonce",
                                ))
                            })?;
                            current.next()
                        }
                        None => Nonce::first(),
                    };

                    let record_bytes = bincode::serialize(&record).map_err(|e| {
                        ConflictableTransactionError::Abort(JalError::Encoding(e))
                    })?;
                    primary.insert(next_nonce.sort_key(), record_bytes)?;

                    ts_index.insert(ts_index_key(&record.timestamp, &next_nonce), &[][..])?;
                    nonce_ts_index.insert(next_nonce.sort_key(), record.timestamp.as_str().as_bytes())?;
                    uuid_index.insert(uuid_index_key(&record.record_uuid, &next_nonce), &[][..])?;
                    sent_index.insert(flag_index_key(false, &next_nonce), &[][..])?;
                    confirmed_index.insert(flag_index_key(false, &next_nonce), &[][..])?;
                    if let Some(net_nonce) = &record.network_nonce {
                        netnonce_index.insert(net_nonce.sort_key(), next_nonce.sort_key())?;
                    }
                    meta.insert(META_MAX_NONCE, next_nonce.as_str().as_bytes())?;

                    Ok(next_nonce)
                },
            );

        unwrap_txn(outcome)
    }

    pub fn get(&self, record_type: RecordType, nonce: &Nonce) -> Result<Record> {
        let trees = self.trees(record_type);
        let bytes = trees
            .primary
            .get(nonce.sort_key())?
            .ok_or(JalError::NotFound)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Looks a record up by the nonce it was assigned by an upstream
    /// publisher, for journal-resume.
    pub fn get_by_network_nonce(
        &self,
        record_type: RecordType,
        network_nonce: &Nonce,
    ) -> Result<(Nonce, Record)> {
        let trees = self.trees(record_type);
        let nonce_key = trees
            .netnonce_index
            .get(network_nonce.sort_key())?
            .ok_or(JalError::NotFound)?;
        let bytes = trees
            .primary
            .get(&nonce_key)?
            .ok_or_else(|| JalError::corrupted("network-nonce index points to missing record"))?;
        let record: Record = bincode::deserialize(&bytes)?;
        let nonce = decode_nonce_sort_key(&nonce_key)?;
        Ok((nonce, record))
    }

    /// Returns the record with the smallest nonce whose `sent` flag is
    /// clear. No long-lived cursor is held: this opens the index,
    /// range-scans to the first matching key, and returns.
    pub fn next_unsynced(&self, record_type: RecordType) -> Result<(Nonce, Record)> {
        let trees = self.trees(record_type);
        let prefix = [0u8]; // sent = false
        let entry = trees
            .sent_index
            .scan_prefix(prefix)
            .next()
            .transpose()?
            .ok_or(JalError::NotFound)?;
        let nonce = decode_flag_index_key(&entry.0)?;
        let record = self.get(record_type, &nonce)?;
        Ok((nonce, record))
    }

    /// Returns the record with the smallest timestamp strictly greater
    /// than `*cursor`, advancing `*cursor` to that record's timestamp.
    pub fn next_chronological(
        &self,
        record_type: RecordType,
        cursor: &mut Timestamp,
    ) -> Result<(Nonce, Record)> {
        let trees = self.trees(record_type);
        let sentinel = chronological_sentinel(cursor);
        let mut iter = trees
            .ts_index
            .range((std::ops::Bound::Excluded(sentinel), std::ops::Bound::Unbounded));
        let (key, _) = iter.next().transpose()?.ok_or(JalError::NotFound)?;
        let nonce = decode_ts_index_key(&key)?;
        let record = self.get(record_type, &nonce)?;
        *cursor = record.timestamp.clone();
        Ok((nonce, record))
    }

    /// Sets `sent`. Rejects clearing `sent` on a record that is already
    /// `confirmed`, since that would violate `confirmed ⇒ sent`.
    pub fn mark_sent(&self, record_type: RecordType, nonce: &Nonce, value: bool) -> Result<()> {
        let trees = self.trees(record_type);
        let outcome = (&trees.primary, &trees.sent_index).transaction(|(primary, sent_index)| {
            let bytes = primary
                .get(nonce.sort_key())?
                .ok_or_else(|| ConflictableTransactionError::Abort(JalError::NotFound))?;
            let mut rec: Record = bincode::deserialize(&bytes)
                .map_err(|e| ConflictableTransactionError::Abort(JalError::Encoding(e)))?;
            if !value && rec.confirmed {
                return Err(ConflictableTransactionError::Abort(JalError::invalid(
                    "cannot clear sent on a confirmed record",
                )));
            }
            sent_index.remove(flag_index_key(rec.sent, nonce))?;
            rec.sent = value;
            sent_index.insert(flag_index_key(rec.sent, nonce), &[][..])?;
            let bytes = bincode::serialize(&rec)
                .map_err(|e| ConflictableTransactionError::Abort(JalError::Encoding(e)))?;
            primary.insert(nonce.sort_key(), bytes)?;
            Ok(())
        });
        unwrap_txn(outcome)
    }

    /// Sets `confirmed = true`. Requires `sent = true` already.
    pub fn mark_confirmed(&self, record_type: RecordType, nonce: &Nonce) -> Result<()> {
        let trees = self.trees(record_type);
        let outcome =
            (&trees.primary, &trees.confirmed_index).transaction(|(primary, confirmed_index)| {
                let bytes = primary
                    .get(nonce.sort_key())?
                    .ok_or_else(|| ConflictableTransactionError::Abort(JalError::NotFound))?;
                let mut rec: Record = bincode::deserialize(&bytes)
                    .map_err(|e| ConflictableTransactionError::Abort(JalError::Encoding(e)))?;
                if !rec.sent {
                    return Err(ConflictableTransactionError::Abort(JalError::invalid(
                        "cannot confirm a record that was never sent",
                    )));
                }
                confirmed_index.remove(flag_index_key(rec.confirmed, nonce))?;
                rec.confirmed = true;
                confirmed_index.insert(flag_index_key(rec.confirmed, nonce), &[][..])?;
                let bytes = bincode::serialize(&rec)
                    .map_err(|e| ConflictableTransactionError::Abort(JalError::Encoding(e)))?;
                primary.insert(nonce.sort_key(), bytes)?;
                Ok(())
            });
        unwrap_txn(outcome)
    }

    /// Sets `synced = true`. Requires `confirmed = true` already.
    pub fn mark_synced(&self, record_type: RecordType, nonce: &Nonce) -> Result<()> {
        let trees = self.trees(record_type);
        let outcome = trees.primary.transaction(|primary| {
            let bytes = primary
                .get(nonce.sort_key())?
                .ok_or_else(|| ConflictableTransactionError::Abort(JalError::NotFound))?;
            let mut rec: Record = bincode::deserialize(&bytes)
                .map_err(|e| ConflictableTransactionError::Abort(JalError::Encoding(e)))?;
            if !rec.confirmed {
                return Err(ConflictableTransactionError::Abort(JalError::invalid(
                    "cannot sync a record that was never confirmed",
                )));
            }
            rec.synced = true;
            let bytes = bincode::serialize(&rec)
                .map_err(|e| ConflictableTransactionError::Abort(JalError::Encoding(e)))?;
            primary.insert(nonce.sort_key(), bytes)?;
            Ok(())
        });
        unwrap_txn(outcome)
    }

    /// Clears `sent` (and, to preserve `confirmed ⇒ sent`, `confirmed`
    /// too) on every record with `synced = false`. Called once at the
    /// start of every new archive-mode session to undo tentative
    /// markings left behind by a crashed previous session.
    ///
    /// The candidate scan reads the primary tree directly (not inside a
    /// transaction — sled's transactional trees don't expose a general
    /// iterator); each matching record is then cleared in its own small
    /// transaction, so a concurrent insert never observes a half-updated
    /// record.
    pub fn mark_unsynced_unsent(&self, record_type: RecordType) -> Result<()> {
        let trees = self.trees(record_type);
        let mut candidates = Vec::new();
        for kv in trees.primary.iter() {
            let (key, bytes) = kv?;
            let rec: Record = bincode::deserialize(&bytes)?;
            if !rec.synced && (rec.sent || rec.confirmed) {
                candidates.push(decode_nonce_sort_key(&key)?);
            }
        }

        for nonce in candidates {
            let outcome = (&trees.primary, &trees.sent_index, &trees.confirmed_index)
                .transaction(|(primary, sent_index, confirmed_index)| {
                    let bytes = match primary.get(nonce.sort_key())? {
                        Some(b) => b,
                        None => return Ok(()), // raced with something else; nothing to fix
                    };
                    let mut rec: Record = bincode::deserialize(&bytes).map_err(|e| {
                        ConflictableTransactionError::Abort(JalError::Encoding(e))
                    })?;
                    if rec.synced {
                        return Ok(());
                    }
                    sent_index.remove(flag_index_key(rec.sent, &nonce))?;
                    confirmed_index.remove(flag_index_key(rec.confirmed, &nonce))?;
                    rec.sent = false;
                    rec.confirmed = false;
                    sent_index.insert(flag_index_key(false, &nonce), &[][..])?;
                    confirmed_index.insert(flag_index_key(false, &nonce), &[][..])?;
                    let bytes = bincode::serialize(&rec).map_err(|e| {
                        ConflictableTransactionError::Abort(JalError::Encoding(e))
                    })?;
                    primary.insert(nonce.sort_key(), bytes)?;
                    Ok(())
                });
            unwrap_txn(outcome)?;
        }
        Ok(())
    }

    /// Updates the confirmation watermark for `(remote_host, record_type)`.
    /// `E_SID` if `nonce` is after the next available nonce, `E_ALREADY_CONFED`
    /// if the watermark is already `>= nonce` (idempotent replay), `E_CORRUPTED`
    /// if the current-maximum-nonce record is missing from the primary.
    pub fn store_confirmed_watermark(
        &self,
        record_type: RecordType,
        remote_host: &str,
        nonce: &Nonce,
    ) -> Result<()> {
        let trees = self.trees(record_type);
        let outcome =
            (&trees.primary, &trees.meta, &trees.watermark).transaction(|(primary, meta, watermark)| {
                let max_nonce = match meta.get(META_MAX_NONCE)? {
                    Some(v) => {
                        let s = std::str::from_utf8(&v).map_err(|_| {
                            ConflictableTransactionError::Abort(JalError::corrupted(
                                "max_nonce is not valid utf-8",
                            ))
                        })?;
                        Nonce::parse(s).ok_or_else(|| {
                            ConflictableTransactionError::Abort(JalError::corrupted(
                                "max_nonce is not a valid nonce",
                            ))
                        })?
                    }
                    None => {
                        return Err(ConflictableTransactionError::Abort(JalError::OutOfSequence));
                    }
                };
                if *nonce > max_nonce {
                    return Err(ConflictableTransactionError::Abort(JalError::OutOfSequence));
                }
                if primary.get(max_nonce.sort_key())?.is_none() {
                    return Err(ConflictableTransactionError::Abort(JalError::corrupted(
                        "maximum-nonce record is missing",
                    )));
                }
                if let Some(existing) = watermark.get(remote_host.as_bytes())? {
                    let existing_str = std::str::from_utf8(&existing).map_err(|_| {
                        ConflictableTransactionError::Abort(JalError::corrupted(
                            "watermark is not valid utf-8",
                        ))
                    })?;
                    let existing_nonce = Nonce::parse(existing_str).ok_or_else(|| {
                        ConflictableTransactionError::Abort(JalError::corrupted(
                            "watermark is not a valid nonce",
                        ))
                    })?;
                    if existing_nonce >= *nonce {
                        return Err(ConflictableTransactionError::Abort(
                            JalError::AlreadyConfirmed,
                        ));
                    }
                }
                watermark.insert(remote_host.as_bytes(), nonce.as_str().as_bytes())?;
                Ok(())
            });
        unwrap_txn(outcome)
    }
}

impl TypeTrees {
    fn open(db: &sled::Db, record_type: RecordType) -> Result<Self> {
        let name = record_type.as_str();
        Ok(TypeTrees {
            primary: db.open_tree(format!("{name}_primary"))?,
            ts_index: db.open_tree(format!("{name}_idx_timestamp"))?,
            nonce_ts_index: db.open_tree(format!("{name}_idx_nonce_timestamp"))?,
            uuid_index: db.open_tree(format!("{name}_idx_uuid"))?,
            sent_index: db.open_tree(format!("{name}_idx_sent"))?,
            confirmed_index: db.open_tree(format!("{name}_idx_confirmed"))?,
            netnonce_index: db.open_tree(format!("{name}_idx_netnonce"))?,
            watermark: db.open_tree(format!("{name}_watermark"))?,
            meta: db.open_tree(format!("{name}_meta"))?,
        })
    }
}

fn unwrap_txn<T>(r: std::result::Result<T, TransactionError<JalError>>) -> Result<T> {
    r.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(se) => JalError::Store(se),
    })
}

fn decode_nonce_sort_key(key: &[u8]) -> Result<Nonce> {
    if key.len() < 2 {
        return Err(JalError::corrupted("truncated nonce key"));
    }
    let len = u16::from_be_bytes([key[0], key[1]]) as usize;
    let digits = key
        .get(2..2 + len)
        .ok_or_else(|| JalError::corrupted("truncated nonce key"))?;
    let s = std::str::from_utf8(digits)
        .map_err(|_| JalError::corrupted("nonce key is not valid utf-8"))?;
    Nonce::parse(s).ok_or_else(|| JalError::corrupted("nonce key is not a valid nonce"))
}

fn decode_flag_index_key(key: &[u8]) -> Result<Nonce> {
    if key.is_empty() {
        return Err(JalError::corrupted("truncated flag index key"));
    }
    decode_nonce_sort_key(&key[1..])
}

fn decode_ts_index_key(key: &[u8]) -> Result<Nonce> {
    if key.len() < 19 {
        return Err(JalError::corrupted("truncated timestamp index key"));
    }
    decode_nonce_sort_key(&key[19..])
}

fn chronological_sentinel(cursor: &Timestamp) -> Vec<u8> {
    let mut key = cursor.sort_key().to_vec();
    key.extend(std::iter::repeat(0xFFu8).take(40));
    key
}

fn ts_index_key(timestamp: &Timestamp, nonce: &Nonce) -> Vec<u8> {
    let mut key = timestamp.sort_key().to_vec();
    key.extend_from_slice(&nonce.sort_key());
    key
}

fn uuid_index_key(uuid: &uuid::Uuid, nonce: &Nonce) -> Vec<u8> {
    let mut key = uuid.as_bytes().to_vec();
    key.extend_from_slice(&nonce.sort_key());
    key
}

fn flag_index_key(flag: bool, nonce: &Nonce) -> Vec<u8> {
    let mut key = vec![flag as u8];
    key.extend_from_slice(&nonce.sort_key());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use uuid::Uuid;

    fn store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn new_record(ts: &str) -> NewRecord {
        let mut record = NewRecord::local(
            RecordType::Audit,
            Uuid::new_v4(),
            1234,
            "host.example",
            Timestamp::new(ts).unwrap(),
            Segment::memory(b"sys".to_vec()),
        );
        record.payload = Some(Segment::memory(b"abc".to_vec()));
        record
    }

    #[test]
    fn insert_and_fetch_round_trips() {
        let (_dir, store) = store();
        let nonce = store.insert(new_record("2024-01-01T00:00:00Z")).unwrap();
        let record = store.get(RecordType::Audit, &nonce).unwrap();
        assert_eq!(record.payload.unwrap().len(), 3);
    }

    #[test]
    fn nonces_strictly_increase() {
        let (_dir, store) = store();
        let n1 = store.insert(new_record("2024-01-01T00:00:00Z")).unwrap();
        let n2 = store.insert(new_record("2024-01-01T00:00:01Z")).unwrap();
        let n3 = store.insert(new_record("2024-01-01T00:00:02Z")).unwrap();
        assert!(n1 < n2);
        assert!(n2 < n3);
    }

    #[test]
    fn watermark_is_idempotent_and_rejects_future_nonce() {
        let (_dir, store) = store();
        let n1 = store.insert(new_record("2024-01-01T00:00:00Z")).unwrap();
        let n2 = store.insert(new_record("2024-01-01T00:00:01Z")).unwrap();
        let n3 = store.insert(new_record("2024-01-01T00:00:02Z")).unwrap();

        store
            .store_confirmed_watermark(RecordType::Audit, "host-a", &n2)
            .unwrap();
        assert!(matches!(
            store.store_confirmed_watermark(RecordType::Audit, "host-a", &n2),
            Err(JalError::AlreadyConfirmed)
        ));
        assert!(matches!(
            store.store_confirmed_watermark(RecordType::Audit, "host-a", &n1),
            Err(JalError::AlreadyConfirmed)
        ));
        let n4 = n3.next();
        assert!(matches!(
            store.store_confirmed_watermark(RecordType::Audit, "host-a", &n4),
            Err(JalError::OutOfSequence)
        ));
    }

    #[test]
    fn next_unsynced_returns_smallest_unsent_nonce() {
        let (_dir, store) = store();
        let n1 = store.insert(new_record("2024-01-01T00:00:00Z")).unwrap();
        let n2 = store.insert(new_record("2024-01-01T00:00:01Z")).unwrap();

        let (nonce, _) = store.next_unsynced(RecordType::Audit).unwrap();
        assert_eq!(nonce, n1);

        store.mark_sent(RecordType::Audit, &n1, true).unwrap();
        let (nonce, _) = store.next_unsynced(RecordType::Audit).unwrap();
        assert_eq!(nonce, n2);
    }

    #[test]
    fn next_chronological_advances_cursor_and_skips_earlier_records() {
        let (_dir, store) = store();
        store.insert(new_record("2024-01-01T00:00:00Z")).unwrap(); // before cursor
        let n2 = store.insert(new_record("2024-01-01T00:00:02Z")).unwrap();
        let n3 = store.insert(new_record("2024-01-01T00:00:03Z")).unwrap();

        let mut cursor = Timestamp::new("2024-01-01T00:00:01Z").unwrap();
        let (nonce, _) = store
            .next_chronological(RecordType::Audit, &mut cursor)
            .unwrap();
        assert_eq!(nonce, n2);
        assert_eq!(cursor.as_str(), "2024-01-01T00:00:02Z");

        let (nonce, _) = store
            .next_chronological(RecordType::Audit, &mut cursor)
            .unwrap();
        assert_eq!(nonce, n3);
    }

    #[test]
    fn mark_unsynced_unsent_clears_only_unsynced_records() {
        let (_dir, store) = store();
        let n1 = store.insert(new_record("2024-01-01T00:00:00Z")).unwrap();
        let n2 = store.insert(new_record("2024-01-01T00:00:01Z")).unwrap();

        store.mark_sent(RecordType::Audit, &n1, true).unwrap();
        store.mark_confirmed(RecordType::Audit, &n1).unwrap();
        store.mark_synced(RecordType::Audit, &n1).unwrap();

        store.mark_sent(RecordType::Audit, &n2, true).unwrap();

        store.mark_unsynced_unsent(RecordType::Audit).unwrap();

        let r1 = store.get(RecordType::Audit, &n1).unwrap();
        assert!(r1.sent && r1.synced && r1.confirmed);

        let r2 = store.get(RecordType::Audit, &n2).unwrap();
        assert!(!r2.sent && !r2.confirmed && !r2.synced);
    }

    #[test]
    fn confirmed_requires_sent_and_synced_requires_confirmed() {
        let (_dir, store) = store();
        let n1 = store.insert(new_record("2024-01-01T00:00:00Z")).unwrap();
        assert!(store.mark_confirmed(RecordType::Audit, &n1).is_err());
        store.mark_sent(RecordType::Audit, &n1, true).unwrap();
        assert!(store.mark_synced(RecordType::Audit, &n1).is_err());
        store.mark_confirmed(RecordType::Audit, &n1).unwrap();
        store.mark_synced(RecordType::Audit, &n1).unwrap();
    }
}
