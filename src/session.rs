//! [`Session`]: the state owned by one active conversation with one
//! remote peer for one record type.

use crate::digest::DigestAlgorithm;
use crate::error::{JalError, Result};
use crate::protocol::{self, Event, Outcome, State};
use crate::record::Record;
use crate::store::RecordStore;
use crate::types::{Nonce, RecordType, Timestamp};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Archive,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Xml,
    Exi,
}

/// One record sent but not yet digest-confirmed, in arrival order (the
/// pending-digest list is a FIFO: digests must be acknowledged in the
/// order their records were sent).
#[derive(Debug, Clone)]
struct PendingDigest {
    nonce: Nonce,
    local_digest: Vec<u8>,
}

/// A connected conversation with one peer, about one record type, bound
/// to one role and one mode for its whole lifetime.
pub struct Session {
    pub remote_host: String,
    pub record_type: RecordType,
    pub role: Role,
    pub mode: Mode,
    pub encoding: Encoding,
    digest_algorithm: Box<dyn DigestAlgorithm>,

    /// Live mode only; `None` in archive mode.
    timestamp_cursor: Option<Timestamp>,

    pending: VecDeque<PendingDigest>,
    /// Archive mode only: nonces sent this session that haven't yet had
    /// their `sync` arrive. Outlives digest confirmation — a record is
    /// only done draining once its `sync` is in, not merely once its
    /// digest is.
    awaiting_sync: HashSet<Nonce>,
    sent_seq: u64,
    state: State,
    errored: bool,
    closing: bool,

    store: Arc<RecordStore>,
}

impl Session {
    /// `live_start` is the subscriber-requested T0 for a live-mode
    /// session. Falling back to server-now only applies when the peer's
    /// subscribe omits a timestamp or sends one that doesn't parse.
    /// Ignored in archive mode.
    pub fn new(
        remote_host: impl Into<String>,
        record_type: RecordType,
        role: Role,
        mode: Mode,
        live_start: Option<Timestamp>,
        encoding: Encoding,
        digest_algorithm: Box<dyn DigestAlgorithm>,
        store: Arc<RecordStore>,
    ) -> Self {
        let timestamp_cursor = match mode {
            Mode::Live => Some(live_start.unwrap_or_else(now_timestamp)),
            Mode::Archive => None,
        };
        Session {
            remote_host: remote_host.into(),
            record_type,
            role,
            mode,
            encoding,
            digest_algorithm,
            timestamp_cursor,
            pending: VecDeque::new(),
            awaiting_sync: HashSet::new(),
            sent_seq: 0,
            state: State::Idle,
            errored: false,
            closing: false,
            store,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_ok(&self) -> bool {
        !self.errored && !self.closing && self.state != State::Closed
    }

    /// Handshake accepted; archive-mode sessions clear any tentative
    /// markings a crashed previous session left behind before awaiting
    /// `subscribe`.
    pub fn start(&mut self) -> Result<()> {
        if self.mode == Mode::Archive {
            self.store.mark_unsynced_unsent(self.record_type)?;
        }
        self.apply(Event::HandshakeAccepted)
    }

    pub fn on_subscribe(&mut self) -> Result<()> {
        self.apply(Event::SubscribeReceived)
    }

    /// Registers a record as sent, appending its locally computed digest
    /// to the pending-digest FIFO. In archive mode this also marks the
    /// record `sent = true` in the store, after transmission completes,
    /// never before.
    pub fn send_next_record(&mut self, nonce: Nonce, local_digest: Vec<u8>) -> Result<()> {
        if self.mode == Mode::Archive {
            self.store.mark_sent(self.record_type, &nonce, true)?;
            self.awaiting_sync.insert(nonce.clone());
        }
        self.pending.push_back(PendingDigest { nonce, local_digest });
        self.sent_seq += 1;
        self.apply(Event::RecordSent)
    }

    /// Picks the next candidate record per the session's mode, without
    /// marking it sent yet (that happens once the feeder actually
    /// finishes transmitting, via [`Session::send_next_record`]).
    pub fn next_candidate(&mut self) -> Result<Option<(Nonce, Record)>> {
        let result = match self.mode {
            Mode::Archive => self.store.next_unsynced(self.record_type),
            Mode::Live => {
                let cursor = self
                    .timestamp_cursor
                    .as_mut()
                    .expect("live mode always has a cursor");
                self.store.next_chronological(self.record_type, cursor)
            }
        };
        match result {
            Ok(found) => Ok(Some(found)),
            Err(JalError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// A `digest(nonce, peer_digest)` arrived. Compares it to the local
    /// digest recorded when the record was sent; on match, marks the
    /// record confirmed (archive mode only — live mode never touches
    /// store flags, since live is a view, not a delivery). On mismatch
    /// or an absent nonce, clears `sent` so the record will be re-sent;
    /// this is per-record and never closes the session.
    pub fn on_digest(&mut self, nonce: &Nonce, peer_digest: &[u8]) -> Result<bool> {
        let position = self.pending.iter().position(|p| &p.nonce == nonce);
        let matched = match position {
            Some(idx) => {
                let entry = self.pending.remove(idx).expect("position just found");
                entry.local_digest == peer_digest
            }
            None => false,
        };

        if matched {
            if self.mode == Mode::Archive {
                self.store.mark_confirmed(self.record_type, nonce)?;
            }
        } else {
            tracing::warn!(
                target: "jald",
                record_type = %self.record_type,
                remote_host = %self.remote_host,
                nonce = %nonce,
                peer_digest = %hex::encode(peer_digest),
                "digest mismatch, re-queuing record"
            );
            if self.mode == Mode::Archive {
                self.store.mark_sent(self.record_type, nonce, false)?;
                // Will be re-sent (and re-added here) by a later pass;
                // this delivery round will never see its sync.
                self.awaiting_sync.remove(nonce);
            }
        }
        self.apply(Event::DigestReceived { matched })?;
        Ok(matched)
    }

    /// `digest-response` acknowledges our own comparison back to the
    /// peer; purely a protocol acknowledgement, no store effect.
    pub fn on_digest_response(&mut self) -> Result<()> {
        Ok(())
    }

    /// A `sync(nonce)` arrived. Archive mode only; live-mode sessions
    /// accept the message but ignore it, since live mode never persists
    /// flags in the first place.
    pub fn on_sync(&mut self, nonce: &Nonce) -> Result<()> {
        if self.mode == Mode::Archive {
            self.store.mark_synced(self.record_type, nonce)?;
            self.awaiting_sync.remove(nonce);
        }
        self.apply(Event::SyncReceived)
    }

    pub fn no_more_candidates(&mut self) -> Result<()> {
        self.apply(Event::NoMoreCandidates)
    }

    /// All pending digests resolved or the drain timeout elapsed.
    pub fn finish(&mut self, timed_out: bool) -> Result<()> {
        self.closing = true;
        if timed_out {
            self.apply(Event::DrainTimeout)
        } else {
            self.apply(Event::PendingDigestsResolved)
        }
    }

    pub fn abort(&mut self, reason: impl Into<String>) -> Result<()> {
        self.errored = true;
        self.apply(Event::ProtocolViolation(reason.into()))
    }

    pub fn on_connection_dropped(&mut self) -> Result<()> {
        self.apply(Event::ConnectionDropped)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Archive mode only: how many sent records are still waiting on a
    /// `sync`. A caller draining a session must not finish while this is
    /// nonzero, even once every pending digest has resolved.
    pub fn awaiting_sync_count(&self) -> usize {
        self.awaiting_sync.len()
    }

    pub fn digest_algorithm(&self) -> &dyn DigestAlgorithm {
        self.digest_algorithm.as_ref()
    }

    fn apply(&mut self, event: Event) -> Result<()> {
        let (next_state, outcome) = protocol::transition(self.state, event);
        self.state = next_state;
        match outcome {
            Outcome::Continue | Outcome::CloseClean => Ok(()),
            Outcome::CloseError(e) => {
                self.errored = true;
                Err(e)
            }
        }
    }
}

pub(crate) fn now_timestamp() -> Timestamp {
    let now = chrono::Utc::now();
    Timestamp::new(now.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .expect("chrono RFC3339 output is always a valid XML dateTime")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Sha256Algorithm;
    use crate::record::NewRecord;
    use crate::segment::Segment;
    use uuid::Uuid;

    fn test_store() -> (tempfile::TempDir, Arc<RecordStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).unwrap());
        (dir, store)
    }

    fn insert_audit(store: &RecordStore, ts: &str) -> Nonce {
        let mut new = NewRecord::local(
            RecordType::Audit,
            Uuid::new_v4(),
            1,
            "h",
            Timestamp::new(ts).unwrap(),
            Segment::memory(b"sys".to_vec()),
        );
        new.payload = Some(Segment::memory(b"payload".to_vec()));
        store.insert(new).unwrap()
    }

    fn session(store: Arc<RecordStore>, mode: Mode) -> Session {
        Session::new(
            "peer-a",
            RecordType::Audit,
            Role::Publisher,
            mode,
            None,
            Encoding::Xml,
            Box::new(Sha256Algorithm),
            store,
        )
    }

    #[test]
    fn archive_round_trip_confirms_and_syncs() {
        let (_dir, store) = test_store();
        let nonce = insert_audit(&store, "2024-01-01T00:00:00Z");
        let mut session = session(store.clone(), Mode::Archive);

        session.start().unwrap();
        session.on_subscribe().unwrap();

        let (n, _record) = session.next_candidate().unwrap().unwrap();
        assert_eq!(n, nonce);
        let digest = vec![1, 2, 3];
        session.send_next_record(n.clone(), digest.clone()).unwrap();
        session.on_digest(&n, &digest).unwrap();
        session.on_sync(&n).unwrap();

        let record = store.get(RecordType::Audit, &n).unwrap();
        assert!(record.sent && record.confirmed && record.synced);
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn digest_mismatch_requeues_without_closing() {
        let (_dir, store) = test_store();
        let nonce = insert_audit(&store, "2024-01-01T00:00:00Z");
        let mut session = session(store.clone(), Mode::Archive);
        session.start().unwrap();
        session.on_subscribe().unwrap();

        session.send_next_record(nonce.clone(), vec![9, 9, 9]).unwrap();
        session.on_digest(&nonce, &[1, 1, 1]).unwrap();

        assert!(session.is_ok());
        let record = store.get(RecordType::Audit, &nonce).unwrap();
        assert!(!record.sent && !record.confirmed);
    }

    #[test]
    fn live_mode_never_mutates_store_flags() {
        let (_dir, store) = test_store();
        let mut session = session(store.clone(), Mode::Live);
        session.start().unwrap();
        session.on_subscribe().unwrap();

        let future_ts = Timestamp::new("2999-01-01T00:00:00Z").unwrap();
        let nonce = insert_audit(&store, future_ts.as_str());

        let (n, _) = session.next_candidate().unwrap().unwrap();
        assert_eq!(n, nonce);
        session.send_next_record(n.clone(), vec![1]).unwrap();
        session.on_digest(&n, &[1]).unwrap();

        let record = store.get(RecordType::Audit, &n).unwrap();
        assert!(!record.sent && !record.confirmed && !record.synced);
    }

    #[test]
    fn live_mode_tails_from_the_subscriber_supplied_timestamp() {
        let (_dir, store) = test_store();
        let t0 = Timestamp::new("2024-06-01T12:00:00Z").unwrap();
        insert_audit(&store, "2024-06-01T11:59:59Z"); // before T0: must not appear
        let r2 = insert_audit(&store, "2024-06-01T12:00:01Z");
        let r3 = insert_audit(&store, "2024-06-01T12:00:02Z");

        let mut session = Session::new(
            "peer-a",
            RecordType::Audit,
            Role::Publisher,
            Mode::Live,
            Some(t0),
            Encoding::Xml,
            Box::new(Sha256Algorithm),
            store,
        );
        session.start().unwrap();
        session.on_subscribe().unwrap();

        let (n, _) = session.next_candidate().unwrap().unwrap();
        assert_eq!(n, r2);
        let (n, _) = session.next_candidate().unwrap().unwrap();
        assert_eq!(n, r3);
        assert!(session.next_candidate().unwrap().is_none());
    }
}
