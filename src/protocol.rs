//! The protocol state machine, as seen by the publishing side (the
//! subscribing side is symmetric). Modelled as a pure transition function
//! over an explicit state and event, returning an outcome enum rather
//! than unwinding, so a malformed or out-of-order message ends a session
//! cleanly instead of panicking.

use crate::error::JalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Initialising,
    AwaitingSubscribe,
    Streaming,
    Draining,
    Closed,
}

/// Inputs that drive a state transition, one variant per distinct thing
/// that can happen to a session.
#[derive(Debug)]
pub enum Event {
    /// An incoming connection handshakes and proposes terms we accept.
    HandshakeAccepted,
    /// The handshake's proposed terms were rejected (digest/encoding
    /// mismatch, or peer policy denial).
    HandshakeRejected,
    /// The peer's `subscribe` message arrived.
    SubscribeReceived,
    /// A record finished streaming and was added to the pending-digest
    /// list.
    RecordSent,
    /// A `digest(nonce, peer_digest)` arrived; `matched` reports whether
    /// it agreed with the locally computed digest.
    DigestReceived { matched: bool },
    /// A `sync(nonce)` arrived (archive mode only).
    SyncReceived,
    /// The publisher loop found no more candidate records and issued
    /// `finish`.
    NoMoreCandidates,
    /// Every pending digest was resolved while draining.
    PendingDigestsResolved,
    /// The pending-digest timeout elapsed while draining.
    DrainTimeout,
    /// The transport reported a disconnect.
    ConnectionDropped,
    /// The peer sent a message kind invalid for the current state.
    ProtocolViolation(String),
}

/// What the caller (the session) should do after a transition.
#[derive(Debug)]
pub enum Outcome {
    /// Stay open; no special action beyond the new state.
    Continue,
    /// The session ended normally.
    CloseClean,
    /// The session ended because of an error.
    CloseError(JalError),
}

/// Applies `event` to `state`, returning the new state and what the
/// caller should do. Digest mismatches and store-empty conditions never
/// close the session — only protocol violations and disconnects do.
pub fn transition(state: State, event: Event) -> (State, Outcome) {
    use Event::*;
    use State::*;

    match (state, event) {
        (Idle, HandshakeAccepted) => (Initialising, Outcome::Continue),
        (Idle, HandshakeRejected) => (Closed, Outcome::CloseClean),

        (Initialising, SubscribeReceived) => (Streaming, Outcome::Continue),
        // A valid handshake must be followed by awaiting-subscribe; this
        // transition models immediately receiving it with none of the
        // wait captured as a separate observable state for this function.
        (Initialising, ConnectionDropped) => (Closed, Outcome::CloseClean),

        (AwaitingSubscribe, SubscribeReceived) => (Streaming, Outcome::Continue),
        (AwaitingSubscribe, ConnectionDropped) => (Closed, Outcome::CloseClean),

        (Streaming, RecordSent) => (Streaming, Outcome::Continue),
        // Digest mismatch is per-record and non-fatal: the caller clears
        // the record's `sent` flag and stays in `Streaming`.
        (Streaming, DigestReceived { .. }) => (Streaming, Outcome::Continue),
        (Streaming, SyncReceived) => (Streaming, Outcome::Continue),
        (Streaming, NoMoreCandidates) => (Draining, Outcome::Continue),
        (Streaming, ConnectionDropped) => (Closed, Outcome::CloseClean),
        (Streaming, ProtocolViolation(msg)) => {
            (Closed, Outcome::CloseError(JalError::protocol(msg)))
        }

        (Draining, DigestReceived { .. }) => (Draining, Outcome::Continue),
        (Draining, SyncReceived) => (Draining, Outcome::Continue),
        (Draining, PendingDigestsResolved) => (Closed, Outcome::CloseClean),
        (Draining, DrainTimeout) => (Closed, Outcome::CloseClean),
        (Draining, ConnectionDropped) => (Closed, Outcome::CloseClean),
        (Draining, ProtocolViolation(msg)) => {
            (Closed, Outcome::CloseError(JalError::protocol(msg)))
        }

        (_, ConnectionDropped) => (Closed, Outcome::CloseClean),
        (state, ProtocolViolation(msg)) => (
            Closed,
            Outcome::CloseError(JalError::protocol(format!("in state {state:?}: {msg}"))),
        ),

        (Closed, _) => (Closed, Outcome::CloseClean),

        (state, event) => (
            Closed,
            Outcome::CloseError(JalError::protocol(format!(
                "unexpected event {event:?} in state {state:?}"
            ))),
        ),
    }
}
