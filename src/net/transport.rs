//! The peer-facing network transport: accepts connections, runs the
//! handshake, and drives a [`Session`] to completion. One tokio task per
//! session, rather than a dedicated OS thread per connection, since
//! blocking disk/socket work here is handled by tokio's I/O driver.

use crate::config::Config;
use crate::digest::{self, DigestAlgorithm};
use crate::error::{JalError, Result};
use crate::feeder::PayloadFeeder;
use crate::net::codec::MessageCodec;
use crate::net::message::{
    DigestMsg, DigestResponseMsg, DigestStatus, FinishMsg, InitializeAckMsg, InitializeNackMsg,
    JournalResumeMsg, Message, ModeName, RecordFrameMsg, Role as WireRole, SubscribeMsg, SyncMsg,
};
use crate::peer_policy::{PeerPolicy, Role as PolicyRole};
use crate::record::{NewRecord, Record};
use crate::segment::Segment;
use crate::session::{Encoding, Mode, Role as SessionRole, Session};
use crate::store::RecordStore;
use crate::types::{Nonce, RecordType};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use uuid::Uuid;

/// Any duplex byte stream the codec can frame over: a plain `TcpStream`
/// when TLS is disabled, or a `tokio_rustls` `TlsStream<TcpStream>` when
/// `enable_tls` is set. Kept generic rather than boxed, since every
/// session already lives on its own tokio task and monomorphising per
/// stream kind costs nothing extra there.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Conn for T {}

/// Guards against a second live subscribe for the same (host, record
/// type) pair while the first is still active; a second subscribe is
/// rejected as invalid rather than silently displacing the first.
#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<HashSet<(String, RecordType)>>,
}

impl SessionRegistry {
    pub fn try_register(&self, host: &str, record_type: RecordType) -> Result<()> {
        let mut active = self.active.lock().expect("registry mutex poisoned");
        if !active.insert((host.to_string(), record_type)) {
            return Err(JalError::invalid(format!(
                "a session for {host}/{record_type} is already active"
            )));
        }
        Ok(())
    }

    pub fn unregister(&self, host: &str, record_type: RecordType) {
        self.active
            .lock()
            .expect("registry mutex poisoned")
            .remove(&(host.to_string(), record_type));
    }
}

/// Everything a connection handler needs, threaded through explicitly
/// rather than reached for via a global.
pub struct DaemonContext {
    pub store: Arc<RecordStore>,
    pub peer_policy: PeerPolicy,
    pub registry: SessionRegistry,
    pub config: Config,
    pub exiting: AtomicBool,
    /// `Some` when `config.enable_tls` is set; every accepted connection
    /// is then wrapped before the handshake runs.
    pub tls_acceptor: Option<TlsAcceptor>,
}

pub async fn run_acceptor(listener: TcpListener, ctx: Arc<DaemonContext>) -> Result<()> {
    loop {
        if ctx.exiting.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (stream, addr) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = match &ctx.tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => handle_connection(tls_stream, addr, ctx).await,
                    Err(e) => Err(JalError::Tls(e.to_string())),
                },
                None => handle_connection(stream, addr, ctx).await,
            };
            if let Err(e) = result {
                tracing::warn!(target: "jald", remote = %addr, error = %e, "session ended with error");
            }
        });
    }
}

async fn handle_connection<S: Conn>(stream: S, peer_addr: SocketAddr, ctx: Arc<DaemonContext>) -> Result<()> {
    let mut framed = Framed::new(stream, MessageCodec::new());

    let init = match framed.next().await {
        Some(Ok(Message::Initialize(init))) => init,
        Some(Ok(_)) => return Err(JalError::protocol("expected initialize")),
        Some(Err(e)) => return Err(JalError::protocol(e.to_string())),
        None => return Err(JalError::Disconnected),
    };

    let remote_host = peer_addr.ip().to_string();
    let policy_role = match init.role {
        WireRole::Publish => PolicyRole::Publish,
        WireRole::Subscribe => PolicyRole::Subscribe,
    };
    if let Err(e) = ctx
        .peer_policy
        .check(None, Some(peer_addr.ip()), policy_role, init.record_type)
    {
        framed
            .send(Message::InitializeNack(InitializeNackMsg {
                reason: e.to_string(),
            }))
            .await
            .ok();
        return Err(e);
    }

    let algorithm = init
        .digest_algorithms
        .iter()
        .find_map(|uri| digest::by_uri(uri))
        .ok_or_else(|| JalError::protocol("no supported digest algorithm offered"))?;
    let encoding = init
        .encodings
        .first()
        .copied()
        .ok_or_else(|| JalError::protocol("no encoding offered"))?;

    framed
        .send(Message::InitializeAck(InitializeAckMsg {
            digest_algorithm: algorithm.algorithm_uri().to_string(),
            encoding,
        }))
        .await
        .map_err(|e| JalError::protocol(e.to_string()))?;

    ctx.registry.try_register(&remote_host, init.record_type)?;
    let result = match policy_role {
        PolicyRole::Subscribe => {
            run_publisher_side(
                &mut framed,
                &ctx,
                remote_host.clone(),
                init.record_type,
                algorithm,
                encoding.into(),
            )
            .await
        }
        PolicyRole::Publish => {
            run_subscriber_side(&mut framed, &ctx, remote_host.clone(), init.record_type, algorithm).await
        }
    };
    ctx.registry.unregister(&remote_host, init.record_type);
    result
}

/// We are publishing to a peer who subscribed to us.
async fn run_publisher_side<S: Conn>(
    framed: &mut Framed<S, MessageCodec>,
    ctx: &Arc<DaemonContext>,
    remote_host: String,
    record_type: RecordType,
    algorithm: Box<dyn DigestAlgorithm>,
    encoding: Encoding,
) -> Result<()> {
    let subscribe = match framed.next().await {
        Some(Ok(Message::Subscribe(s))) => s,
        Some(Ok(Message::JournalResume(resume))) => {
            return run_journal_resume(framed, ctx, record_type, algorithm, resume).await;
        }
        _ => return Err(JalError::protocol("expected subscribe")),
    };

    let mode = subscribe.mode.mode();
    let live_start = subscribe.mode.live_timestamp();
    let mut session = Session::new(
        remote_host,
        record_type,
        SessionRole::Publisher,
        mode,
        live_start,
        encoding,
        algorithm,
        ctx.store.clone(),
    );
    session.start()?;
    session.on_subscribe()?;

    let poll_interval = Duration::from_secs(ctx.config.poll_time.max(1));
    let drain_timeout = Duration::from_secs(ctx.config.pending_digest_timeout.max(1));

    // The backlog is never "finished" by running dry — more records may
    // always be inserted later. The only thing that ends this loop is the
    // session shutting down; an empty store just means block briefly and
    // look again.
    'streaming: loop {
        if ctx.exiting.load(Ordering::SeqCst) {
            break 'streaming;
        }
        if session.pending_count() >= ctx.config.pending_digest_max {
            drain_one_message(framed, &mut session, drain_timeout).await?;
            continue;
        }
        match session.next_candidate()? {
            Some((nonce, record)) => {
                send_record(framed, &mut session, &nonce, &record).await?;
            }
            None => {
                tokio::time::sleep(poll_interval).await;
            }
        }
        while let Ok(Some(msg)) = timeout(Duration::from_millis(0), framed.next()).await {
            apply_inbound(framed, &mut session, msg?).await?;
        }
    }

    framed
        .send(Message::Finish(FinishMsg))
        .await
        .map_err(|e| JalError::protocol(e.to_string()))?;
    session.no_more_candidates()?;

    // Draining isn't done once every digest resolves: a `sync` for each
    // confirmed record still has to arrive (archive mode only; live mode
    // never populates `awaiting_sync`), or records end up confirmed but
    // never synced.
    while session.pending_count() > 0 || session.awaiting_sync_count() > 0 {
        if drain_one_message(framed, &mut session, drain_timeout).await.is_err() {
            session.finish(true)?;
            return Ok(());
        }
    }
    session.finish(false)?;
    Ok(())
}

async fn send_record<S: Conn>(
    framed: &mut Framed<S, MessageCodec>,
    session: &mut Session,
    nonce: &Nonce,
    record: &Record,
) -> Result<()> {
    let mut feeder = PayloadFeeder::new(nonce, record, session.digest_algorithm(), 0)?;
    framed
        .send(Message::Record(RecordFrameMsg::Header {
            nonce: nonce.clone(),
            record_type: record.record_type,
            total_estimate: feeder.estimated_size(),
        }))
        .await
        .map_err(|e| JalError::protocol(e.to_string()))?;

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = feeder.fill(&mut buf)?;
        if n == 0 {
            break;
        }
        framed
            .send(Message::Record(RecordFrameMsg::Chunk(buf[..n].to_vec())))
            .await
            .map_err(|e| JalError::protocol(e.to_string()))?;
    }
    framed
        .send(Message::Record(RecordFrameMsg::Boundary))
        .await
        .map_err(|e| JalError::protocol(e.to_string()))?;

    let digest = feeder.finish()?;
    session.send_next_record(nonce.clone(), digest)?;
    Ok(())
}

async fn drain_one_message<S: Conn>(
    framed: &mut Framed<S, MessageCodec>,
    session: &mut Session,
    drain_timeout: Duration,
) -> Result<()> {
    match timeout(drain_timeout, framed.next()).await {
        Ok(Some(Ok(msg))) => apply_inbound(framed, session, msg).await,
        Ok(Some(Err(e))) => Err(JalError::protocol(e.to_string())),
        Ok(None) => Err(JalError::Disconnected),
        Err(_) => Err(JalError::protocol("pending digest timeout")),
    }
}

/// Applies one inbound message to `session` and, for a `digest`, replies
/// with the `digest-response` the subscriber is waiting on before it will
/// send `sync` back.
async fn apply_inbound<S: Conn>(
    framed: &mut Framed<S, MessageCodec>,
    session: &mut Session,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Digest(DigestMsg { entries }) => {
            let mut responses = Vec::with_capacity(entries.len());
            for (nonce, digest) in entries {
                let matched = session.on_digest(&nonce, &digest)?;
                let status = if matched {
                    DigestStatus::Confirmed
                } else {
                    DigestStatus::Invalid
                };
                responses.push((nonce, status));
            }
            framed
                .send(Message::DigestResponse(DigestResponseMsg { entries: responses }))
                .await
                .map_err(|e| JalError::protocol(e.to_string()))
        }
        Message::Sync(SyncMsg { nonce }) => session.on_sync(&nonce),
        Message::Finish(FinishMsg) => Ok(()),
        other => Err(JalError::protocol(format!(
            "unexpected message {} while draining",
            other.kind()
        ))),
    }
}

/// Resumes streaming a journal record from the byte offset the peer
/// already has, looked up by its network nonce. The digest only covers
/// the suffix actually sent this session, not the full payload.
async fn run_journal_resume<S: Conn>(
    framed: &mut Framed<S, MessageCodec>,
    ctx: &Arc<DaemonContext>,
    record_type: RecordType,
    algorithm: Box<dyn DigestAlgorithm>,
    resume: JournalResumeMsg,
) -> Result<()> {
    let (nonce, record) = ctx.store.get_by_network_nonce(record_type, &resume.network_nonce)?;
    let mut feeder = PayloadFeeder::new(&nonce, &record, algorithm.as_ref(), resume.offset)?;

    framed
        .send(Message::Record(RecordFrameMsg::Header {
            nonce: nonce.clone(),
            record_type,
            total_estimate: feeder.estimated_size(),
        }))
        .await
        .map_err(|e| JalError::protocol(e.to_string()))?;
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = feeder.fill(&mut buf)?;
        if n == 0 {
            break;
        }
        framed
            .send(Message::Record(RecordFrameMsg::Chunk(buf[..n].to_vec())))
            .await
            .map_err(|e| JalError::protocol(e.to_string()))?;
    }
    framed
        .send(Message::Record(RecordFrameMsg::Boundary))
        .await
        .map_err(|e| JalError::protocol(e.to_string()))?;
    framed
        .send(Message::Finish(FinishMsg))
        .await
        .map_err(|e| JalError::protocol(e.to_string()))?;
    feeder.finish()?;
    Ok(())
}

/// A peer is pushing records to us: receive frames, reassemble the
/// feeder's header/metadata/payload layout, insert tagged with the
/// sender's network nonce, and run the digest/digest-response/sync
/// handshake that confirms durable receipt.
async fn run_subscriber_side<S: Conn>(
    framed: &mut Framed<S, MessageCodec>,
    ctx: &Arc<DaemonContext>,
    remote_host: String,
    record_type: RecordType,
    algorithm: Box<dyn DigestAlgorithm>,
) -> Result<()> {
    loop {
        match framed.next().await {
            Some(Ok(Message::Record(RecordFrameMsg::Header { nonce: peer_nonce, .. }))) => {
                let mut raw = Vec::new();
                loop {
                    match framed.next().await {
                        Some(Ok(Message::Record(RecordFrameMsg::Chunk(bytes)))) => {
                            raw.extend_from_slice(&bytes)
                        }
                        Some(Ok(Message::Record(RecordFrameMsg::Boundary))) => break,
                        _ => return Err(JalError::protocol("malformed record frame")),
                    }
                }
                let parsed = parse_wire_record(&raw)?;
                let digest = digest::one_shot(algorithm.as_ref(), &parsed.payload);

                let mut new = NewRecord::local(
                    parsed.record_type,
                    Uuid::new_v4(),
                    std::process::id(),
                    remote_host.clone(),
                    crate::session::now_timestamp(),
                    Segment::memory(parsed.sys_metadata),
                );
                new.source = remote_host.clone();
                new.network_nonce = Some(peer_nonce);
                new.app_metadata = parsed.app_metadata.map(Segment::memory);
                new.payload = Some(Segment::memory(parsed.payload));
                let nonce = ctx.store.insert(new)?;

                framed
                    .send(Message::Digest(DigestMsg {
                        entries: vec![(nonce.clone(), digest)],
                    }))
                    .await
                    .map_err(|e| JalError::protocol(e.to_string()))?;

                match framed.next().await {
                    Some(Ok(Message::DigestResponse(DigestResponseMsg { entries }))) => {
                        if entries.iter().any(|(n, s)| *n == nonce && matches!(s, DigestStatus::Confirmed)) {
                            framed
                                .send(Message::Sync(SyncMsg { nonce }))
                                .await
                                .map_err(|e| JalError::protocol(e.to_string()))?;
                        } else {
                            tracing::warn!(
                                target: "jald",
                                record_type = %record_type,
                                remote_host = %remote_host,
                                %nonce,
                                "publisher reported our digest as invalid"
                            );
                        }
                    }
                    _ => return Err(JalError::protocol("expected digest-response")),
                }
            }
            Some(Ok(Message::Finish(FinishMsg))) => return Ok(()),
            Some(Ok(other)) => {
                return Err(JalError::protocol(format!(
                    "unexpected message {} while receiving",
                    other.kind()
                )))
            }
            Some(Err(e)) => return Err(JalError::protocol(e.to_string())),
            None => return Err(JalError::Disconnected),
        }
    }
}

struct ParsedWireRecord {
    record_type: RecordType,
    sys_metadata: Vec<u8>,
    app_metadata: Option<Vec<u8>>,
    payload: Vec<u8>,
}

/// Inverts [`crate::feeder`]'s header encoding plus its phase layout
/// (headers, sys-metadata, boundary, app-metadata, boundary, payload,
/// boundary) to recover the three segments from the concatenated bytes a
/// peer streamed to us.
fn parse_wire_record(raw: &[u8]) -> Result<ParsedWireRecord> {
    const BOUNDARY: &[u8] = crate::feeder::BOUNDARY;

    let header_end = raw
        .windows(2)
        .enumerate()
        .filter(|(_, w)| *w == b"\r\n")
        .nth(4)
        .map(|(i, _)| i + 2)
        .ok_or_else(|| JalError::protocol("truncated record headers"))?;
    let header_text = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| JalError::protocol("record headers are not valid utf-8"))?;

    let mut record_type = None;
    let mut sys_len = None;
    let mut app_len = None;
    let mut payload_len = None;
    for line in header_text.split("\r\n").filter(|l| !l.is_empty()) {
        let (key, value) = line
            .split_once(": ")
            .ok_or_else(|| JalError::protocol("malformed record header line"))?;
        match key {
            "record-type" => {
                record_type = Some(match value {
                    "journal" => RecordType::Journal,
                    "audit" => RecordType::Audit,
                    "log" => RecordType::Log,
                    _ => return Err(JalError::protocol("unknown record-type in header")),
                })
            }
            "sys-metadata-length" => sys_len = value.parse::<usize>().ok(),
            "app-metadata-length" => app_len = value.parse::<usize>().ok(),
            "payload-length" => payload_len = value.parse::<usize>().ok(),
            _ => {}
        }
    }
    let record_type = record_type.ok_or_else(|| JalError::protocol("missing record-type header"))?;
    let sys_len = sys_len.ok_or_else(|| JalError::protocol("missing sys-metadata-length header"))?;
    let app_len = app_len.ok_or_else(|| JalError::protocol("missing app-metadata-length header"))?;
    let payload_len = payload_len.ok_or_else(|| JalError::protocol("missing payload-length header"))?;

    let mut cursor = header_end;
    let take = |raw: &[u8], cursor: &mut usize, len: usize| -> Result<Vec<u8>> {
        let end = cursor
            .checked_add(len)
            .ok_or_else(|| JalError::protocol("record length overflow"))?;
        let slice = raw
            .get(*cursor..end)
            .ok_or_else(|| JalError::protocol("truncated record body"))?
            .to_vec();
        *cursor = end;
        Ok(slice)
    };
    let skip_boundary = |raw: &[u8], cursor: &mut usize| -> Result<()> {
        let end = *cursor + BOUNDARY.len();
        if raw.get(*cursor..end) != Some(BOUNDARY) {
            return Err(JalError::protocol("expected phase boundary"));
        }
        *cursor = end;
        Ok(())
    };

    let sys_metadata = take(raw, &mut cursor, sys_len)?;
    skip_boundary(raw, &mut cursor)?;
    let app_metadata = if app_len > 0 {
        let bytes = take(raw, &mut cursor, app_len)?;
        skip_boundary(raw, &mut cursor)?;
        Some(bytes)
    } else {
        None
    };
    let payload = take(raw, &mut cursor, payload_len)?;
    skip_boundary(raw, &mut cursor)?;

    Ok(ParsedWireRecord {
        record_type,
        sys_metadata,
        app_metadata,
        payload,
    })
}

#[allow(dead_code)]
fn subscribe_message(mode: Mode) -> SubscribeMsg {
    SubscribeMsg {
        mode: match mode {
            Mode::Archive => ModeName::Archive,
            Mode::Live => ModeName::Live {
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NewRecord;
    use crate::segment::Segment;
    use crate::types::Timestamp;
    use std::collections::HashMap;

    #[test]
    fn parse_wire_record_round_trips_feeder_output() {
        let mut new = NewRecord::local(
            RecordType::Audit,
            Uuid::new_v4(),
            1,
            "host.example",
            Timestamp::new("2024-01-01T00:00:00Z").unwrap(),
            Segment::memory(b"sysmeta".to_vec()),
        );
        new.app_metadata = Some(Segment::memory(b"appmeta".to_vec()));
        new.payload = Some(Segment::memory(b"the payload".to_vec()));
        let record = crate::record::build(new).unwrap();

        let nonce = Nonce::first();
        let algo = crate::digest::Sha256Algorithm;
        let mut feeder = PayloadFeeder::new(&nonce, &record, &algo, 0).unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = feeder.fill(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
        }

        let parsed = parse_wire_record(&raw).unwrap();
        assert_eq!(parsed.record_type, RecordType::Audit);
        assert_eq!(parsed.sys_metadata, b"sysmeta");
        assert_eq!(parsed.app_metadata.as_deref(), Some(&b"appmeta"[..]));
        assert_eq!(parsed.payload, b"the payload");
    }

    fn insert_audit(store: &RecordStore, seq: u32) -> Nonce {
        let mut new = NewRecord::local(
            RecordType::Audit,
            Uuid::new_v4(),
            std::process::id(),
            "local",
            Timestamp::new(format!("2024-01-01T00:00:{seq:02}Z")).unwrap(),
            Segment::memory(b"sys".to_vec()),
        );
        new.payload = Some(Segment::memory(format!("payload-{seq}").into_bytes()));
        store.insert(new).unwrap()
    }

    fn test_config(db_root: std::path::PathBuf) -> Config {
        Config {
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            db_root,
            schemas_root: None,
            private_key: None,
            public_cert: None,
            remote_cert_dir: None,
            pending_digest_max: 128,
            pending_digest_timeout: 2,
            poll_time: 1,
            pid_file: None,
            log_dir: None,
            peers: Vec::new(),
            enable_tls: false,
            daemonise: false,
            debug: false,
        }
    }

    /// Plays the missing other half of the archive handshake: subscribes,
    /// then for every record frame it receives, replies with a digest,
    /// waits for the digest-response, and sends sync. Stops once it has
    /// driven `expected` full round trips or the publisher sends `finish`.
    async fn drive_subscriber_peer(
        framed: &mut Framed<tokio::io::DuplexStream, MessageCodec>,
        expected: usize,
        algorithm: &dyn DigestAlgorithm,
    ) -> Vec<Nonce> {
        framed
            .send(Message::Subscribe(subscribe_message(Mode::Archive)))
            .await
            .unwrap();

        let mut synced = Vec::new();
        loop {
            match framed.next().await.unwrap().unwrap() {
                Message::Record(RecordFrameMsg::Header { nonce, .. }) => {
                    let mut raw = Vec::new();
                    loop {
                        match framed.next().await.unwrap().unwrap() {
                            Message::Record(RecordFrameMsg::Chunk(bytes)) => raw.extend_from_slice(&bytes),
                            Message::Record(RecordFrameMsg::Boundary) => break,
                            other => panic!("unexpected frame {}", other.kind()),
                        }
                    }
                    let parsed = parse_wire_record(&raw).unwrap();
                    let digest = digest::one_shot(algorithm, &parsed.payload);
                    framed
                        .send(Message::Digest(DigestMsg {
                            entries: vec![(nonce.clone(), digest)],
                        }))
                        .await
                        .unwrap();

                    match framed.next().await.unwrap().unwrap() {
                        Message::DigestResponse(DigestResponseMsg { entries }) => {
                            assert!(entries
                                .iter()
                                .any(|(n, s)| *n == nonce && matches!(s, DigestStatus::Confirmed)));
                        }
                        other => panic!("expected digest-response, got {}", other.kind()),
                    }
                    framed
                        .send(Message::Sync(SyncMsg { nonce: nonce.clone() }))
                        .await
                        .unwrap();
                    synced.push(nonce);
                    if synced.len() == expected {
                        return synced;
                    }
                }
                Message::Finish(FinishMsg) => return synced,
                other => panic!("unexpected message {} from publisher", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn archive_session_ends_with_every_record_sent_confirmed_and_synced() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).unwrap());
        let nonces: Vec<Nonce> = (0..3).map(|seq| insert_audit(&store, seq)).collect();

        let ctx = Arc::new(DaemonContext {
            store: store.clone(),
            peer_policy: PeerPolicy::new(HashMap::new()),
            registry: SessionRegistry::default(),
            config: test_config(dir.path().to_path_buf()),
            exiting: AtomicBool::new(false),
            tls_acceptor: None,
        });

        let (client, server) = tokio::io::duplex(1 << 20);
        let mut publisher_framed = Framed::new(server, MessageCodec::new());
        let mut peer_framed = Framed::new(client, MessageCodec::new());

        let publisher_ctx = ctx.clone();
        let publisher_task = tokio::spawn(async move {
            run_publisher_side(
                &mut publisher_framed,
                &publisher_ctx,
                "peer".to_string(),
                RecordType::Audit,
                Box::new(crate::digest::Sha256Algorithm),
                Encoding::Xml,
            )
            .await
        });

        let peer_task = tokio::spawn(async move {
            let algo = crate::digest::Sha256Algorithm;
            drive_subscriber_peer(&mut peer_framed, nonces.len(), &algo).await
        });

        let synced_nonces = peer_task.await.unwrap();
        ctx.exiting.store(true, Ordering::SeqCst);
        publisher_task.await.unwrap().unwrap();

        assert_eq!(synced_nonces.len(), 3);
        for nonce in synced_nonces {
            let record = store.get(RecordType::Audit, &nonce).unwrap();
            assert!(record.sent && record.confirmed && record.synced);
        }
    }
}
