//! The payload feeder: a resumable producer of one record's wire bytes,
//! modelled as a phase + offset state machine rather than a
//! language-level generator, so a session's task can suspend and resume
//! it at any buffer boundary.

use crate::digest::{DigestAlgorithm, DigestContext};
use crate::error::{JalError, Result};
use crate::record::Record;
use crate::types::Nonce;
use std::io::Read;

/// Separates adjacent phases on the wire. Not part of the payload digest.
pub const BOUNDARY: &[u8] = b"BREAK\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Headers,
    SysMetadata,
    BoundaryAfterSysMetadata,
    AppMetadata,
    BoundaryAfterAppMetadata,
    Payload,
    BoundaryAfterPayload,
    Done,
}

/// Produces a record's serialised bytes on demand. The caller supplies a
/// destination buffer of any size and repeatedly calls `fill`; the feeder
/// fills as much as it can per call and reports how much it wrote.
///
/// Computes a digest over *only* the payload bytes it emits, using the
/// session's chosen [`DigestAlgorithm`]. On journal-resume, construction
/// starts at `resume_offset` into the payload and the digest only covers
/// the suffix actually sent this session, not the whole payload.
pub struct PayloadFeeder {
    headers: Vec<u8>,
    sys_metadata: Vec<u8>,
    app_metadata: Vec<u8>,
    payload_reader: Option<crate::segment::SegmentReader>,
    /// Bytes still to be emitted from the payload segment this session
    /// (total payload length minus any resume offset), for
    /// [`PayloadFeeder::estimated_size`] only.
    payload_len: u64,
    phase: Phase,
    phase_offset: usize,
    digest_ctx: Option<Box<dyn DigestContext>>,
    errored: bool,
}

impl PayloadFeeder {
    pub fn new(nonce: &Nonce, record: &Record, algorithm: &dyn DigestAlgorithm, resume_offset: u64) -> Result<Self> {
        let headers = encode_headers(nonce, record);
        let sys_metadata = match &record.sys_metadata {
            crate::segment::Segment::Memory(b) => b.clone(),
            crate::segment::Segment::File { .. } => {
                return Err(JalError::invalid("system metadata must be in-memory"))
            }
        };
        let app_metadata = match &record.app_metadata {
            Some(crate::segment::Segment::Memory(b)) => b.clone(),
            Some(crate::segment::Segment::File { .. }) => {
                return Err(JalError::invalid("app metadata must be in-memory"))
            }
            None => Vec::new(),
        };
        let payload_reader = match &record.payload {
            Some(segment) => Some(segment.reader(resume_offset)?),
            None => None,
        };
        let payload_len = record
            .payload
            .as_ref()
            .map(|s| s.len().saturating_sub(resume_offset))
            .unwrap_or(0);

        Ok(PayloadFeeder {
            headers,
            sys_metadata,
            app_metadata,
            payload_reader,
            payload_len,
            phase: Phase::Headers,
            phase_offset: 0,
            digest_ctx: Some(algorithm.new_context()),
            errored: false,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Advisory total-size estimate: sum of segment lengths plus boundary
    /// count times boundary length, saturating rather than overflowing.
    /// Never used by the transport to decide when to stop reading.
    pub fn estimated_size(&self) -> u64 {
        let mut total = self.headers.len() as u64;
        total = total.saturating_add(self.sys_metadata.len() as u64);
        total = total.saturating_add(self.app_metadata.len() as u64);
        total = total.saturating_add(self.payload_len);
        total = total.saturating_add(BOUNDARY.len() as u64 * 3);
        total
    }

    /// Fills `buf` with as many bytes as are available right now, moving
    /// through phases as each is exhausted. Returns the number of bytes
    /// written, which may be zero only when `is_finished()` is true.
    pub fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.errored {
            return Err(JalError::protocol("feeder is in an errored state"));
        }
        let mut written = 0;
        while written < buf.len() && self.phase != Phase::Done {
            let n = match self.phase {
                Phase::Headers
                | Phase::SysMetadata
                | Phase::BoundaryAfterSysMetadata
                | Phase::AppMetadata
                | Phase::BoundaryAfterAppMetadata => self.fill_from_owned_slice(&buf[written..]),
                Phase::Payload => match self.fill_payload(&mut buf[written..]) {
                    Ok(n) => n,
                    Err(e) => {
                        self.errored = true;
                        return Err(e);
                    }
                },
                Phase::BoundaryAfterPayload => self.fill_from_owned_slice(&buf[written..]),
                Phase::Done => 0,
            };
            if n == 0 {
                self.advance_phase();
            } else {
                written += n;
            }
        }
        Ok(written)
    }

    fn current_phase_bytes(&self) -> Option<&[u8]> {
        match self.phase {
            Phase::Headers => Some(&self.headers),
            Phase::SysMetadata => Some(&self.sys_metadata),
            Phase::AppMetadata => Some(&self.app_metadata),
            Phase::BoundaryAfterSysMetadata
            | Phase::BoundaryAfterAppMetadata
            | Phase::BoundaryAfterPayload => Some(BOUNDARY),
            Phase::Payload | Phase::Done => None,
        }
    }

    fn fill_from_owned_slice(&mut self, dest: &mut [u8]) -> usize {
        let Some(src) = self.current_phase_bytes() else {
            return 0;
        };
        let remaining = &src[self.phase_offset.min(src.len())..];
        let n = remaining.len().min(dest.len());
        dest[..n].copy_from_slice(&remaining[..n]);
        self.phase_offset += n;
        n
    }

    fn fill_payload(&mut self, dest: &mut [u8]) -> Result<usize> {
        let Some(reader) = self.payload_reader.as_mut() else {
            return Ok(0);
        };
        let n = reader.read(dest)?;
        if n > 0 {
            if let Some(ctx) = self.digest_ctx.as_mut() {
                ctx.update(&dest[..n]);
            }
        }
        Ok(n)
    }

    fn advance_phase(&mut self) {
        self.phase = match self.phase {
            Phase::Headers => Phase::SysMetadata,
            Phase::SysMetadata => Phase::BoundaryAfterSysMetadata,
            Phase::BoundaryAfterSysMetadata => Phase::AppMetadata,
            Phase::AppMetadata => Phase::BoundaryAfterAppMetadata,
            Phase::BoundaryAfterAppMetadata => Phase::Payload,
            Phase::Payload => Phase::BoundaryAfterPayload,
            Phase::BoundaryAfterPayload => Phase::Done,
            Phase::Done => Phase::Done,
        };
        self.phase_offset = 0;
    }

    /// Consumes the feeder once finished, returning the digest computed
    /// over exactly the payload bytes emitted.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if !self.is_finished() {
            return Err(JalError::protocol("feeder.finish() called before exhaustion"));
        }
        let ctx = self
            .digest_ctx
            .take()
            .ok_or_else(|| JalError::protocol("digest already finalised"))?;
        Ok(ctx.finish())
    }
}

fn encode_headers(nonce: &Nonce, record: &Record) -> Vec<u8> {
    let sys_len = record.sys_metadata.len();
    let app_len = record.app_metadata.as_ref().map(|s| s.len()).unwrap_or(0);
    let payload_len = record.payload.as_ref().map(|s| s.len()).unwrap_or(0);
    format!(
        "record-type: {}\r\nnonce: {nonce}\r\nsys-metadata-length: {sys_len}\r\napp-metadata-length: {app_len}\r\npayload-length: {payload_len}\r\n",
        record.record_type
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Sha256Algorithm;
    use crate::record::NewRecord;
    use crate::segment::Segment;
    use crate::types::{RecordType, Timestamp};
    use uuid::Uuid;

    fn record_with_payload(payload: &[u8]) -> Record {
        let mut new = NewRecord::local(
            RecordType::Journal,
            Uuid::new_v4(),
            42,
            "host.example",
            Timestamp::new("2024-01-01T00:00:00Z").unwrap(),
            Segment::memory(b"sys".to_vec()),
        );
        new.payload = Some(Segment::memory(payload.to_vec()));
        crate::record::build(new).unwrap()
    }

    fn drain(feeder: &mut PayloadFeeder, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = feeder.fill(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn feeder_emits_all_phases_with_small_buffers() {
        let record = record_with_payload(b"hello payload");
        let nonce = Nonce::first();
        let algo = Sha256Algorithm;
        let mut feeder = PayloadFeeder::new(&nonce, &record, &algo, 0).unwrap();
        let bytes = drain(&mut feeder, 3);
        assert!(feeder.is_finished());

        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("hello payload"));
        assert_eq!(bytes.iter().filter(|&&b| b == b'B').count() >= 3, true);
    }

    #[test]
    fn feeder_digest_matches_one_shot_over_payload_only() {
        let payload = b"the payload bytes";
        let record = record_with_payload(payload);
        let nonce = Nonce::first();
        let algo = Sha256Algorithm;
        let mut feeder = PayloadFeeder::new(&nonce, &record, &algo, 0).unwrap();
        drain(&mut feeder, 4096);
        let digest = feeder.finish().unwrap();

        let expected = crate::digest::one_shot(&algo, payload);
        assert_eq!(digest, expected);
    }

    #[test]
    fn resume_offset_digests_only_the_suffix() {
        let payload = b"0123456789";
        let record = record_with_payload(payload);
        let nonce = Nonce::first();
        let algo = Sha256Algorithm;
        let mut feeder = PayloadFeeder::new(&nonce, &record, &algo, 5).unwrap();
        drain(&mut feeder, 4096);
        let digest = feeder.finish().unwrap();

        let expected = crate::digest::one_shot(&algo, &payload[5..]);
        assert_eq!(digest, expected);
    }
}
