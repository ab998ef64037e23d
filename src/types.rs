//! Core identifier types: [`Nonce`] and [`Timestamp`].
//!
//! Both have comparators that differ from "whatever `Ord` derives", so they
//! get their own hand-written `Ord`/`PartialOrd` impls rather than deriving.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A totally-ordered record identifier, assigned on insert.
///
/// Stored as a canonical ASCII-decimal-digit string with no leading zeros
/// (mirroring the original JALoP serial ID, which is text so it can grow
/// without a fixed-width overflow). Comparison is length-first, then
/// byte-wise, which is exactly the rule that makes "123" < "45" false and
/// "45" < "123" true despite '4' > '1' as bytes.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Nonce(String);

impl Nonce {
    /// The first nonce ever assigned within a record type.
    pub fn first() -> Self {
        Nonce("1".to_string())
    }

    /// Parse a canonical nonce string. Rejects empty strings, non-digit
    /// characters, and leading zeros (other than the literal value "0",
    /// which is reserved and never assigned).
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if s.len() > 1 && s.starts_with('0') {
            return None;
        }
        Some(Nonce(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The canonical byte representation used as a sled key: big-endian
    /// length prefix followed by the ASCII digits, so sled's own
    /// byte-lexicographic `BTreeMap` ordering agrees with [`Nonce::cmp`]
    /// without needing a custom comparator registered with the store.
    pub fn sort_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(2 + self.0.len());
        key.extend_from_slice(&(self.0.len() as u16).to_be_bytes());
        key.extend_from_slice(self.0.as_bytes());
        key
    }

    /// The next nonce strictly greater than `self`, computed by decimal
    /// increment on the digit string so it never wraps or repeats.
    pub fn next(&self) -> Nonce {
        let mut digits: Vec<u8> = self.0.bytes().collect();
        let mut carry = true;
        for d in digits.iter_mut().rev() {
            if !carry {
                break;
            }
            if *d == b'9' {
                *d = b'0';
            } else {
                *d += 1;
                carry = false;
            }
        }
        if carry {
            digits.insert(0, b'1');
        }
        Nonce(String::from_utf8(digits).expect("ascii digits"))
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for Nonce {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Nonce {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An XML-Schema-dateTime-formatted timestamp, compared componentwise
/// (year, month, day, hour, minute, second, fraction, zone offset) rather
/// than as a normalized instant. Two timestamps with the same wall-clock
/// fields but different zones compare by zone last, not by UTC instant —
/// kept deliberately, since records are ordered as they were produced,
/// not as they'd be ordered after zone normalization.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Timestamp(String);

/// Decomposed components of an XML dateTime string, in comparison order.
#[derive(Debug, Eq, PartialEq, PartialOrd, Ord)]
struct Components {
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    fraction: u32,
    zone_minutes: i32,
}

impl Timestamp {
    pub fn new(s: impl Into<String>) -> Option<Self> {
        let s = s.into();
        parse_components(&s)?;
        Some(Timestamp(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn components(&self) -> Components {
        parse_components(&self.0).expect("validated at construction")
    }

    /// A fixed-width, byte-lexicographically-sortable encoding of the
    /// componentwise comparator, so the store's timestamp index (a plain
    /// sled `Tree`, which only orders keys byte-lexicographically) can
    /// range-scan in the same order [`Timestamp::cmp`] defines.
    pub fn sort_key(&self) -> [u8; 19] {
        let c = self.components();
        let mut key = [0u8; 19];
        key[0..4].copy_from_slice(&((c.year as i64 + 1_000_000) as u32).to_be_bytes());
        key[4] = c.month as u8;
        key[5] = c.day as u8;
        key[6] = c.hour as u8;
        key[7] = c.minute as u8;
        key[8] = c.second as u8;
        key[9..13].copy_from_slice(&c.fraction.to_be_bytes());
        key[13..17].copy_from_slice(&((c.zone_minutes as i64 + 1_440) as u32).to_be_bytes());
        key[17..19].copy_from_slice(&0u16.to_be_bytes()); // reserved, keeps width stable
        key
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components().cmp(&other.components())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Parses `YYYY-MM-DDTHH:MM:SS(.fraction)?(Z|+HH:MM|-HH:MM)?` into its
/// comparison components. Returns `None` on any malformed input rather
/// than panicking — callers at the store boundary treat that as
/// `JalError::Invalid`.
fn parse_components(s: &str) -> Option<Components> {
    let (date, rest) = s.split_once('T')?;
    let mut date_parts = date.split('-');
    let year: i32 = date_parts.next()?.parse().ok()?;
    let month: u32 = date_parts.next()?.parse().ok()?;
    let day: u32 = date_parts.next()?.parse().ok()?;
    if date_parts.next().is_some() || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    let (time, zone_minutes) = split_zone(rest)?;
    let mut time_parts = time.split(':');
    let hour: u32 = time_parts.next()?.parse().ok()?;
    let minute: u32 = time_parts.next()?.parse().ok()?;
    let sec_field = time_parts.next()?;
    if time_parts.next().is_some() || hour > 23 || minute > 59 {
        return None;
    }

    let (second, fraction) = match sec_field.split_once('.') {
        Some((s, f)) => {
            let second: u32 = s.parse().ok()?;
            // Normalise to microsecond precision regardless of how many
            // fractional digits the producer sent.
            let mut frac_str = f.to_string();
            frac_str.truncate(6);
            while frac_str.len() < 6 {
                frac_str.push('0');
            }
            (second, frac_str.parse().ok()?)
        }
        None => (sec_field.parse().ok()?, 0),
    };
    if second > 60 {
        // Allow a leap second (60) through; reject anything beyond it.
        return None;
    }

    Some(Components {
        year,
        month,
        day,
        hour,
        minute,
        second,
        fraction,
        zone_minutes,
    })
}

fn split_zone(time_and_zone: &str) -> Option<(&str, i32)> {
    if let Some(time) = time_and_zone.strip_suffix('Z') {
        return Some((time, 0));
    }
    // Look for a +HH:MM or -HH:MM suffix after the seconds field. The
    // sign must not be confused with a leading '-' that can't occur here
    // since dates were already split off.
    for (idx, ch) in time_and_zone.char_indices().rev() {
        if ch == '+' || ch == '-' {
            let time = &time_and_zone[..idx];
            let zone = &time_and_zone[idx + 1..];
            let (zh, zm) = zone.split_once(':')?;
            let zh: i32 = zh.parse().ok()?;
            let zm: i32 = zm.parse().ok()?;
            let minutes = zh * 60 + zm;
            return Some((time, if ch == '-' { -minutes } else { minutes }));
        }
    }
    // No zone designator: treat as local/unspecified, offset 0.
    Some((time_and_zone, 0))
}

/// The three record families JALoP transports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Journal,
    Audit,
    Log,
}

impl RecordType {
    pub const ALL: [RecordType; 3] = [RecordType::Journal, RecordType::Audit, RecordType::Log];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Journal => "journal",
            RecordType::Audit => "audit",
            RecordType::Log => "log",
        }
    }

    /// Bit position used by [`crate::peer_policy::RecordTypeMask`].
    pub fn bit(&self) -> u8 {
        match self {
            RecordType::Journal => 0b001,
            RecordType::Audit => 0b010,
            RecordType::Log => 0b100,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_ordering_is_length_first() {
        let a = Nonce::parse("45").unwrap();
        let b = Nonce::parse("123").unwrap();
        assert!(a < b, "shorter nonce must sort before longer nonce");
    }

    #[test]
    fn nonce_next_is_strictly_increasing_and_handles_carry() {
        let n = Nonce::parse("999").unwrap();
        let next = n.next();
        assert_eq!(next.as_str(), "1000");
        assert!(n < next);

        let mut cur = Nonce::first();
        for _ in 0..50 {
            let nxt = cur.next();
            assert!(nxt > cur);
            cur = nxt;
        }
    }

    #[test]
    fn nonce_rejects_leading_zero_and_non_digits() {
        assert!(Nonce::parse("007").is_none());
        assert!(Nonce::parse("12a").is_none());
        assert!(Nonce::parse("").is_none());
    }

    #[test]
    fn timestamp_componentwise_ordering() {
        let a = Timestamp::new("2024-01-01T00:00:00Z").unwrap();
        let b = Timestamp::new("2024-01-01T00:00:01Z").unwrap();
        assert!(a < b);

        let c = Timestamp::new("2024-01-01T00:00:00.500000Z").unwrap();
        assert!(a < c);
    }

    #[test]
    fn timestamp_zone_is_a_tiebreaker_not_a_normaliser() {
        // Same wall-clock fields, different zone: compares by zone last,
        // NOT by the equivalent UTC instant (which would reverse this).
        let utc = Timestamp::new("2024-06-01T12:00:00Z").unwrap();
        let plus = Timestamp::new("2024-06-01T12:00:00+01:00").unwrap();
        assert!(utc < plus);
    }

    #[test]
    fn timestamp_sort_key_agrees_with_ord() {
        let a = Timestamp::new("2024-01-01T00:00:00Z").unwrap();
        let b = Timestamp::new("2024-01-01T00:00:01Z").unwrap();
        assert!(a.sort_key() < b.sort_key());
        assert_eq!(a.cmp(&b), a.sort_key().cmp(&b.sort_key()));
    }

    #[test]
    fn timestamp_rejects_malformed_input() {
        assert!(Timestamp::new("not-a-timestamp").is_none());
        assert!(Timestamp::new("2024-13-01T00:00:00Z").is_none());
    }
}
