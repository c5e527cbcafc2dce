//! TS6 user identifier minting.

use std::fmt;

use thiserror::Error;

/// A 3-character server identifier, `[0-9][0-9A-Z]{2}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid(String);

impl Sid {
    pub fn new(s: impl Into<String>) -> Self {
        Sid(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 9-character user identifier: the home server's SID followed by a
/// locally unique 6-character ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(String);

impl Uid {
    pub fn new(s: impl Into<String>) -> Self {
        Uid(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The SID of the server the user lives on.
    pub fn sid(&self) -> Sid {
        Sid::new(&self.0[..3])
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The ID space is `[A-Z][A-Z0-9]{5}`: 26 choices for the first digit and
/// 36 for the rest.
pub const MAX_IDS: u64 = 26 * 36 * 36 * 36 * 36 * 36;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("TS6 ID overflow")]
pub struct IdOverflow;

/// Mints UIDs for this server's local sessions.
///
/// Each session gets a monotonically increasing integer which is encoded
/// into 6 base-36 digits, most significant first: 0..=25 map to `A`..=`Z`
/// and 26..=35 map to `0`..=`9`. The leading digit must stay in `A`..=`Z`,
/// so the space holds [`MAX_IDS`] identifiers; exhausting it is fatal to
/// the session asking.
pub struct UidGenerator {
    sid: Sid,
    counter: u64,
}

impl UidGenerator {
    pub fn new(sid: Sid) -> Self {
        Self { sid, counter: 0 }
    }

    /// Mint the next UID. The counter is not consumed on overflow.
    pub fn next_uid(&mut self) -> Result<Uid, IdOverflow> {
        let id = encode_id(self.counter)?;
        self.counter += 1;
        Ok(Uid::new(format!("{}{}", self.sid, id)))
    }
}

/// Encode an integer as a 6-character TS6 ID.
fn encode_id(mut n: u64) -> Result<String, IdOverflow> {
    if n >= MAX_IDS {
        return Err(IdOverflow);
    }

    let mut id = [b'A'; 6];
    for slot in id.iter_mut().rev() {
        let rem = (n % 36) as u8;
        *slot = if rem >= 26 { rem - 26 + b'0' } else { rem + b'A' };
        n /= 36;
    }

    Ok(String::from_utf8(id.to_vec()).expect("ASCII digits"))
}

/// Decode a 6-character TS6 ID back to its integer. Inverse of
/// [`encode_id`] for valid IDs.
#[cfg(test)]
fn decode_id(id: &str) -> u64 {
    id.bytes().fold(0, |acc, b| {
        let digit = if b.is_ascii_digit() {
            (b - b'0') as u64 + 26
        } else {
            (b - b'A') as u64
        };
        acc * 36 + digit
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_uids() {
        let mut generator = UidGenerator::new(Sid::new("001"));
        assert_eq!(generator.next_uid().unwrap().as_str(), "001AAAAAA");
        assert_eq!(generator.next_uid().unwrap().as_str(), "001AAAAAB");
        assert_eq!(generator.next_uid().unwrap().as_str(), "001AAAAAC");
    }

    #[test]
    fn digit_alphabet() {
        assert_eq!(encode_id(25).unwrap(), "AAAAAZ");
        assert_eq!(encode_id(26).unwrap(), "AAAAA0");
        assert_eq!(encode_id(35).unwrap(), "AAAAA9");
        assert_eq!(encode_id(36).unwrap(), "AAAABA");
    }

    #[test]
    fn round_trips() {
        for n in [0, 1, 35, 36, 12345, 1_000_000, MAX_IDS - 1] {
            let id = encode_id(n).unwrap();
            assert_eq!(decode_id(&id), n, "id {}", id);
            assert!(crate::state::ident::is_valid_id(&id));
        }
    }

    #[test]
    fn overflow_is_fatal_and_does_not_corrupt_the_counter() {
        assert_eq!(encode_id(MAX_IDS), Err(IdOverflow));

        let mut generator = UidGenerator::new(Sid::new("001"));
        generator.counter = MAX_IDS;
        assert!(generator.next_uid().is_err());
        assert_eq!(generator.counter, MAX_IDS);
        assert!(generator.next_uid().is_err());
    }

    #[test]
    fn last_valid_id_has_uppercase_lead() {
        let id = encode_id(MAX_IDS - 1).unwrap();
        assert_eq!(id, "Z99999");
    }
}
