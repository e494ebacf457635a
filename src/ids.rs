//! Time-sortable, collision-resistant identifier generation.
//!
//! Identifiers are 20 characters: an 8-character base-64 encoding of the
//! creation millisecond followed by a 12-character suffix. The suffix is
//! random on the first identifier of a millisecond (collision resistance
//! across independent generators) and incremented as a base-64 counter on
//! every further identifier within the same millisecond (strict ordering
//! within one generator). Because the alphabet is in ASCII order, plain
//! lexicographic comparison sorts identifiers by creation time.

use crate::types::now_millis;
use rand::Rng;

/// The 64-symbol alphabet: digits, uppercase, `_`, lowercase, `~`. Symbol
/// order equals ASCII order, so encoded values compare correctly as strings.
pub const ALPHABET: &[u8; 64] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz~";

/// Characters encoding the creation millisecond.
pub const TIME_PREFIX_LEN: usize = 8;

/// Characters in the random/sequence suffix.
pub const SUFFIX_LEN: usize = 12;

/// Total identifier length.
pub const ID_LEN: usize = TIME_PREFIX_LEN + SUFFIX_LEN;

/// Stateful identifier generator.
///
/// One instance per minting component; the same-millisecond ordering
/// guarantee only holds for identifiers drawn from the same instance.
pub struct IdGenerator {
    /// Millisecond of the most recent identifier.
    last_time: i64,

    /// Suffix of the most recent identifier, one slot per symbol in `0..64`.
    last_suffix: [u8; SUFFIX_LEN],
}

impl IdGenerator {
    /// Create a generator that has minted nothing yet.
    pub fn new() -> Self {
        Self {
            last_time: -1,
            last_suffix: [0; SUFFIX_LEN],
        }
    }

    #[cfg(test)]
    fn with_state(last_time: i64, last_suffix: [u8; SUFFIX_LEN]) -> Self {
        Self {
            last_time,
            last_suffix,
        }
    }

    /// Generate an identifier for the given wall-clock millisecond.
    ///
    /// Calls with the same millisecond as the previous call produce the
    /// previous suffix incremented by one; a new millisecond redraws the
    /// suffix at random.
    ///
    /// # Panics
    ///
    /// Panics on the two fatal invariant violations: a timestamp outside
    /// the encodable range `0..64^8` milliseconds, and suffix exhaustion
    /// (more than `64^12` identifiers within one millisecond). Neither is
    /// expected in practice.
    pub fn generate(&mut self, now: i64) -> String {
        let mut id = String::with_capacity(ID_LEN);
        encode_time_prefix(now, &mut id);

        if now == self.last_time {
            increment_suffix(&mut self.last_suffix);
        } else {
            let mut rng = rand::rng();
            for slot in &mut self.last_suffix {
                *slot = rng.random_range(0..64);
            }
            self.last_time = now;
        }

        for &slot in &self.last_suffix {
            id.push(ALPHABET[slot as usize] as char);
        }

        assert_eq!(id.len(), ID_LEN, "generated identifier has wrong length");
        id
    }

    /// Generate an identifier for the current local time.
    pub fn next_id(&mut self) -> String {
        self.generate(now_millis())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier-shaped range bound for the given millisecond: the time prefix
/// plus a random suffix.
///
/// Stateless, so building bounds never disturbs a generator's ordering
/// state. Any bound shaped at `t - 1` sorts before every identifier minted
/// at `t` or later, and any bound at `t + 1` sorts after every identifier
/// minted at `t` or earlier; window queries use that to make their
/// boundaries inclusive.
pub fn boundary_id(millis: i64) -> String {
    let mut id = String::with_capacity(ID_LEN);
    encode_time_prefix(millis, &mut id);
    let mut rng = rand::rng();
    for _ in 0..SUFFIX_LEN {
        id.push(ALPHABET[rng.random_range(0..ALPHABET.len())] as char);
    }
    id
}

/// Recover the creation millisecond from an identifier's time prefix.
///
/// Returns `None` when the input is shorter than a prefix or uses symbols
/// outside the alphabet.
pub fn decode_time(id: &str) -> Option<i64> {
    let bytes = id.as_bytes();
    if bytes.len() < TIME_PREFIX_LEN {
        return None;
    }
    let mut millis: i64 = 0;
    for &symbol in &bytes[..TIME_PREFIX_LEN] {
        millis = millis * 64 + i64::from(symbol_index(symbol)?);
    }
    Some(millis)
}

/// Encode `millis` as the 8-symbol time prefix, most significant first.
fn encode_time_prefix(millis: i64, out: &mut String) {
    assert!(millis >= 0, "timestamp precedes epoch: {millis}");

    let mut prefix = [0u8; TIME_PREFIX_LEN];
    let mut rem = millis;
    for slot in prefix.iter_mut().rev() {
        *slot = (rem % 64) as u8;
        rem /= 64;
    }
    assert_eq!(
        rem, 0,
        "timestamp {millis} exceeds the encodable range (64^8 ms)"
    );

    for &slot in &prefix {
        out.push(ALPHABET[slot as usize] as char);
    }
}

/// Increment the suffix as a big-endian base-64 counter.
fn increment_suffix(suffix: &mut [u8; SUFFIX_LEN]) {
    for slot in suffix.iter_mut().rev() {
        if *slot < 63 {
            *slot += 1;
            return;
        }
        *slot = 0;
    }
    panic!("identifier suffix space exhausted within one millisecond");
}

fn symbol_index(symbol: u8) -> Option<u8> {
    ALPHABET.iter().position(|&c| c == symbol).map(|p| p as u8)
}
