//! Delay encoding for the binary cascade.
//!
//! A delay in whole seconds is written into the topic routing key as 28 bit
//! tokens, most significant first, followed by the destination address:
//!
//! ```text
//! 10 seconds to "orders" ->
//! 0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.1.0.1.0.orders
//!                                                 ^   ^
//!                                           level 3   level 1
//! ```
//!
//! Each level of the cascade only looks at its own token: a `1` parks the
//! message in that level's queue for `2^level` seconds, a `0` lets it fall
//! through to the next level immediately. The key is never rewritten while
//! the message walks the cascade; dead-lettering preserves it.
//!
//! Everything here is pure and allocation-only, safe to call from any number
//! of publishers at once.

pub mod request;

pub use request::DelayRequest;

/// Highest level in the cascade (bit 27).
pub const MAX_LEVEL: u8 = 27;

/// Number of levels, and of bit tokens in every routing key.
pub const LEVEL_COUNT: usize = MAX_LEVEL as usize + 1;

/// Largest delay the cascade can represent: `2^28 - 1` seconds.
pub const MAX_DELAY_SECONDS: i64 = (1 << LEVEL_COUNT) - 1;

/// Errors raised when validating a requested delay.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelayError {
    #[error("Message cannot be delayed by {seconds} seconds. Maximum delay is {max} seconds")]
    ExceedsMaximum { seconds: i64, max: i64 },
}

/// Errors raised when a routing key does not have the cascade shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Routing key '{key}' has {found} delay tokens, expected 28 followed by an address")]
    WrongTokenCount { key: String, found: usize },

    #[error("Routing key '{key}' has invalid delay token '{token}' at position {position}")]
    InvalidToken {
        key: String,
        position: usize,
        token: String,
    },
}

/// Check a delay against the cascade's representable range.
///
/// Negative delays are accepted; [`encode`] treats them as zero.
pub fn validate(delay_seconds: i64) -> Result<(), DelayError> {
    if delay_seconds > MAX_DELAY_SECONDS {
        return Err(DelayError::ExceedsMaximum {
            seconds: delay_seconds,
            max: MAX_DELAY_SECONDS,
        });
    }
    Ok(())
}

/// Encode a delay and destination into a cascade routing key.
///
/// Returns the routing key and the starting level: the highest set bit, or 0
/// for a zero delay. Negative delays encode as zero. The upper bound is not
/// checked here; callers run [`validate`] first.
pub fn encode(delay_seconds: i64, address: &str) -> (String, u8) {
    let delay = delay_seconds.max(0);

    let mut key = String::with_capacity(LEVEL_COUNT * 2 + address.len());
    let mut starting_level = 0;

    for level in (0..=MAX_LEVEL).rev() {
        let set = delay & (1 << level) != 0;
        if set && starting_level == 0 {
            starting_level = level;
        }
        key.push_str(if set { "1." } else { "0." });
    }
    key.push_str(address);

    (key, starting_level)
}

/// A routing key split back into its delay bits and address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    /// Bit tokens, index 0 is level 27.
    bits: [bool; LEVEL_COUNT],
    /// Destination address, byte-for-byte as encoded.
    pub address: String,
}

impl DecodedKey {
    /// Whether the token for `level` is `1`.
    pub fn is_set(&self, level: u8) -> bool {
        self.bits[(MAX_LEVEL - level) as usize]
    }

    /// Reassemble the delay value carried by the key.
    pub fn delay_seconds(&self) -> i64 {
        self.bits
            .iter()
            .fold(0i64, |acc, &bit| (acc << 1) | i64::from(bit))
    }

    /// Level the message entered the cascade at: its highest set bit, or 0
    /// when no bit is set.
    ///
    /// Dead-lettering never rewrites the routing key, so this does not track
    /// the level a message has since fallen to.
    pub fn starting_level(&self) -> u8 {
        (0..=MAX_LEVEL)
            .rev()
            .find(|&level| self.is_set(level))
            .unwrap_or(0)
    }
}

/// Split a cascade routing key into delay bits and destination address.
///
/// The first 28 dot-separated tokens are the bits; everything after the 28th
/// dot is the address, so addresses containing dots survive the round trip.
pub fn decode(routing_key: &str) -> Result<DecodedKey, DecodeError> {
    let mut parts = routing_key.splitn(LEVEL_COUNT + 1, '.');
    let mut bits = [false; LEVEL_COUNT];

    for (position, bit) in bits.iter_mut().enumerate() {
        match parts.next() {
            Some("0") => *bit = false,
            Some("1") => *bit = true,
            Some(token) => {
                return Err(DecodeError::InvalidToken {
                    key: routing_key.to_string(),
                    position,
                    token: token.to_string(),
                })
            }
            None => {
                return Err(DecodeError::WrongTokenCount {
                    key: routing_key.to_string(),
                    found: position,
                })
            }
        }
    }

    let address = parts.next().ok_or_else(|| DecodeError::WrongTokenCount {
        key: routing_key.to_string(),
        found: LEVEL_COUNT,
    })?;

    Ok(DecodedKey {
        bits,
        address: address.to_string(),
    })
}
