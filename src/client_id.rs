use std::borrow::Borrow;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::num::NonZeroU8;
use std::str::FromStr;

use rand::distributions::{Alphanumeric, Distribution};
use rand::Rng;

/// The maximum length a `ClientId` is allowed to be.
///
/// The specification allows implementations to reject client IDs longer than this
/// [MQTT-3.1.3-5].
pub const MAX_LEN: usize = 23;

/// A container for MQTT client IDs that fits entirely on the stack and is trivially copyable.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ClientId {
    // A `String` is 3 pointers, which turns out to be 24 bytes on 64-bit platforms.
    // Coincidentally, the MQTT spec only requires implementations to support client IDs
    // with up to 23 bytes, so this fits perfectly in the same space
    // with another byte for the length.
    /// SAFETY: must be in the range `1 ..= 23`.
    len: NonZeroU8,
    /// SAFETY: `bytes` must *always* be valid UTF-8.
    bytes: [u8; MAX_LEN],
}

impl ClientId {
    /// Generate a random client ID of the given length.
    ///
    /// ### Panics
    /// If `length` is not in the range `1 ..= MAX_LEN`.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, length: usize) -> Self {
        assert!(
            (1..=MAX_LEN).contains(&length),
            "{length} not in the range `1 ..= {MAX_LEN}`"
        );

        let mut bytes = [0u8; MAX_LEN];

        for b in &mut bytes[..length] {
            // `Alphanumeric` only produces ASCII, keeping the UTF-8 invariant.
            *b = Alphanumeric.sample(rng);
        }

        Self {
            len: NonZeroU8::new(length as u8).expect("BUG: `length` should be nonzero"),
            bytes,
        }
    }

    pub fn from_bytes(byte_slice: &[u8]) -> Result<Self, ParseError> {
        let len_usize = byte_slice.len();

        if len_usize > MAX_LEN {
            return Err(ParseError::InvalidLength(len_usize));
        }

        let len = NonZeroU8::new(len_usize as u8).ok_or(ParseError::Empty)?;

        let mut bytes = [0u8; MAX_LEN];

        for (position, (&byte, byte_out)) in byte_slice.iter().zip(&mut bytes).enumerate() {
            // The spec only requires servers to accept the alphanumeric
            // characters [MQTT-3.1.3-5]; `-` and `_` are tolerated because
            // widely deployed client libraries generate them.
            if !matches!(
                byte,
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_',
            ) {
                return Err(ParseError::InvalidByte { byte, position });
            }

            // Only one-byte (ASCII) characters are accepted, so the UTF-8
            // invariant holds per byte.
            *byte_out = byte;
        }

        Ok(Self { len, bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len.get() as usize]
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: `bytes` is always valid UTF-8.
        std::str::from_utf8(self.as_bytes()).expect("BUG: `ClientId` must be valid UTF-8")
    }
}

impl FromStr for ClientId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Debug for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self.as_str(), f)
    }
}

// `Borrow<str>` lets maps keyed by `ClientId` be queried with a plain `&str`,
// which requires `Hash` to agree with `str`'s.
impl Hash for ClientId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("client ID cannot be empty")]
    Empty,
    #[error("client ID of {0} bytes exceeds the maximum of {MAX_LEN}")]
    InvalidLength(usize),
    #[error("invalid byte {byte:#04x} at position {position}")]
    InvalidByte { byte: u8, position: usize },
}
