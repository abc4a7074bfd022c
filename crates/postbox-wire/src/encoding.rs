//! Base64 token encoding for the postbox wire format.
//!
//! Every binary field that crosses a queue — payload bytes, detached
//! signatures, the inner and outer envelope JSON — travels as a token.
//! Tokens use the standard base64 alphabet: JSON-safe without escaping,
//! free of whitespace and newlines, and reversible with no framing.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

pub use base64::DecodeError;

/// Encodes raw bytes to a token.
///
/// # Examples
///
/// ```
/// let token = postbox_wire::encoding::encode(b"hello");
/// assert_eq!(token, "aGVsbG8=");
/// ```
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decodes a token back to raw bytes.
///
/// # Errors
///
/// Returns [`DecodeError`] if the input contains characters outside the
/// token alphabet or has an invalid length.
///
/// # Examples
///
/// ```
/// let token = postbox_wire::encoding::encode(&[0, 159, 146, 150]);
/// let bytes = postbox_wire::encoding::decode(&token).unwrap();
/// assert_eq!(bytes, vec![0, 159, 146, 150]);
/// ```
pub fn decode(token: &str) -> Result<Vec<u8>, DecodeError> {
    BASE64.decode(token)
}
