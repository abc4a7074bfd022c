//! Wire contract for the postbox IPC bus.
//!
//! This crate provides:
//! - Base64 token encoding for binary-safe queue items ([`encoding`])
//! - The two-level signed envelope format ([`envelope`])
//! - Detached signing and signer attribution ([`signer`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod encoding;
pub mod envelope;
pub mod signer;

pub use envelope::{current_user, unix_now, Envelope, EnvelopeError, Message, PROTOCOL_VERSION};
pub use signer::{KeyringSigner, Signer, SignerError, SignerInfo};
