//! Signed envelope construction, validation, and inspection.
//!
//! The wire object is two-level JSON. The inner message carries version,
//! source, destination, sending user, timestamp, an optional topic, and
//! the token-encoded payload. The inner JSON is itself encoded to a token
//! and signed; the outer object pairs that token with the detached
//! signature, and is encoded once more before it crosses a queue:
//!
//! ```text
//! queue item = encode({"message": encode(inner_json), "signature": sig})
//! ```
//!
//! The signature covers the encoded inner token exactly as stored.
//! Verification rehashes the stored token, never a re-encoding of the
//! reparsed inner, since re-encoding may reorder fields.

use crate::encoding;
use crate::signer::{Signer, SignerError, SignerInfo};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use thiserror::Error;
use tracing::warn;

/// Protocol version stamped into every sealed envelope. Bump on breaking
/// changes to the inner message schema.
pub const PROTOCOL_VERSION: u64 = 1;

/// Error returned when the system clock is before the Unix epoch.
#[derive(Debug, Clone, Copy, Error)]
#[error("system clock is before Unix epoch")]
pub struct ClockError;

/// Errors from envelope construction, parsing, and validation.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// A token could not be decoded.
    #[error("malformed token: {0}")]
    MalformedToken(#[from] encoding::DecodeError),
    /// The outer or inner JSON could not be parsed.
    #[error("malformed envelope json: {0}")]
    MalformedJson(#[from] serde_json::Error),
    /// A requested field is absent from the inner message.
    #[error("field missing from message: {0}")]
    FieldMissing(&'static str),
    /// The signature does not verify over the stored inner token.
    #[error("signature does not verify")]
    BadSignature,
    /// The version field is present but not a version this build speaks.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u64),
    /// The signing backend failed.
    #[error(transparent)]
    Signer(#[from] SignerError),
    /// The system clock is unusable.
    #[error(transparent)]
    Clock(#[from] ClockError),
    /// The calling user cannot be determined from the environment.
    #[error("cannot determine calling user")]
    UnknownUser,
}

/// The inner message record.
///
/// Every field is optional on the parse side so that a damaged or foreign
/// envelope can still be inspected; absent fields are omitted from the
/// JSON entirely, never serialized as empty strings. `data` holds the
/// payload already token-encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version; [`PROTOCOL_VERSION`] for envelopes sealed here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Sender's endpoint name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Receiver's endpoint name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Sender's OS username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Wall-clock at send, Unix epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Topic, present only when published through pub/sub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Token-encoded payload bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// The outer signed container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Encoded inner message JSON, exactly as signed.
    pub message: String,
    /// Encoded detached signature over the `message` token bytes.
    pub signature: String,
}

impl Envelope {
    /// Build, sign, and encode an envelope, returning the queue-ready token.
    ///
    /// The inner message is stamped with [`PROTOCOL_VERSION`], the calling
    /// OS user, and the current time. An empty or absent `topic` is omitted
    /// from the JSON.
    ///
    /// # Errors
    ///
    /// Signing failures surface as [`EnvelopeError::Signer`]; an unusable
    /// clock or environment yields [`EnvelopeError::Clock`] /
    /// [`EnvelopeError::UnknownUser`].
    pub fn seal(
        signer: &dyn Signer,
        source: &str,
        destination: &str,
        data: &[u8],
        topic: Option<&str>,
    ) -> Result<String, EnvelopeError> {
        let message = Message {
            version: Some(PROTOCOL_VERSION),
            source: Some(source.to_string()),
            destination: Some(destination.to_string()),
            user: Some(current_user()?),
            timestamp: Some(unix_now()?),
            topic: topic.filter(|t| !t.is_empty()).map(str::to_string),
            data: Some(encoding::encode(data)),
        };
        let inner = serde_json::to_string(&message)?;
        let inner_token = encoding::encode(inner.as_bytes());
        let signature = signer.sign(inner_token.as_bytes())?;
        let envelope = Envelope {
            message: inner_token,
            signature,
        };
        envelope.to_token()
    }

    /// Decode a queue item back into an envelope.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::MalformedToken`] when the outer token does not
    /// decode, [`EnvelopeError::MalformedJson`] when the decoded bytes are
    /// not an envelope object.
    pub fn from_token(token: &str) -> Result<Self, EnvelopeError> {
        let bytes = encoding::decode(token)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Re-encode this envelope as a queue-ready token.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MalformedJson`] if serialization fails.
    pub fn to_token(&self) -> Result<String, EnvelopeError> {
        let outer = serde_json::to_string(self)?;
        Ok(encoding::encode(outer.as_bytes()))
    }

    /// Verify the signature and gate the protocol version.
    ///
    /// The signature is checked over the stored inner token bytes. A bad
    /// or structurally unusable signature is [`EnvelopeError::BadSignature`];
    /// a good signature over any version other than [`PROTOCOL_VERSION`]
    /// is [`EnvelopeError::UnsupportedVersion`] — the two are distinct so
    /// callers can tell tampering from protocol drift.
    ///
    /// # Errors
    ///
    /// See above; also surfaces parse errors from the inner message.
    pub fn validate(&self, signer: &dyn Signer) -> Result<SignerInfo, EnvelopeError> {
        let (valid, report) = match signer.verify(&self.signature, self.message.as_bytes()) {
            Ok(outcome) => outcome,
            Err(SignerError::BadSignature) => return Err(EnvelopeError::BadSignature),
            Err(other) => return Err(other.into()),
        };
        if !valid {
            return Err(EnvelopeError::BadSignature);
        }
        let version = self.version()?;
        if version != PROTOCOL_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }
        Ok(SignerInfo::from_report(valid, &report))
    }

    /// Attribute the envelope to its signer without requiring validity.
    ///
    /// Unlike [`Envelope::validate`] this succeeds for a failing signature
    /// (`valid` is `false` in the result) — useful for diagnostics and
    /// dead-letter inspection.
    ///
    /// # Errors
    ///
    /// Only structural signature problems and backend failures error.
    pub fn signer_info(&self, signer: &dyn Signer) -> Result<SignerInfo, EnvelopeError> {
        let (valid, report) = signer.verify(&self.signature, self.message.as_bytes())?;
        Ok(SignerInfo::from_report(valid, &report))
    }

    /// Parse the inner message. Callers needing authenticity must call
    /// [`Envelope::validate`] first; accessors never verify.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::MalformedToken`] / [`EnvelopeError::MalformedJson`].
    pub fn inner(&self) -> Result<Message, EnvelopeError> {
        let bytes = encoding::decode(&self.message)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Protocol version of the inner message.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::FieldMissing`] when absent.
    pub fn version(&self) -> Result<u64, EnvelopeError> {
        self.inner()?
            .version
            .ok_or(EnvelopeError::FieldMissing("version"))
    }

    /// Sender's endpoint name.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::FieldMissing`] when absent.
    pub fn source(&self) -> Result<String, EnvelopeError> {
        self.inner()?
            .source
            .ok_or(EnvelopeError::FieldMissing("source"))
    }

    /// Receiver's endpoint name.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::FieldMissing`] when absent.
    pub fn destination(&self) -> Result<String, EnvelopeError> {
        self.inner()?
            .destination
            .ok_or(EnvelopeError::FieldMissing("destination"))
    }

    /// Sending OS user, as claimed by the inner message.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::FieldMissing`] when absent.
    pub fn user(&self) -> Result<String, EnvelopeError> {
        self.inner()?.user.ok_or(EnvelopeError::FieldMissing("user"))
    }

    /// Send timestamp, Unix epoch seconds.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::FieldMissing`] when absent.
    pub fn timestamp(&self) -> Result<i64, EnvelopeError> {
        self.inner()?
            .timestamp
            .ok_or(EnvelopeError::FieldMissing("timestamp"))
    }

    /// Topic the message was published under.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::FieldMissing`] for point-to-point messages — the
    /// field is omitted, not empty, when a message was not published.
    pub fn topic(&self) -> Result<String, EnvelopeError> {
        self.inner()?
            .topic
            .ok_or(EnvelopeError::FieldMissing("topic"))
    }

    /// Decoded payload bytes.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::FieldMissing`] when absent,
    /// [`EnvelopeError::MalformedToken`] when the stored payload token is
    /// damaged.
    pub fn data(&self) -> Result<Vec<u8>, EnvelopeError> {
        let token = self
            .inner()?
            .data
            .ok_or(EnvelopeError::FieldMissing("data"))?;
        Ok(encoding::decode(&token)?)
    }

    /// Render a human-readable diagnostic block.
    ///
    /// Never fails: fields that cannot be decoded render as `(unknown)`.
    /// Signature and version problems are additionally logged.
    #[must_use]
    pub fn dump(&self, signer: &dyn Signer) -> String {
        let inner = self.inner().ok();
        let mut out = String::new();

        match inner.as_ref().and_then(|m| m.version) {
            Some(v) if v == PROTOCOL_VERSION => {
                let _ = writeln!(out, "version:     {v} (supported)");
            }
            Some(v) => {
                warn!(version = v, "envelope carries an unsupported version");
                let _ = writeln!(out, "version:     {v} (UNSUPPORTED)");
            }
            None => {
                let _ = writeln!(out, "version:     (unknown)");
            }
        }

        let info = self.signer_info(signer).ok();
        match &info {
            Some(info) if info.valid => {
                let _ = writeln!(out, "signature:   valid");
            }
            Some(_) => {
                warn!("envelope signature does not verify");
                let _ = writeln!(out, "signature:   INVALID");
            }
            None => {
                warn!("envelope signature is structurally unusable");
                let _ = writeln!(out, "signature:   (unknown)");
            }
        }

        let field = |s: Option<&str>| s.unwrap_or("(unknown)").to_string();
        let _ = writeln!(
            out,
            "signer:      {} <{}>",
            field(info.as_ref().map(|i| i.name.as_str())),
            field(info.as_ref().map(|i| i.email.as_str())),
        );
        let _ = writeln!(
            out,
            "fingerprint: {}",
            field(info.as_ref().map(|i| i.key_fingerprint.as_str())),
        );
        let _ = writeln!(
            out,
            "source:      {}",
            field(inner.as_ref().and_then(|m| m.source.as_deref())),
        );
        let _ = writeln!(
            out,
            "destination: {}",
            field(inner.as_ref().and_then(|m| m.destination.as_deref())),
        );
        let _ = writeln!(
            out,
            "user:        {}",
            field(inner.as_ref().and_then(|m| m.user.as_deref())),
        );
        match inner.as_ref().and_then(|m| m.timestamp) {
            Some(ts) => {
                let _ = writeln!(out, "timestamp:   {ts}");
            }
            None => {
                let _ = writeln!(out, "timestamp:   (unknown)");
            }
        }
        if let Some(topic) = inner.as_ref().and_then(|m| m.topic.as_deref()) {
            let _ = writeln!(out, "topic:       {topic}");
        }
        match self.data() {
            Ok(payload) => {
                let _ = writeln!(out, "payload:     {}", String::from_utf8_lossy(&payload));
            }
            Err(_) => {
                let _ = writeln!(out, "payload:     (unknown)");
            }
        }
        out
    }
}

/// Current Unix timestamp in seconds.
///
/// # Errors
///
/// Returns [`ClockError`] if the system clock is before the Unix epoch;
/// callers must handle the misconfigured-clock case explicitly.
pub fn unix_now() -> Result<i64, ClockError> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .map_err(|_| ClockError)
}

/// The calling user's OS name, from `USER` or `LOGNAME`.
///
/// # Errors
///
/// Returns [`EnvelopeError::UnknownUser`] when neither variable is set.
pub fn current_user() -> Result<String, EnvelopeError> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .map_err(|_| EnvelopeError::UnknownUser)
}
