//! postbox — a signed, filesystem-backed IPC bus for a single host.
//!
//! Endpoints are persistent mailboxes that rendezvous through a shared
//! directory tree; delivery is a queue of signed envelope tokens, and
//! topics fan out through symbolic links:
//!
//! ```text
//! <root>/
//!   <endpoint>/              endpoint directory (may contain "/")
//!     queue/                 one file per pending envelope
//!     subscriptions/<topic>  symlink into the pub/sub namespace
//!     owner                  creating user's name
//!   priv/<user>.<prog>.<pid>.<epoch>.<rand>/   anonymous endpoints
//!   pubsub/<topic>/<flat>    symlink per subscriber, "/" -> "_"
//!   keyring/<fingerprint>    signer identities for attribution
//! ```
//!
//! Any number of unrelated processes may open, send, receive, subscribe,
//! and publish concurrently; the filesystem is the only shared state.
//! Messages are authenticated ([`postbox_wire::Envelope`]) but not
//! confidential — anyone in the group can read a queue.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod endpoint;
/// Error types for bus operations.
pub mod error;
pub mod pubsub;
pub mod queue;

pub use config::{BusConfig, IdentityConfig};
pub use endpoint::Endpoints;
pub use error::BusError;
pub use pubsub::PubSub;
pub use queue::{DirQueue, QueueError};
