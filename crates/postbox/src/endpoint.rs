//! Endpoint lifecycle and point-to-point delivery.
//!
//! An endpoint is a directory under the shared root: a queue of pending
//! envelopes, a set of outgoing topic subscriptions, and an `owner`
//! marker. Endpoints survive process restarts; any process that can
//! reach the directory can send to it. Directories are created group
//! rwx with the setgid bit so processes of the same group rendezvous.

use crate::config::BusConfig;
use crate::error::BusError;
use crate::pubsub;
use crate::queue::{DirQueue, QueueError};
use postbox_wire::{current_user, unix_now, Envelope, EnvelopeError, KeyringSigner, Signer};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Group rwx plus setgid, so same-group processes share every endpoint.
const DIR_MODE: u32 = 0o2770;

pub(crate) const QUEUE_DIR: &str = "queue";
pub(crate) const SUBSCRIPTIONS_DIR: &str = "subscriptions";
const OWNER_FILE: &str = "owner";

/// Reserved first path component for anonymous endpoints.
const ANON_PREFIX: &str = "priv";

/// Endpoint operations over one process's view of the bus.
///
/// Construction wires in the configuration and the signing backend; the
/// struct itself holds no endpoint state — the filesystem does.
pub struct Endpoints {
    config: BusConfig,
    signer: Arc<dyn Signer>,
}

impl Endpoints {
    /// Build with the default [`KeyringSigner`] from the configuration.
    ///
    /// # Errors
    ///
    /// Signer setup failures (missing identity, unusable seed file)
    /// propagate.
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        let signer = KeyringSigner::open(
            &config.keypair,
            &config.keyring(),
            &config.identity.name,
            &config.identity.email,
        )?;
        Ok(Self {
            config,
            signer: Arc::new(signer),
        })
    }

    /// Build with a caller-provided signing backend.
    #[must_use]
    pub fn with_signer(config: BusConfig, signer: Arc<dyn Signer>) -> Self {
        Self { config, signer }
    }

    /// The configuration this instance was built with.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The signing backend, shared with receivers that need to validate
    /// envelopes returned by [`Endpoints::recv`].
    #[must_use]
    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.signer
    }

    /// Open an endpoint, creating it if absent, and return its name.
    ///
    /// With `None`, a unique anonymous name under `priv/` is synthesized
    /// from user, program, pid, epoch, and a random nonce. Reopening an
    /// existing endpoint is idempotent; a directory at the path that was
    /// not produced by a previous open is [`BusError::NotAnEndpoint`].
    /// If creation fails partway the directory is removed best-effort.
    ///
    /// # Errors
    ///
    /// Name validation, I/O, and queue-initialization failures propagate.
    pub fn open(&self, name: Option<&str>) -> Result<String, BusError> {
        let name = match name {
            Some(given) => {
                validate_endpoint_name(given)?;
                given.to_string()
            }
            None => anonymous_name()?,
        };
        let dir = self.config.endpoint_dir(&name);
        if dir.exists() {
            if dir.join(QUEUE_DIR).is_dir() && dir.join(SUBSCRIPTIONS_DIR).is_dir() {
                debug!(endpoint = %name, "reopened existing endpoint");
                return Ok(name);
            }
            return Err(BusError::NotAnEndpoint(name));
        }

        create_dirs_with_mode(&self.config.root, Path::new(&name))?;
        if let Err(err) = populate_endpoint(&dir) {
            if let Err(rm) = fs::remove_dir_all(&dir) {
                warn!(endpoint = %name, error = %rm, "cleanup after failed open also failed");
            }
            return Err(err);
        }
        debug!(endpoint = %name, "created endpoint");
        Ok(name)
    }

    /// Close an endpoint: destroy its queue, tear down its topic links,
    /// and remove its directory.
    ///
    /// Queue destruction failing aborts the close; a topic link that
    /// cannot be removed is logged and skipped so a dead topic can never
    /// pin a mailbox.
    ///
    /// # Errors
    ///
    /// [`BusError::EndpointUnknown`] when there is nothing to close;
    /// queue-destroy and directory-removal failures propagate.
    pub fn close(&self, name: &str) -> Result<(), BusError> {
        validate_endpoint_name(name)?;
        let dir = self.config.endpoint_dir(name);
        if !dir.is_dir() {
            return Err(BusError::EndpointUnknown(name.to_string()));
        }

        DirQueue::destroy(&dir.join(QUEUE_DIR))?;

        let subs = dir.join(SUBSCRIPTIONS_DIR);
        for topic in collect_subscriptions(&subs) {
            if let Err(err) = pubsub::remove_topic_link(&self.config, name, &topic) {
                warn!(
                    endpoint = %name,
                    topic = %topic,
                    error = %err,
                    "failed to remove topic link during close"
                );
            }
        }

        fs::remove_dir_all(&dir)?;
        debug!(endpoint = %name, "closed endpoint");
        Ok(())
    }

    /// Seal an envelope and enqueue it on the destination's queue.
    ///
    /// # Errors
    ///
    /// [`BusError::EndpointUnknown`] when the destination queue does not
    /// exist; signing failures surface as [`BusError::Wire`] /
    /// [`BusError::Signer`].
    pub fn send(
        &self,
        source: &str,
        destination: &str,
        data: &[u8],
        topic: Option<&str>,
    ) -> Result<(), BusError> {
        validate_endpoint_name(destination)?;
        let queue_dir = self.config.endpoint_dir(destination).join(QUEUE_DIR);
        let queue = DirQueue::open(&queue_dir)
            .map_err(|_| BusError::EndpointUnknown(destination.to_string()))?;

        let token = Envelope::seal(self.signer.as_ref(), source, destination, data, topic)?;
        queue.put(&token).map_err(|err| match err {
            QueueError::Missing(_) => BusError::EndpointUnknown(destination.to_string()),
            other => other.into(),
        })?;
        debug!(source, destination, bytes = data.len(), "message enqueued");
        Ok(())
    }

    /// Blocking receive: the oldest envelope token from the endpoint's
    /// queue. Negative `timeout_secs` waits indefinitely, zero polls
    /// once, positive bounds the wait in seconds. The caller is
    /// responsible for validating the returned envelope.
    ///
    /// # Errors
    ///
    /// [`BusError::Timeout`] when the bound elapses;
    /// [`BusError::EndpointUnknown`] when the endpoint does not exist or
    /// vanishes while waiting.
    pub fn recv(&self, name: &str, timeout_secs: i64) -> Result<String, BusError> {
        validate_endpoint_name(name)?;
        let queue_dir = self.config.endpoint_dir(name).join(QUEUE_DIR);
        let queue =
            DirQueue::open(&queue_dir).map_err(|_| BusError::EndpointUnknown(name.to_string()))?;
        queue.get(timeout_secs).map_err(|err| match err {
            QueueError::Missing(_) => BusError::EndpointUnknown(name.to_string()),
            other => other.into(),
        })
    }

    /// Visit pending envelopes in FIFO order without consuming them,
    /// invoking `f(endpoint_name, envelope_token)` for each.
    ///
    /// # Errors
    ///
    /// [`BusError::EndpointUnknown`] when the endpoint does not exist.
    pub fn foreach_message<F>(&self, name: &str, mut f: F) -> Result<(), BusError>
    where
        F: FnMut(&str, &str),
    {
        validate_endpoint_name(name)?;
        let queue_dir = self.config.endpoint_dir(name).join(QUEUE_DIR);
        let queue =
            DirQueue::open(&queue_dir).map_err(|_| BusError::EndpointUnknown(name.to_string()))?;
        Ok(queue.foreach(|item| f(name, item))?)
    }
}

fn populate_endpoint(dir: &Path) -> Result<(), BusError> {
    DirQueue::init(&dir.join(QUEUE_DIR))?;
    fs::create_dir(dir.join(SUBSCRIPTIONS_DIR))?;
    set_mode(&dir.join(QUEUE_DIR))?;
    set_mode(&dir.join(SUBSCRIPTIONS_DIR))?;
    fs::write(dir.join(OWNER_FILE), format!("{}\n", current_user()?))?;
    Ok(())
}

/// Create each missing component of `rel` under `base`, applying the
/// shared directory mode to the directories this call created (never to
/// pre-existing ancestors, which may belong to other owners).
pub(crate) fn create_dirs_with_mode(base: &Path, rel: &Path) -> Result<(), BusError> {
    let mut current = base.to_path_buf();
    for component in rel.components() {
        current.push(component);
        match fs::create_dir(&current) {
            Ok(()) => set_mode(&current)?,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn set_mode(dir: &Path) -> Result<(), BusError> {
    fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE))?;
    Ok(())
}

/// Topic names subscribed to, read back from the subscription links.
/// Topics contain `/`, so the walk is recursive; the relative path of
/// each symlink is the topic name. Unreadable entries are skipped.
fn collect_subscriptions(subs_root: &Path) -> Vec<String> {
    let mut topics = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let dir = subs_root.join(&rel);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "cannot list subscriptions");
                continue;
            }
        };
        for entry in entries.flatten() {
            let child = rel.join(entry.file_name());
            match entry.file_type() {
                Ok(ft) if ft.is_symlink() => {
                    topics.push(child.to_string_lossy().into_owned());
                }
                Ok(ft) if ft.is_dir() => stack.push(child),
                Ok(_) => {}
                Err(err) => {
                    warn!(entry = %child.display(), error = %err, "unreadable subscription entry");
                }
            }
        }
    }
    topics.sort();
    topics
}

/// Structural checks shared by endpoint and topic names: non-empty,
/// relative, normal components only.
pub(crate) fn validate_relative_name(name: &str) -> Result<(), BusError> {
    if name.is_empty() {
        return Err(BusError::InvalidName("name is empty".to_string()));
    }
    let path = Path::new(name);
    if path.is_absolute() || name.ends_with('/') {
        return Err(BusError::InvalidName(format!(
            "{name}: must be a relative path"
        )));
    }
    for component in path.components() {
        match component {
            Component::Normal(c) if !c.is_empty() => {}
            _ => {
                return Err(BusError::InvalidName(format!(
                    "{name}: path components must be plain names"
                )));
            }
        }
    }
    Ok(())
}

fn validate_endpoint_name(name: &str) -> Result<(), BusError> {
    validate_relative_name(name)?;
    let first = name.split('/').next().unwrap_or(name);
    if first == "pubsub" || first == "keyring" {
        return Err(BusError::InvalidName(format!(
            "{name}: '{first}/' is reserved"
        )));
    }
    Ok(())
}

fn anonymous_name() -> Result<String, BusError> {
    let user = current_user()?;
    let prog = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string());
    let epoch = unix_now().map_err(EnvelopeError::from)?;
    let nonce: u32 = rand::random();
    Ok(format!(
        "{ANON_PREFIX}/{user}.{prog}.{}.{epoch}.{nonce:08x}",
        std::process::id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_must_be_plain_relative_paths() {
        assert!(validate_endpoint_name("svc/a").is_ok());
        assert!(validate_endpoint_name("priv/u.p.1.2.3").is_ok());

        assert!(matches!(
            validate_endpoint_name(""),
            Err(BusError::InvalidName(_))
        ));
        assert!(matches!(
            validate_endpoint_name("/abs/path"),
            Err(BusError::InvalidName(_))
        ));
        assert!(matches!(
            validate_endpoint_name("trailing/"),
            Err(BusError::InvalidName(_))
        ));
        assert!(matches!(
            validate_endpoint_name("a/../b"),
            Err(BusError::InvalidName(_))
        ));
        assert!(matches!(
            validate_endpoint_name("./a"),
            Err(BusError::InvalidName(_))
        ));
    }

    #[test]
    fn reserved_namespaces_are_rejected() {
        assert!(matches!(
            validate_endpoint_name("pubsub/t"),
            Err(BusError::InvalidName(_))
        ));
        assert!(matches!(
            validate_endpoint_name("keyring"),
            Err(BusError::InvalidName(_))
        ));
    }

    #[test]
    fn anonymous_names_are_unique_and_reserved() {
        if current_user().is_err() {
            std::env::set_var("USER", "tester");
        }
        let a = anonymous_name().unwrap();
        let b = anonymous_name().unwrap();
        assert!(a.starts_with("priv/"));
        assert!(b.starts_with("priv/"));
        assert_ne!(a, b);
        assert_eq!(a.split('/').nth(1).unwrap().split('.').count(), 5);
    }
}
