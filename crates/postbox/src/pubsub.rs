//! Topic pub/sub over the shared namespace.
//!
//! A topic is a directory under `pubsub/` whose entries are symbolic
//! links, one per subscriber, named by the subscriber's flattened
//! endpoint name and pointing at that endpoint name. Each subscriber
//! endpoint mirrors the relationship with a link under its own
//! `subscriptions/` directory, so the graph can be torn down from either
//! side. The two links are created and removed as a pair.
//!
//! Publishing is fire-and-forget: the fan-out enumerates subscriber
//! links and sends to each, logging and skipping individual failures.
//! Topics are created on first use and never garbage-collected.

use crate::config::BusConfig;
use crate::endpoint::{self, Endpoints};
use crate::error::BusError;
use std::fs;
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Topic operations over one process's view of the bus.
pub struct PubSub {
    endpoints: Endpoints,
}

impl PubSub {
    /// Build with the default signer from the configuration.
    ///
    /// # Errors
    ///
    /// Signer setup failures propagate.
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        Ok(Self {
            endpoints: Endpoints::new(config)?,
        })
    }

    /// Build over an existing [`Endpoints`] instance.
    #[must_use]
    pub fn with_endpoints(endpoints: Endpoints) -> Self {
        Self { endpoints }
    }

    /// The endpoint operations this router publishes through.
    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Subscribe an endpoint to a topic, creating the topic on first use.
    ///
    /// Establishes the link pair: `pubsub/<topic>/<flat>` naming the
    /// endpoint, and `<endpoint>/subscriptions/<topic>` pointing at the
    /// topic directory. If the second link cannot be created the first is
    /// removed, so the pair invariant holds even across failures.
    ///
    /// # Errors
    ///
    /// [`BusError::EndpointUnknown`] when the endpoint is not open;
    /// subscribing twice surfaces the underlying `AlreadyExists` error.
    pub fn subscribe(&self, endpoint_name: &str, topic: &str) -> Result<(), BusError> {
        endpoint::validate_relative_name(endpoint_name)?;
        endpoint::validate_relative_name(topic)?;
        let config = self.endpoints.config();
        let subs_dir = config
            .endpoint_dir(endpoint_name)
            .join(endpoint::SUBSCRIPTIONS_DIR);
        if !subs_dir.is_dir() {
            return Err(BusError::EndpointUnknown(endpoint_name.to_string()));
        }

        let topic_dir = ensure_topic(config, topic)?;
        let topic_link = topic_dir.join(flat_name(endpoint_name));
        unix_fs::symlink(endpoint_name, &topic_link)?;

        if let Err(err) = link_subscription(&subs_dir, topic, &topic_dir) {
            if let Err(rm) = fs::remove_file(&topic_link) {
                warn!(
                    topic = %topic,
                    endpoint = %endpoint_name,
                    error = %rm,
                    "failed to roll back topic link"
                );
            }
            return Err(err);
        }
        debug!(endpoint = %endpoint_name, topic = %topic, "subscribed");
        Ok(())
    }

    /// Remove the subscription link pair for an endpoint and topic.
    ///
    /// # Errors
    ///
    /// Removing a subscription that does not exist surfaces the
    /// underlying `NotFound` error.
    pub fn unsubscribe(&self, endpoint_name: &str, topic: &str) -> Result<(), BusError> {
        endpoint::validate_relative_name(endpoint_name)?;
        endpoint::validate_relative_name(topic)?;
        let config = self.endpoints.config();
        let sub_link = config
            .endpoint_dir(endpoint_name)
            .join(endpoint::SUBSCRIPTIONS_DIR)
            .join(topic);
        fs::remove_file(&sub_link)?;
        remove_topic_link(config, endpoint_name, topic)?;
        debug!(endpoint = %endpoint_name, topic = %topic, "unsubscribed");
        Ok(())
    }

    /// Publish a payload to every current subscriber of a topic.
    ///
    /// Fan-out is best-effort and lossy: a subscriber whose queue cannot
    /// be reached is logged and skipped. Returns the number of
    /// deliveries that succeeded; publishing to a topic with no
    /// subscribers succeeds with zero.
    ///
    /// # Errors
    ///
    /// Only topic-level failures (invalid name, unreadable topic
    /// directory) error — per-subscriber failures never do.
    pub fn publish(
        &self,
        endpoint_name: &str,
        topic: &str,
        payload: &[u8],
    ) -> Result<usize, BusError> {
        endpoint::validate_relative_name(topic)?;
        let topic_dir = ensure_topic(self.endpoints.config(), topic)?;

        let mut delivered = 0;
        for entry in fs::read_dir(&topic_dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(topic = %topic, error = %err, "unreadable topic entry");
                    continue;
                }
            };
            let subscriber = match fs::read_link(entry.path()) {
                Ok(target) => target.to_string_lossy().into_owned(),
                Err(err) => {
                    warn!(
                        topic = %topic,
                        entry = %entry.path().display(),
                        error = %err,
                        "topic entry is not a subscriber link"
                    );
                    continue;
                }
            };
            match self
                .endpoints
                .send(endpoint_name, &subscriber, payload, Some(topic))
            {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        topic = %topic,
                        subscriber = %subscriber,
                        error = %err,
                        "publish delivery failed"
                    );
                }
            }
        }
        debug!(topic = %topic, delivered, "published");
        Ok(delivered)
    }
}

/// Create `<subscriptions>/<topic>` pointing at the topic directory,
/// building intermediate directories for multi-segment topic names.
fn link_subscription(subs_dir: &Path, topic: &str, topic_dir: &Path) -> Result<(), BusError> {
    let sub_link = subs_dir.join(topic);
    if let Some(parent) = sub_link.parent() {
        if parent != subs_dir {
            let rel = parent.strip_prefix(subs_dir).unwrap_or(Path::new(""));
            endpoint::create_dirs_with_mode(subs_dir, rel)?;
        }
    }
    unix_fs::symlink(topic_dir, &sub_link)?;
    Ok(())
}

/// An endpoint name as it appears inside a topic directory: path
/// separators become underscores so the name is a single filename.
pub(crate) fn flat_name(endpoint_name: &str) -> String {
    endpoint_name.replace('/', "_")
}

/// Remove `pubsub/<topic>/<flat>` for an endpoint. Shared with endpoint
/// close, which tears down every subscription of a dying mailbox.
pub(crate) fn remove_topic_link(
    config: &BusConfig,
    endpoint_name: &str,
    topic: &str,
) -> Result<(), BusError> {
    let link = config
        .pubsub_root()
        .join(topic)
        .join(flat_name(endpoint_name));
    fs::remove_file(link)?;
    Ok(())
}

/// Create the topic directory (and the pub/sub root) if missing,
/// applying the shared group mode to whatever this call creates.
fn ensure_topic(config: &BusConfig, topic: &str) -> Result<PathBuf, BusError> {
    let rel = Path::new("pubsub").join(topic);
    endpoint::create_dirs_with_mode(&config.root, &rel)?;
    Ok(config.root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_names_replace_separators() {
        assert_eq!(flat_name("svc/a"), "svc_a");
        assert_eq!(flat_name("plain"), "plain");
        assert_eq!(flat_name("a/b/c"), "a_b_c");
    }
}
