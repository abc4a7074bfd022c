use postbox::{BusConfig, Endpoints, PubSub};
use std::path::PathBuf;
use tempfile::TempDir;

/// A bus rooted in a scratch directory, with a fixed signing identity so
/// attribution assertions are deterministic. The `TempDir` must be kept
/// alive for the duration of the test.
pub struct TestBus {
    pub dir: TempDir,
    pub pubsub: PubSub,
}

impl TestBus {
    pub fn endpoints(&self) -> &Endpoints {
        self.pubsub.endpoints()
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("ipc")
    }

    pub fn endpoint_dir(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }

    pub fn topic_dir(&self, topic: &str) -> PathBuf {
        self.root().join("pubsub").join(topic)
    }
}

pub fn test_bus() -> TestBus {
    test_bus_as("Alice Example", "alice@example.com", "alice.key")
}

/// A second process identity sharing the same root — used to exercise
/// cross-user attribution through the shared keyring.
pub fn join_bus_as(bus: &TestBus, name: &str, email: &str, key_file: &str) -> PubSub {
    let config = config_for(&bus.dir, name, email, key_file);
    PubSub::new(config).unwrap()
}

pub fn test_bus_as(name: &str, email: &str, key_file: &str) -> TestBus {
    if std::env::var("USER").is_err() && std::env::var("LOGNAME").is_err() {
        std::env::set_var("USER", "tester");
    }
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir, name, email, key_file);
    let pubsub = PubSub::new(config).unwrap();
    TestBus { dir, pubsub }
}

fn config_for(dir: &TempDir, name: &str, email: &str, key_file: &str) -> BusConfig {
    let mut config = BusConfig::at_root(dir.path().join("ipc"));
    config.keypair = dir.path().join(key_file);
    config.identity.name = name.to_string();
    config.identity.email = email.to_string();
    config
}
