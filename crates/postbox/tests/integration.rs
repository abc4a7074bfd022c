//! End-to-end scenarios over a scratch IPC root: endpoint lifecycle,
//! point-to-point delivery, pub/sub fan-out, and tamper handling.

mod common;

use common::{join_bus_as, test_bus};
use postbox::{BusError, QueueError};
use postbox_wire::{current_user, Envelope, EnvelopeError};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, Instant};

#[test]
fn open_is_idempotent_and_leaves_the_expected_layout() {
    let bus = test_bus();
    let endpoints = bus.endpoints();

    let first = endpoints.open(Some("svc/a")).unwrap();
    let second = endpoints.open(Some("svc/a")).unwrap();
    assert_eq!(first, "svc/a");
    assert_eq!(second, "svc/a");

    let dir = bus.endpoint_dir("svc/a");
    assert!(dir.join("queue").is_dir());
    assert!(dir.join("subscriptions").is_dir());

    let owner = fs::read_to_string(dir.join("owner")).unwrap();
    assert_eq!(owner.trim(), current_user().unwrap());
}

#[test]
fn endpoint_directories_carry_group_and_setgid_bits() {
    let bus = test_bus();
    bus.endpoints().open(Some("svc/perms")).unwrap();

    for dir in [
        bus.endpoint_dir("svc/perms"),
        bus.endpoint_dir("svc/perms").join("queue"),
        bus.endpoint_dir("svc/perms").join("subscriptions"),
    ] {
        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o2770, "wrong mode on {}", dir.display());
    }
}

#[test]
fn open_refuses_a_directory_it_did_not_create() {
    let bus = test_bus();
    fs::create_dir_all(bus.endpoint_dir("squatter")).unwrap();

    assert!(matches!(
        bus.endpoints().open(Some("squatter")),
        Err(BusError::NotAnEndpoint(_))
    ));
}

#[test]
fn send_recv_round_trip_without_topic() {
    let bus = test_bus();
    let endpoints = bus.endpoints();
    endpoints.open(Some("e1")).unwrap();
    endpoints.open(Some("e2")).unwrap();

    endpoints.send("e1", "e2", b"hello", None).unwrap();
    let token = endpoints.recv("e2", -1).unwrap();

    let envelope = Envelope::from_token(&token).unwrap();
    assert_eq!(envelope.data().unwrap(), b"hello");
    assert_eq!(envelope.source().unwrap(), "e1");
    assert_eq!(envelope.destination().unwrap(), "e2");
    assert!(matches!(
        envelope.topic(),
        Err(EnvelopeError::FieldMissing("topic"))
    ));

    let info = envelope.validate(bus.endpoints().signer().as_ref()).unwrap();
    assert!(info.valid);
    assert_eq!(info.name, "Alice Example");
}

#[test]
fn publish_delivers_topic_and_payload() {
    let bus = test_bus();
    let endpoints = bus.endpoints();
    endpoints.open(Some("e1")).unwrap();
    endpoints.open(Some("e2")).unwrap();
    bus.pubsub.subscribe("e2", "t/x").unwrap();

    let delivered = bus.pubsub.publish("e1", "t/x", b"payload").unwrap();
    assert_eq!(delivered, 1);

    let token = endpoints.recv("e2", 1).unwrap();
    let envelope = Envelope::from_token(&token).unwrap();
    assert_eq!(envelope.topic().unwrap(), "t/x");
    assert_eq!(envelope.data().unwrap(), b"payload");
    assert_eq!(envelope.source().unwrap(), "e1");
}

#[test]
fn flipped_signature_fails_validation() {
    let bus = test_bus();
    let endpoints = bus.endpoints();
    endpoints.open(Some("e1")).unwrap();
    endpoints.open(Some("e2")).unwrap();
    endpoints.send("e1", "e2", b"hello", None).unwrap();

    let token = endpoints.recv("e2", -1).unwrap();
    let mut envelope = Envelope::from_token(&token).unwrap();
    let mut chars: Vec<char> = envelope.signature.chars().collect();
    chars[2] = if chars[2] == 'x' { 'y' } else { 'x' };
    envelope.signature = chars.into_iter().collect();
    let forged = envelope.to_token().unwrap();

    let reparsed = Envelope::from_token(&forged).unwrap();
    assert!(matches!(
        reparsed.validate(bus.endpoints().signer().as_ref()),
        Err(EnvelopeError::BadSignature)
    ));
}

#[test]
fn close_tears_down_subscriptions_and_future_publishes_deliver_nothing() {
    let bus = test_bus();
    let endpoints = bus.endpoints();
    endpoints.open(Some("e1")).unwrap();
    endpoints.open(Some("e2")).unwrap();
    bus.pubsub.subscribe("e2", "t/x").unwrap();

    // Both sides of the link pair exist while subscribed.
    let topic_link = bus.topic_dir("t/x").join("e2");
    let sub_link = bus.endpoint_dir("e2").join("subscriptions").join("t/x");
    assert!(fs::symlink_metadata(&topic_link).unwrap().is_symlink());
    assert!(fs::symlink_metadata(&sub_link).unwrap().is_symlink());

    endpoints.close("e2").unwrap();
    assert!(!bus.endpoint_dir("e2").exists());
    assert!(fs::symlink_metadata(&topic_link).is_err());

    let delivered = bus.pubsub.publish("e1", "t/x", b"again").unwrap();
    assert_eq!(delivered, 0);
}

#[test]
fn fanout_reaches_every_subscriber() {
    let bus = test_bus();
    let endpoints = bus.endpoints();
    endpoints.open(Some("pub")).unwrap();
    for sub in ["sub/a", "sub/b", "sub/c"] {
        endpoints.open(Some(sub)).unwrap();
        bus.pubsub.subscribe(sub, "news").unwrap();
    }

    let delivered = bus.pubsub.publish("pub", "news", b"extra extra").unwrap();
    assert_eq!(delivered, 3);

    for sub in ["sub/a", "sub/b", "sub/c"] {
        let token = endpoints.recv(sub, 1).unwrap();
        let envelope = Envelope::from_token(&token).unwrap();
        assert_eq!(envelope.topic().unwrap(), "news");
        assert_eq!(envelope.data().unwrap(), b"extra extra");
    }
}

#[test]
fn fanout_skips_a_broken_subscriber_and_reaches_the_rest() {
    let bus = test_bus();
    let endpoints = bus.endpoints();
    endpoints.open(Some("pub")).unwrap();
    endpoints.open(Some("healthy")).unwrap();
    endpoints.open(Some("broken")).unwrap();
    bus.pubsub.subscribe("healthy", "t").unwrap();
    bus.pubsub.subscribe("broken", "t").unwrap();

    // Break one subscriber behind the router's back.
    fs::remove_dir_all(bus.endpoint_dir("broken").join("queue")).unwrap();

    let delivered = bus.pubsub.publish("pub", "t", b"still goes out").unwrap();
    assert_eq!(delivered, 1);
    assert!(endpoints.recv("healthy", 1).is_ok());
}

#[test]
fn messages_arrive_in_send_order_per_destination() {
    let bus = test_bus();
    let endpoints = bus.endpoints();
    endpoints.open(Some("src")).unwrap();
    endpoints.open(Some("dst")).unwrap();

    for i in 0..5 {
        endpoints
            .send("src", "dst", format!("msg-{i}").as_bytes(), None)
            .unwrap();
    }
    for i in 0..5 {
        let token = endpoints.recv("dst", 0).unwrap();
        let envelope = Envelope::from_token(&token).unwrap();
        assert_eq!(envelope.data().unwrap(), format!("msg-{i}").as_bytes());
    }
}

#[test]
fn send_to_missing_endpoint_is_endpoint_unknown() {
    let bus = test_bus();
    bus.endpoints().open(Some("src")).unwrap();

    assert!(matches!(
        bus.endpoints().send("src", "ghost", b"x", None),
        Err(BusError::EndpointUnknown(name)) if name == "ghost"
    ));
}

#[test]
fn recv_times_out_as_configured() {
    let bus = test_bus();
    bus.endpoints().open(Some("idle")).unwrap();

    assert!(matches!(
        bus.endpoints().recv("idle", 0),
        Err(BusError::Timeout)
    ));

    let start = Instant::now();
    assert!(matches!(
        bus.endpoints().recv("idle", 1),
        Err(BusError::Timeout)
    ));
    assert!(start.elapsed() >= Duration::from_secs(1));
}

#[test]
fn anonymous_endpoints_are_private_and_unique() {
    let bus = test_bus();
    let endpoints = bus.endpoints();

    let a = endpoints.open(None).unwrap();
    let b = endpoints.open(None).unwrap();
    assert!(a.starts_with("priv/"));
    assert!(b.starts_with("priv/"));
    assert_ne!(a, b);
    assert!(bus.endpoint_dir(&a).join("queue").is_dir());

    endpoints.close(&a).unwrap();
    assert!(!bus.endpoint_dir(&a).exists());
}

#[test]
fn foreach_message_peeks_in_order_without_consuming() {
    let bus = test_bus();
    let endpoints = bus.endpoints();
    endpoints.open(Some("src")).unwrap();
    endpoints.open(Some("dst")).unwrap();
    for i in 0..3 {
        endpoints
            .send("src", "dst", format!("m{i}").as_bytes(), None)
            .unwrap();
    }

    let mut seen = Vec::new();
    endpoints
        .foreach_message("dst", |name, token| {
            assert_eq!(name, "dst");
            let envelope = Envelope::from_token(token).unwrap();
            seen.push(String::from_utf8(envelope.data().unwrap()).unwrap());
        })
        .unwrap();
    assert_eq!(seen, vec!["m0", "m1", "m2"]);

    // Peeking consumed nothing.
    assert!(bus.endpoints().recv("dst", 0).is_ok());
}

#[test]
fn close_aborts_when_the_queue_cannot_be_destroyed() {
    let bus = test_bus();
    bus.endpoints().open(Some("hollow")).unwrap();
    fs::remove_dir_all(bus.endpoint_dir("hollow").join("queue")).unwrap();

    assert!(matches!(
        bus.endpoints().close("hollow"),
        Err(BusError::Queue(QueueError::Missing(_)))
    ));
}

#[test]
fn subscribing_an_unopened_endpoint_fails() {
    let bus = test_bus();
    assert!(matches!(
        bus.pubsub.subscribe("ghost", "t"),
        Err(BusError::EndpointUnknown(_))
    ));
}

#[test]
fn unsubscribe_removes_both_links() {
    let bus = test_bus();
    bus.endpoints().open(Some("e")).unwrap();
    bus.pubsub.subscribe("e", "t/deep/topic").unwrap();

    bus.pubsub.unsubscribe("e", "t/deep/topic").unwrap();
    assert!(fs::symlink_metadata(bus.topic_dir("t/deep/topic").join("e")).is_err());
    assert!(
        fs::symlink_metadata(bus.endpoint_dir("e").join("subscriptions").join("t/deep/topic"))
            .is_err()
    );

    // The pair is really gone: a fresh subscribe succeeds.
    bus.pubsub.subscribe("e", "t/deep/topic").unwrap();
}

#[test]
fn messages_from_another_user_attribute_through_the_shared_keyring() {
    let bus = test_bus();
    bus.endpoints().open(Some("inbox")).unwrap();

    let bob = join_bus_as(&bus, "Bob Example", "bob@example.com", "bob.key");
    bob.endpoints().open(Some("bob/out")).unwrap();
    bob.endpoints()
        .send("bob/out", "inbox", b"from bob", None)
        .unwrap();

    let token = bus.endpoints().recv("inbox", 1).unwrap();
    let envelope = Envelope::from_token(&token).unwrap();
    let info = envelope.validate(bus.endpoints().signer().as_ref()).unwrap();
    assert!(info.valid);
    assert_eq!(info.name, "Bob Example");
    assert_eq!(info.email, "bob@example.com");
    assert_eq!(envelope.data().unwrap(), b"from bob");
}

#[test]
fn reserved_names_are_rejected() {
    let bus = test_bus();
    assert!(matches!(
        bus.endpoints().open(Some("pubsub/sneaky")),
        Err(BusError::InvalidName(_))
    ));
    assert!(matches!(
        bus.endpoints().open(Some("../escape")),
        Err(BusError::InvalidName(_))
    ));
}
