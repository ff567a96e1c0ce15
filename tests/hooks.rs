//! The publish/subscribe authorization hooks against in-memory doubles:
//! every accepted publish was authorized, refusals never reach the bus, and
//! the things service being down fails closed.

mod common;

use std::sync::Arc;

use bytes::Bytes;

use common::{FakeBus, FakeEvents, FakeThings};
use mqtt_adapter::envelope::RawMessage;
use mqtt_adapter::hooks::{Hooks, Refusal};
use mqtt_adapter::things::ThingId;

fn hooks(things: Arc<FakeThings>, bus: Arc<FakeBus>, events: Arc<FakeEvents>) -> Hooks {
    Hooks::new(things, bus, events, "adapter-test".into())
}

#[tokio::test]
async fn accepted_publish_is_authorized_and_bridged() {
    let things = Arc::new(
        FakeThings::default()
            .with_thing(b"abc", "thing-1")
            .with_connection(b"abc", "ch-9"),
    );
    let bus = Arc::new(FakeBus::default());
    let hooks = hooks(things.clone(), bus.clone(), Arc::new(FakeEvents::default()));

    hooks
        .authorize_publish(b"abc", "channels/ch-9/messages/temp/room-1", Bytes::from_static(br#"{"t":22}"#))
        .await
        .expect("publish should be accepted");

    // Exactly one authorization, with the connection's key and the topic's
    // channel.
    assert_eq!(things.calls(), vec![(b"abc".to_vec(), "ch-9".to_string())]);

    // Exactly one bus message, on the translated subject, with the
    // platform-canonical envelope.
    let published = bus.published();
    assert_eq!(published.len(), 1);

    let (subject, payload) = &published[0];
    assert_eq!(subject, "channel.ch-9.temp.room-1");

    let envelope = RawMessage::decode_from(payload).unwrap();
    assert_eq!(envelope.channel, "ch-9");
    assert_eq!(envelope.subtopic, "temp.room-1");
    assert_eq!(envelope.publisher, "thing-1");
    assert_eq!(envelope.protocol, "mqtt");
    assert_eq!(&envelope.payload[..], br#"{"t":22}"#);
}

#[tokio::test]
async fn wildcard_subtopic_is_refused_before_authorization() {
    let things = Arc::new(
        FakeThings::default()
            .with_thing(b"abc", "thing-1")
            .with_connection(b"abc", "ch-1"),
    );
    let bus = Arc::new(FakeBus::default());
    let hooks = hooks(things.clone(), bus.clone(), Arc::new(FakeEvents::default()));

    let refusal = hooks
        .authorize_publish(b"abc", "channels/ch-1/messages/a*b", Bytes::from_static(b"x"))
        .await
        .unwrap_err();

    assert!(matches!(refusal, Refusal::InvalidTopic(_)));
    assert!(bus.published().is_empty(), "refused publish reached the bus");
    assert!(things.calls().is_empty(), "invalid topic should not authorize");
}

#[tokio::test]
async fn unauthorized_publish_never_reaches_the_bus() {
    let things = Arc::new(FakeThings::default().with_thing(b"abc", "thing-1"));
    let bus = Arc::new(FakeBus::default());
    let hooks = hooks(things.clone(), bus.clone(), Arc::new(FakeEvents::default()));

    let refusal = hooks
        .authorize_publish(b"abc", "channels/ch-9/messages", Bytes::from_static(b"x"))
        .await
        .unwrap_err();

    assert!(matches!(refusal, Refusal::Unauthorized));
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn auth_outage_fails_closed() {
    let things = Arc::new(
        FakeThings::default()
            .with_thing(b"abc", "thing-1")
            .with_connection(b"abc", "ch-9"),
    );
    things.set_unavailable(true);

    let bus = Arc::new(FakeBus::default());
    let hooks = hooks(things.clone(), bus.clone(), Arc::new(FakeEvents::default()));

    for _ in 0..5 {
        let refusal = hooks
            .authorize_publish(b"abc", "channels/ch-9/messages", Bytes::from_static(b"x"))
            .await
            .unwrap_err();

        assert!(matches!(refusal, Refusal::Unavailable(_)));
    }

    assert!(bus.published().is_empty(), "no publish may slip through an outage");

    let refusal = hooks
        .authorize_subscribe(b"abc", &["channels/ch-9/messages/#"])
        .await
        .unwrap_err();
    assert!(matches!(refusal, Refusal::Unavailable(_)));
}

#[tokio::test]
async fn subscribe_is_rejected_wholesale() {
    let things = Arc::new(
        FakeThings::default()
            .with_thing(b"abc", "thing-1")
            .with_connection(b"abc", "ch-1"),
    );
    let hooks = hooks(
        things.clone(),
        Arc::new(FakeBus::default()),
        Arc::new(FakeEvents::default()),
    );

    // ch-1 is allowed, ch-2 is not: the whole SUBSCRIBE fails.
    let refusal = hooks
        .authorize_subscribe(
            b"abc",
            &["channels/ch-1/messages/#", "channels/ch-2/messages"],
        )
        .await
        .unwrap_err();

    assert!(matches!(refusal, Refusal::Unauthorized));

    // Both-allowed goes through, authorizing each filter.
    hooks
        .authorize_subscribe(
            b"abc",
            &["channels/ch-1/messages/#", "channels/ch-1/messages/+/a"],
        )
        .await
        .expect("both filters are allowed");
}

#[tokio::test]
async fn lifecycle_events_carry_kind_and_instance() {
    let events = Arc::new(FakeEvents::default());
    let hooks = hooks(
        Arc::new(FakeThings::default()),
        Arc::new(FakeBus::default()),
        events.clone(),
    );

    let thing = ThingId::new("thing-1");
    hooks.connected(&thing).await;
    hooks.disconnected(&thing).await;

    let appended = events.appended();
    assert_eq!(appended.len(), 2);

    assert_eq!(appended[0].thing_id, "thing-1");
    assert_eq!(appended[0].kind.as_str(), "connect");
    assert_eq!(appended[0].instance, "adapter-test");
    assert_eq!(appended[1].kind.as_str(), "disconnect");
    assert!(appended[0].timestamp <= appended[1].timestamp);
}

#[tokio::test]
async fn event_stream_failures_stay_contained() {
    let hooks = hooks(
        Arc::new(FakeThings::default()),
        Arc::new(FakeBus::default()),
        Arc::new(FakeEvents::failing()),
    );

    // Both calls log and return; a dead event stream must never affect the
    // connection.
    let thing = ThingId::new("thing-1");
    hooks.connected(&thing).await;
    hooks.disconnected(&thing).await;
}
