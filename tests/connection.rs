//! The per-connection state machine driven through real packet flows over a
//! scripted transport: session resumption with offline-queue drain,
//! retained pass-through, QoS 2 duplicate suppression, will firing, and
//! session takeover.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mqtt_protocol::{
    Connect, ConnectReturnCode, LastWill, Login, Packet, PubRel, Publish, QoS, Subscribe,
    SubscribeFilter, SubscribeReasonCode,
};
use tokio_util::sync::CancellationToken;

use common::{decode_packets, FakeBus, FakeEvents, FakePersistence, FakeThings, ScriptedSocket};
use mqtt_adapter::broker::fanout::Fanout;
use mqtt_adapter::broker::{Connection, ConnectionData, ConnectionId, Shared};
use mqtt_adapter::envelope::RawMessage;
use mqtt_adapter::hooks::Hooks;
use mqtt_adapter::store::EmitterFrame;

struct Harness {
    things: Arc<FakeThings>,
    bus: Arc<FakeBus>,
    events: Arc<FakeEvents>,
    persistence: Arc<FakePersistence>,
    shared: Arc<Shared>,
}

fn harness(things: FakeThings, persistence: FakePersistence) -> Harness {
    let things = Arc::new(things);
    let bus = Arc::new(FakeBus::default());
    let events = Arc::new(FakeEvents::default());
    let persistence = Arc::new(persistence);
    let fanout = Fanout::default();

    let shared = Arc::new(Shared {
        hooks: Hooks::new(
            things.clone(),
            bus.clone(),
            events.clone(),
            "adapter-a".into(),
        ),
        persistence: persistence.clone(),
        fanout,
        instance: "adapter-a".into(),
    });

    Harness {
        things,
        bus,
        events,
        persistence,
        shared,
    }
}

fn connect(client_id: &str, clean_session: bool, key: &[u8], will: Option<LastWill>) -> Packet {
    Packet::Connect(Connect {
        keep_alive: 0,
        client_id: client_id.into(),
        clean_session,
        last_will: will,
        login: Some(Login {
            username: String::new(),
            password: Bytes::copy_from_slice(key),
        }),
    })
}

async fn run(harness: &Harness, socket: ScriptedSocket) -> ConnectionData {
    Connection::new(
        ConnectionId::default(),
        socket,
        CancellationToken::new(),
        harness.shared.clone(),
    )
    .run()
    .await
}

#[tokio::test]
async fn resumed_session_drains_the_offline_queue() {
    let h = harness(
        FakeThings::default().with_thing(b"abc", "thing-1"),
        FakePersistence::default()
            .with_session("dev-1", false)
            .with_subscription("dev-1", "channels/ch-1/messages/#", QoS::AtLeastOnce)
            .with_queued(
                "dev-1",
                EmitterFrame::new(
                    "channels/ch-1/messages/alpha".into(),
                    Bytes::from_static(b"queued"),
                    QoS::AtLeastOnce,
                    false,
                ),
            ),
    );

    let (socket, written) = ScriptedSocket::closing(vec![connect("dev-1", false, b"abc", None)]);
    let data = run(&h, socket).await;
    assert_eq!(data.client_id.as_deref(), Some("dev-1"));

    let sent = decode_packets(&written.lock().unwrap());
    assert_eq!(sent.len(), 2, "expected CONNACK then the queued publish: {sent:?}");

    let Packet::ConnAck(connack) = &sent[0] else {
        panic!("expected CONNACK, got {:?}", sent[0]);
    };
    assert_eq!(connack.code, ConnectReturnCode::Success);
    assert!(connack.session_present, "resumed session must be reported");

    let Packet::Publish(publish) = &sent[1] else {
        panic!("expected the queued PUBLISH, got {:?}", sent[1]);
    };
    assert_eq!(&publish.topic[..], b"channels/ch-1/messages/alpha");
    assert_eq!(&publish.payload[..], b"queued");
    assert_eq!(publish.qos, QoS::AtLeastOnce);

    // Drained, not copied.
    assert!(h.persistence.queues.lock().unwrap().get("dev-1").is_none());

    // Exactly one connect and one matching disconnect on the stream.
    let events = h.events.appended();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind.as_str(), "connect");
    assert_eq!(events[0].thing_id, "thing-1");
    assert_eq!(events[1].kind.as_str(), "disconnect");
    assert_eq!(events[1].thing_id, "thing-1");
}

#[tokio::test]
async fn retained_publish_reaches_a_new_subscriber() {
    let h = harness(
        FakeThings::default()
            .with_thing(b"abc", "thing-1")
            .with_connection(b"abc", "ch-2"),
        FakePersistence::default(),
    );

    let (socket, written) = ScriptedSocket::closing(vec![
        connect("dev-2", true, b"abc", None),
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            pkid: 1,
            topic: Bytes::from_static(b"channels/ch-2/messages"),
            payload: Bytes::from_static(b"state"),
        }),
        Packet::Subscribe(Subscribe {
            pkid: 2,
            filters: vec![SubscribeFilter {
                path: "channels/ch-2/messages".into(),
                qos: QoS::AtMostOnce,
            }],
        }),
    ]);

    run(&h, socket).await;

    let sent = decode_packets(&written.lock().unwrap());
    assert_eq!(sent.len(), 4, "{sent:?}");

    assert!(matches!(&sent[0], Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success));
    assert!(matches!(&sent[1], Packet::PubAck(ack) if ack.pkid == 1));

    let Packet::SubAck(suback) = &sent[2] else {
        panic!("expected SUBACK, got {:?}", sent[2]);
    };
    assert_eq!(suback.pkid, 2);
    assert_eq!(
        suback.return_codes,
        vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]
    );

    // The retained copy opens the new subscription, capped at its QoS.
    let Packet::Publish(publish) = &sent[3] else {
        panic!("expected the retained PUBLISH, got {:?}", sent[3]);
    };
    assert!(publish.retain);
    assert_eq!(&publish.topic[..], b"channels/ch-2/messages");
    assert_eq!(&publish.payload[..], b"state");
    assert_eq!(publish.qos, QoS::AtMostOnce);

    // The device publish itself crossed the bus exactly once.
    assert_eq!(h.bus.published().len(), 1);
}

#[tokio::test]
async fn duplicate_qos2_publish_is_reacked_but_not_reprocessed() {
    let h = harness(
        FakeThings::default()
            .with_thing(b"abc", "thing-1")
            .with_connection(b"abc", "ch-3"),
        FakePersistence::default(),
    );

    let publish = Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        pkid: 5,
        topic: Bytes::from_static(b"channels/ch-3/messages"),
        payload: Bytes::from_static(b"x"),
    };
    let mut redelivery = publish.clone();
    redelivery.dup = true;

    let (socket, written) = ScriptedSocket::closing(vec![
        connect("dev-3", true, b"abc", None),
        Packet::Publish(publish),
        Packet::Publish(redelivery),
        Packet::PubRel(PubRel { pkid: 5 }),
    ]);

    run(&h, socket).await;

    let sent = decode_packets(&written.lock().unwrap());
    assert_eq!(sent.len(), 4, "{sent:?}");
    assert!(matches!(&sent[0], Packet::ConnAck(..)));
    assert!(matches!(&sent[1], Packet::PubRec(p) if p.pkid == 5));
    assert!(matches!(&sent[2], Packet::PubRec(p) if p.pkid == 5));
    assert!(matches!(&sent[3], Packet::PubComp(p) if p.pkid == 5));

    // The redelivery was acked from the duplicate-suppression set without
    // re-authorizing or re-publishing.
    assert_eq!(h.things.calls().len(), 1);
    assert_eq!(h.bus.published().len(), 1);
}

#[tokio::test]
async fn ungraceful_close_fires_the_will_through_authorization() {
    let will = LastWill {
        topic: "channels/ch-4/messages/status".into(),
        message: Bytes::from_static(b"offline"),
        qos: QoS::AtLeastOnce,
        retain: false,
    };

    let h = harness(
        FakeThings::default()
            .with_thing(b"abc", "thing-1")
            .with_connection(b"abc", "ch-4"),
        FakePersistence::default(),
    );

    // The socket drops after CONNECT with no DISCONNECT packet.
    let (socket, _written) =
        ScriptedSocket::closing(vec![connect("dev-4", true, b"abc", Some(will))]);
    run(&h, socket).await;

    let published = h.bus.published();
    assert_eq!(published.len(), 1, "the will must reach the bus");

    let (subject, payload) = &published[0];
    assert_eq!(subject, "channel.ch-4.status");

    let envelope = RawMessage::decode_from(payload).unwrap();
    assert_eq!(envelope.channel, "ch-4");
    assert_eq!(envelope.subtopic, "status");
    assert_eq!(envelope.publisher, "thing-1");
    assert_eq!(envelope.protocol, "mqtt");
    assert_eq!(&envelope.payload[..], b"offline");

    // The stored copy was consumed, not left behind.
    assert!(h.persistence.wills.lock().unwrap().is_empty());
}

#[tokio::test]
async fn clean_disconnect_discards_the_will_and_drops_the_clean_session() {
    let will = LastWill {
        topic: "channels/ch-4/messages/status".into(),
        message: Bytes::from_static(b"offline"),
        qos: QoS::AtLeastOnce,
        retain: false,
    };

    let h = harness(
        FakeThings::default()
            .with_thing(b"abc", "thing-1")
            .with_connection(b"abc", "ch-4"),
        FakePersistence::default(),
    );

    let (socket, _written) = ScriptedSocket::closing(vec![
        connect("dev-4", true, b"abc", Some(will)),
        Packet::Disconnect,
    ]);
    run(&h, socket).await;

    assert!(h.bus.published().is_empty(), "a discarded will reached the bus");
    assert!(h.persistence.wills.lock().unwrap().is_empty());
    assert_eq!(
        *h.persistence.dropped.lock().unwrap(),
        vec!["dev-4".to_string()]
    );
}

#[tokio::test]
async fn second_connect_takes_over_the_session() {
    let h = harness(
        FakeThings::default().with_thing(b"abc", "thing-5"),
        FakePersistence::default(),
    );

    // First connection comes up and stays idle.
    let (socket_1, _written_1) =
        ScriptedSocket::holding(vec![connect("dev-5", false, b"abc", None)]);
    let conn_1 = Connection::new(
        ConnectionId::default(),
        socket_1,
        CancellationToken::new(),
        h.shared.clone(),
    );
    let running = tokio::spawn(conn_1.run());

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.events.appended().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("first connection never came up");

    // Same client id connects again; the registry replacement closes the
    // old delivery channel and the first connection shuts down.
    let (socket_2, written_2) = ScriptedSocket::closing(vec![connect("dev-5", false, b"abc", None)]);
    run(&h, socket_2).await;

    let data = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("replaced connection never exited")
        .unwrap();
    assert_eq!(data.client_id.as_deref(), Some("dev-5"));

    let sent = decode_packets(&written_2.lock().unwrap());
    assert!(matches!(&sent[0], Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success));

    // Each connection produced exactly one connect and one disconnect.
    let events = h.events.appended();
    assert_eq!(events.len(), 4, "{events:?}");
    assert_eq!(
        events.iter().filter(|e| e.kind.as_str() == "connect").count(),
        2
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind.as_str() == "disconnect")
            .count(),
        2
    );
}
