//! End-to-end broker tests over in-memory duplex transports.
//!
//! Library clients exercise the friendly path; raw packet I/O is used where
//! a test needs to misbehave (duplicate QoS 2 publishes, withheld
//! acknowledgements) or to inspect CONNACK flags directly.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use mqttd::backend::MemoryBackend;
use mqttd::broker::{Engine, EngineOptions};
use mqttd::client::{Client, ConnectOptions, Messages};
use mqttd::packet::{
    self, ConnAck, Connect, ConnectReturnCode, Packet, PubComp, PubRec, PubRel, Publish, QoS,
    SubAck, Subscribe, SubscribeFilter, SubscribeReasonCode,
};
use mqttd::transport::DirectSocket;
use mqttd::Message;

fn peer_addr() -> SocketAddr {
    "127.0.0.1:1883".parse().unwrap()
}

fn engine() -> Engine<MemoryBackend> {
    Engine::new(MemoryBackend::new(), EngineOptions::default())
}

/// Connect a library client through an in-memory transport pair.
async fn connect(engine: &Engine<MemoryBackend>, options: ConnectOptions) -> (Client, Messages) {
    let (client_side, server_side) = tokio::io::duplex(4096);

    engine.handle(DirectSocket::new(peer_addr(), server_side));

    Client::connect(DirectSocket::new(peer_addr(), client_side), options)
        .await
        .expect("client failed to connect")
}

/// A raw peer: hand-encoded packets over the client half of a duplex pipe.
struct RawPeer {
    stream: DuplexStream,
    read_buf: BytesMut,
}

impl RawPeer {
    fn open(engine: &Engine<MemoryBackend>) -> Self {
        let (client_side, server_side) = tokio::io::duplex(4096);

        engine.handle(DirectSocket::new(peer_addr(), server_side));

        RawPeer {
            stream: client_side,
            read_buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, packet: Packet) {
        let mut buf = Vec::new();
        packet::write(&packet, &mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Packet> {
        loop {
            match packet::read_mut(&mut self.read_buf, usize::MAX) {
                Ok(packet) => return Some(packet),
                Err(e) if e.is_incomplete() => {}
                Err(e) => panic!("broker sent a malformed packet: {e}"),
            }

            let read = self.stream.read_buf(&mut self.read_buf).await.unwrap();
            if read == 0 {
                return None;
            }
        }
    }

    /// CONNECT and expect a successful CONNACK, returning `session_present`.
    async fn handshake(&mut self, client_id: &str, clean_session: bool) -> bool {
        self.send(Packet::Connect(Connect {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            clean_session,
            keep_alive: 0,
            client_id: client_id.into(),
            last_will: None,
            login: None,
        }))
        .await;

        match self.recv().await {
            Some(Packet::ConnAck(ConnAck {
                code: ConnectReturnCode::Success,
                session_present,
            })) => session_present,
            other => panic!("expected successful CONNACK, got {other:?}"),
        }
    }
}

// Scenario: retained round-trip.
#[tokio::test]
async fn retained_message_reaches_a_later_subscriber() {
    let engine = engine();

    let (publisher, _messages) = connect(&engine, ConnectOptions::new("publisher")).await;
    publisher
        .publish("a/b", Bytes::from_static(b"hi"), QoS::AtLeastOnce, true)
        .await
        .unwrap();

    let (subscriber, mut messages) = connect(&engine, ConnectOptions::new("subscriber")).await;
    subscriber.subscribe("a/+", QoS::AtMostOnce).await.unwrap();

    let message = messages.recv().await.unwrap();
    assert_eq!(message.topic, "a/b");
    assert_eq!(message.payload, Bytes::from_static(b"hi"));
    assert_eq!(message.qos, QoS::AtMostOnce);
    assert!(message.retain);
}

// Scenario: `#` matches the parent and all descendants, but not siblings.
#[tokio::test]
async fn multi_level_wildcard_matches_whole_subtree() {
    let engine = engine();

    let (subscriber, mut messages) = connect(&engine, ConnectOptions::new("subscriber")).await;
    subscriber.subscribe("sport/#", QoS::AtMostOnce).await.unwrap();

    let (publisher, _messages) = connect(&engine, ConnectOptions::new("publisher")).await;

    for topic in ["sport", "sport/tennis", "sport/tennis/player1", "sports", "sport/done"] {
        publisher
            .publish(topic, Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(messages.recv().await.unwrap().topic);
    }

    // `sports` must not be in the stream; `sport/done` arriving last proves it
    // was skipped rather than still in flight.
    assert_eq!(
        received,
        ["sport", "sport/tennis", "sport/tennis/player1", "sport/done"]
    );
}

// Scenario: `$`-topics are invisible to `#`.
#[tokio::test]
async fn dollar_topics_do_not_match_wildcard_subscriptions() {
    let engine = engine();

    let (subscriber, mut messages) = connect(&engine, ConnectOptions::new("subscriber")).await;
    subscriber.subscribe("#", QoS::AtMostOnce).await.unwrap();

    let (publisher, _messages) = connect(&engine, ConnectOptions::new("publisher")).await;

    publisher
        .publish("$SYS/uptime", Bytes::from_static(b"42"), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    publisher
        .publish("visible", Bytes::from_static(b"ok"), QoS::AtLeastOnce, false)
        .await
        .unwrap();

    // The first thing the subscriber sees is the marker, not the `$SYS` publish.
    let message = messages.recv().await.unwrap();
    assert_eq!(message.topic, "visible");
}

// Scenario: a duplicate QoS 2 publish is delivered exactly once.
#[tokio::test]
async fn duplicate_qos2_publish_is_delivered_once() {
    let engine = engine();

    let (subscriber, mut messages) = connect(&engine, ConnectOptions::new("subscriber")).await;
    subscriber.subscribe("t", QoS::ExactlyOnce).await.unwrap();

    let mut publisher = RawPeer::open(&engine);
    assert!(!publisher.handshake("raw-publisher", true).await);

    let publish = Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "t".into(),
        pkid: 7,
        payload: Bytes::from_static(b"hi"),
    };

    publisher.send(Packet::Publish(publish.clone())).await;
    publisher
        .send(Packet::Publish(Publish {
            dup: true,
            ..publish
        }))
        .await;

    // PUBREC is repeated for the duplicate.
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubRec(PubRec { pkid: 7 }))
    );
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubRec(PubRec { pkid: 7 }))
    );

    publisher.send(Packet::PubRel(PubRel { pkid: 7 })).await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubComp(PubComp { pkid: 7 }))
    );

    // Exactly one copy reaches the subscriber; a marker publish proves there
    // is no second copy behind it.
    publisher
        .send(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".into(),
            pkid: 0,
            payload: Bytes::from_static(b"marker"),
        }))
        .await;

    assert_eq!(messages.recv().await.unwrap().payload, Bytes::from_static(b"hi"));
    assert_eq!(
        messages.recv().await.unwrap().payload,
        Bytes::from_static(b"marker")
    );
}

// Scenario: the will fires on an abrupt disconnect.
#[tokio::test]
async fn will_is_published_when_the_connection_drops() {
    let engine = engine();

    let (subscriber, mut messages) = connect(&engine, ConnectOptions::new("subscriber")).await;
    subscriber.subscribe("w", QoS::AtLeastOnce).await.unwrap();

    let options = ConnectOptions::new("mortal")
        .will(Message::new("w", Bytes::from_static(b"bye"), QoS::AtLeastOnce));
    let (client, client_messages) = connect(&engine, options).await;

    // Dropping every handle tears the transport down without a DISCONNECT.
    drop(client);
    drop(client_messages);

    let message = messages.recv().await.unwrap();
    assert_eq!(message.topic, "w");
    assert_eq!(message.payload, Bytes::from_static(b"bye"));
}

// Scenario: a clean DISCONNECT suppresses the will.
#[tokio::test]
async fn clean_disconnect_suppresses_the_will() {
    let engine = engine();

    let (subscriber, mut messages) = connect(&engine, ConnectOptions::new("subscriber")).await;
    subscriber.subscribe("w", QoS::AtLeastOnce).await.unwrap();

    let options = ConnectOptions::new("mortal")
        .will(Message::new("w", Bytes::from_static(b"bye"), QoS::AtLeastOnce));
    let (client, _client_messages) = connect(&engine, options).await;

    client.disconnect().await.unwrap();

    // Publish a marker afterwards; it must be the first (and only) delivery.
    let (publisher, _messages) = connect(&engine, ConnectOptions::new("publisher")).await;
    publisher
        .publish("w", Bytes::from_static(b"marker"), QoS::AtLeastOnce, false)
        .await
        .unwrap();

    assert_eq!(
        messages.recv().await.unwrap().payload,
        Bytes::from_static(b"marker")
    );
}

#[tokio::test]
async fn session_present_follows_the_clean_session_flag() {
    let engine = engine();

    let mut first = RawPeer::open(&engine);
    assert!(!first.handshake("sess", false).await);
    first.send(Packet::Disconnect).await;
    drop(first);

    // Stored state is resumed...
    let mut second = RawPeer::open(&engine);
    assert!(second.handshake("sess", false).await);
    second.send(Packet::Disconnect).await;
    drop(second);

    // ...until a clean session discards it.
    let mut third = RawPeer::open(&engine);
    assert!(!third.handshake("sess", true).await);
}

#[tokio::test]
async fn second_connection_with_same_client_id_displaces_the_first() {
    let engine = engine();

    let mut first = RawPeer::open(&engine);
    first.handshake("dup", true).await;

    let mut second = RawPeer::open(&engine);
    // The handshake completing proves the prior holder was terminated first:
    // attach blocks until the old connection hands its session back.
    second.handshake("dup", true).await;

    // The first connection is gone.
    assert_eq!(first.recv().await, None);
}

#[tokio::test]
async fn unacknowledged_qos1_publish_is_redelivered_with_dup() {
    let engine = engine();

    let mut subscriber = RawPeer::open(&engine);
    subscriber.handshake("redeliver", false).await;

    subscriber
        .send(Packet::Subscribe(Subscribe {
            pkid: 1,
            filters: vec![SubscribeFilter {
                path: "r".into(),
                qos: QoS::AtLeastOnce,
            }],
        }))
        .await;

    assert_eq!(
        subscriber.recv().await,
        Some(Packet::SubAck(SubAck {
            pkid: 1,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
        }))
    );

    let (publisher, _messages) = connect(&engine, ConnectOptions::new("publisher")).await;
    publisher
        .publish("r", Bytes::from_static(b"once"), QoS::AtLeastOnce, false)
        .await
        .unwrap();

    // Receive the publish but never acknowledge it.
    let first = match subscriber.recv().await {
        Some(Packet::Publish(publish)) => publish,
        other => panic!("expected PUBLISH, got {other:?}"),
    };

    assert!(!first.dup);

    subscriber.send(Packet::Disconnect).await;
    drop(subscriber);

    // On reconnect the unacknowledged publish comes back, flagged DUP, with
    // the same packet ID.
    let mut resumed = RawPeer::open(&engine);
    assert!(resumed.handshake("redeliver", false).await);

    let replayed = match resumed.recv().await {
        Some(Packet::Publish(publish)) => publish,
        other => panic!("expected PUBLISH, got {other:?}"),
    };

    assert!(replayed.dup);
    assert_eq!(replayed.pkid, first.pkid);
    assert_eq!(replayed.payload, Bytes::from_static(b"once"));
}

#[tokio::test]
async fn connect_timeout_closes_silent_connections() {
    let engine = Engine::new(
        MemoryBackend::new(),
        EngineOptions {
            connect_timeout: Duration::from_millis(50),
            ..EngineOptions::default()
        },
    );

    let mut peer = RawPeer::open(&engine);

    // Without a CONNECT the broker hangs up with no response at all.
    assert_eq!(peer.recv().await, None);
}

#[tokio::test]
async fn oversized_packets_end_the_connection() {
    let engine = Engine::new(
        MemoryBackend::new(),
        EngineOptions {
            max_packet_size: 128,
            ..EngineOptions::default()
        },
    );

    let mut peer = RawPeer::open(&engine);
    peer.handshake("biggun", true).await;

    peer.send(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "t".into(),
        pkid: 0,
        payload: Bytes::from(vec![0u8; 1024]),
    }))
    .await;

    // No response mid-stream; the connection just ends.
    assert_eq!(peer.recv().await, None);
}

#[tokio::test]
async fn rejects_unsupported_protocol_levels() {
    let engine = engine();
    let mut peer = RawPeer::open(&engine);

    peer.send(Packet::Connect(Connect {
        protocol_name: "MQTT".into(),
        protocol_level: 3,
        clean_session: true,
        keep_alive: 0,
        client_id: "old".into(),
        last_will: None,
        login: None,
    }))
    .await;

    assert_eq!(
        peer.recv().await,
        Some(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::RefusedProtocolVersion,
        }))
    );
}

#[tokio::test]
async fn engine_close_drains_all_connections() {
    let engine = engine();

    let (_client, mut messages) = connect(&engine, ConnectOptions::new("lingering")).await;

    engine.close().await;

    // The client observes the shutdown as a closed stream.
    assert!(messages.recv().await.is_none());
}
