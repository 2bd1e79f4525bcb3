mod common;

use std::thread;
use std::time::Duration;

use magpie_client::packet::{
    ConnectReturnCode, Packet, Publish, PublishAck, PublishComplete, PublishReceived,
    PublishRelease, QoS,
};
use magpie_client::{
    Client, ConnectOptions, Context, Error, MemoryPersistence, Persistence, Will,
};

use common::broker;

const TICK: Duration = Duration::from_millis(200);
const WAIT: Duration = Duration::from_secs(5);

fn new_client(uri: &str, id: &str, store: MemoryPersistence) -> (Context, Client) {
    let ctx = Context::new().expect("create context");
    let client = Client::create(&ctx, uri, id, Box::new(store)).expect("create client");
    (ctx, client)
}

#[test]
fn connect_and_disconnect() {
    let (uri, script) = broker(|mut conn| {
        let info = conn.accept();
        assert_eq!(info.client_id, "tester");
        assert!(info.clean_session);
        assert_eq!(info.keep_alive, 60);
        conn.expect_disconnect();
    });

    let (_ctx, client) = new_client(&uri, "tester", MemoryPersistence::new());
    assert!(!client.is_connected());

    client.connect(ConnectOptions::new()).unwrap();
    assert!(client.is_connected());
    assert!(!client.session_present());

    client.disconnect(TICK).unwrap();
    assert!(!client.is_connected());
    client.destroy().unwrap();

    script.join().unwrap();
}

#[test]
fn connect_carries_will_and_credentials() {
    let (uri, script) = broker(|mut conn| {
        let info = conn.accept();
        let (topic, payload, qos, retained) = info.will.expect("will expected");
        assert_eq!(topic, "W");
        assert_eq!(payload, b"bye");
        assert_eq!(qos, QoS::AtLeastOnce);
        assert!(!retained);
        assert_eq!(info.username.as_deref(), Some("user"));
        conn.expect_disconnect();
    });

    let (_ctx, client) = new_client(&uri, "willful", MemoryPersistence::new());
    client
        .connect(
            ConnectOptions::new()
                .with_credentials("user", Some(b"pass"))
                .with_last_will(Will::new("W", &b"bye"[..]).with_qos(QoS::AtLeastOnce)),
        )
        .unwrap();

    client.disconnect(TICK).unwrap();
    client.destroy().unwrap();
    script.join().unwrap();
}

#[test]
fn connect_refused_surfaces_return_code() {
    let (uri, script) = broker(|mut conn| {
        conn.refuse(ConnectReturnCode::NotAuthorized);
    });

    let (_ctx, client) = new_client(&uri, "denied", MemoryPersistence::new());
    match client.connect(ConnectOptions::new()) {
        Err(Error::ConnectionRefused(code)) => {
            assert_eq!(code, ConnectReturnCode::NotAuthorized)
        }
        other => panic!("expected refusal, got {:?}", other),
    }
    assert!(!client.is_connected());

    client.destroy().unwrap();
    script.join().unwrap();
}

#[test]
fn subscribe_and_receive() {
    let (uri, script) = broker(|mut conn| {
        conn.accept();
        let subscriptions = conn.grant_subscribe();
        assert_eq!(subscriptions, vec![("greeting".to_string(), QoS::ExactlyOnce)]);

        conn.send(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic_name: "greeting",
            packet_id: None,
            payload: b"hello",
        }));

        conn.ack_unsubscribe();
        conn.expect_disconnect();
    });

    let (_ctx, client) = new_client(&uri, "subscriber", MemoryPersistence::new());
    client.connect(ConnectOptions::new()).unwrap();

    let granted = client.subscribe("greeting", QoS::ExactlyOnce).unwrap();
    assert_eq!(granted, QoS::ExactlyOnce);

    let message = client.receive(WAIT).unwrap().expect("a message");
    assert_eq!(message.topic, "greeting");
    assert_eq!(&message.payload[..], b"hello");
    assert_eq!(message.qos, QoS::AtMostOnce);
    assert!(!message.retained);

    // nothing else queued: a zero timeout still runs one loop pass
    assert!(client.receive(Duration::from_millis(0)).unwrap().is_none());

    client.unsubscribe("greeting").unwrap();
    client.disconnect(TICK).unwrap();
    client.destroy().unwrap();
    script.join().unwrap();
}

#[test]
fn qos1_publish_completes_and_clears_persistence() {
    let store = MemoryPersistence::new();
    let (uri, script) = broker(|mut conn| {
        conn.accept();
        let publish = conn.expect_publish();
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(publish.topic, "T");
        assert_eq!(publish.payload, b"qos 1");
        conn.send(Packet::PublishAck(PublishAck {
            packet_id: publish.packet_id.unwrap(),
        }));
        conn.expect_disconnect();
    });

    let (_ctx, client) = new_client(&uri, "publisher", store.clone());
    client.connect(ConnectOptions::new()).unwrap();

    let token = client
        .publish("T", b"qos 1", QoS::AtLeastOnce, false)
        .unwrap()
        .expect("a delivery token");
    assert!(store.contains_key(&format!("s-{}", token)));

    client.wait_for_completion(token, WAIT).unwrap();
    assert!(client.pending_delivery_tokens().unwrap().is_empty());
    assert!(store.keys().unwrap().is_empty());

    client.disconnect(TICK).unwrap();
    client.destroy().unwrap();
    script.join().unwrap();
}

#[test]
fn qos2_publish_runs_the_full_handshake() {
    let store = MemoryPersistence::new();
    let (uri, script) = broker(|mut conn| {
        conn.accept();
        let publish = conn.expect_publish();
        assert_eq!(publish.qos, QoS::ExactlyOnce);
        let packet_id = publish.packet_id.unwrap();

        conn.send(Packet::PublishReceived(PublishReceived { packet_id }));
        assert_eq!(conn.expect_pubrel(), packet_id);
        conn.send(Packet::PublishComplete(PublishComplete { packet_id }));
        conn.expect_disconnect();
    });

    let (_ctx, client) = new_client(&uri, "publisher2", store.clone());
    client.connect(ConnectOptions::new()).unwrap();

    let token = client
        .publish("T", b"qos 2", QoS::ExactlyOnce, false)
        .unwrap()
        .expect("a delivery token");

    client.wait_for_completion(token, WAIT).unwrap();
    assert!(client.pending_delivery_tokens().unwrap().is_empty());
    assert!(store.keys().unwrap().is_empty(), "s- and sc- records erased");

    client.disconnect(TICK).unwrap();
    client.destroy().unwrap();
    script.join().unwrap();
}

#[test]
fn inbound_qos2_is_delivered_exactly_once() {
    let (uri, script) = broker(|mut conn| {
        conn.accept();
        conn.grant_subscribe();

        let publish = Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic_name: "T",
            packet_id: Some(7),
            payload: b"once",
        };
        conn.send(Packet::Publish(publish.clone()));
        assert_eq!(conn.expect_pubrec(), 7);

        // retransmit before releasing; the client must not deliver it twice
        conn.send(Packet::Publish(Publish {
            dup: true,
            ..publish
        }));
        assert_eq!(conn.expect_pubrec(), 7);

        conn.send(Packet::PublishRelease(PublishRelease { packet_id: 7 }));
        assert_eq!(conn.expect_pubcomp(), 7);
        conn.expect_disconnect();
    });

    let (_ctx, client) = new_client(&uri, "exactly-once", MemoryPersistence::new());
    client.connect(ConnectOptions::new()).unwrap();
    client.subscribe("T", QoS::ExactlyOnce).unwrap();

    let message = client.receive(WAIT).unwrap().expect("the publish");
    assert_eq!(&message.payload[..], b"once");
    assert!(!message.dup, "QoS 2 deliveries never carry the dup flag");

    // the retransmission and release get processed during this wait
    assert!(client.receive(Duration::from_millis(500)).unwrap().is_none());

    client.disconnect(TICK).unwrap();
    client.destroy().unwrap();
    script.join().unwrap();
}

#[test]
fn pending_tokens_survive_destroy_and_recreate() {
    let store = MemoryPersistence::new();

    let (uri1, script1) = broker(|mut conn| {
        let info = conn.accept();
        assert!(!info.clean_session);
        let publish = conn.expect_publish();
        assert_eq!(publish.payload, b"Message sequence no 0");
        // no acknowledgment: the message stays in flight
        conn.expect_disconnect();
    });

    let (_ctx1, client1) = new_client(&uri1, "durable", store.clone());
    client1
        .connect(ConnectOptions::new().without_clean_session())
        .unwrap();
    let token = client1
        .publish("T", b"Message sequence no 0", QoS::AtLeastOnce, false)
        .unwrap()
        .expect("a delivery token");
    assert_eq!(client1.pending_delivery_tokens().unwrap(), vec![token]);

    client1.destroy().unwrap();
    script1.join().unwrap();

    // a new incarnation sees the token before it even connects
    let (uri2, script2) = broker(move |mut conn| {
        conn.accept_with(true);
        let publish = conn.expect_publish();
        assert!(publish.dup, "restored publish goes out as a duplicate");
        assert_eq!(publish.payload, b"Message sequence no 0");
        conn.send(Packet::PublishAck(PublishAck {
            packet_id: publish.packet_id.unwrap(),
        }));
        conn.expect_disconnect();
    });

    let (_ctx2, client2) = new_client(&uri2, "durable", store.clone());
    assert_eq!(client2.pending_delivery_tokens().unwrap(), vec![token]);

    client2
        .connect(ConnectOptions::new().without_clean_session())
        .unwrap();
    client2.wait_for_completion(token, WAIT).unwrap();
    assert!(client2.pending_delivery_tokens().unwrap().is_empty());
    assert!(store.keys().unwrap().is_empty());

    client2.disconnect(TICK).unwrap();
    client2.destroy().unwrap();
    script2.join().unwrap();
}

#[test]
fn clean_session_connect_erases_restored_state() {
    let store = MemoryPersistence::new();
    {
        let mut seed = store.clone();
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic_name: "T",
            packet_id: Some(3),
            payload: b"stale",
        });
        let mut buf = Vec::new();
        use magpie_client::packet::WriteTo;
        publish.write_to(&mut buf);
        seed.put("s-3", &[&buf[..]]).unwrap();
    }

    let (uri, script) = broker(|mut conn| {
        let info = conn.accept();
        assert!(info.clean_session);
        conn.expect_disconnect();
    });

    let (_ctx, client) = new_client(&uri, "fresh", store.clone());
    assert_eq!(client.pending_delivery_tokens().unwrap(), vec![3]);

    client.connect(ConnectOptions::new()).unwrap();
    assert!(client.pending_delivery_tokens().unwrap().is_empty());
    assert!(store.keys().unwrap().is_empty(), "persistence emptied at CONNACK");

    client.disconnect(TICK).unwrap();
    client.destroy().unwrap();
    script.join().unwrap();
}

#[test]
fn full_window_rejects_try_publish_and_blocks_publish() {
    let (uri, script) = broker(|mut conn| {
        conn.accept();
        let first = conn.expect_publish();
        // hold the ack back long enough for try_publish to see a full window
        thread::sleep(Duration::from_millis(300));
        conn.send(Packet::PublishAck(PublishAck {
            packet_id: first.packet_id.unwrap(),
        }));

        let second = conn.expect_publish();
        conn.send(Packet::PublishAck(PublishAck {
            packet_id: second.packet_id.unwrap(),
        }));
        conn.expect_disconnect();
    });

    let (_ctx, client) = new_client(&uri, "windowed", MemoryPersistence::new());
    client
        .connect(ConnectOptions::new().reliable())
        .unwrap();

    let first = client
        .publish("T", b"first", QoS::AtLeastOnce, false)
        .unwrap()
        .unwrap();

    match client.try_publish("T", b"second", QoS::AtLeastOnce, false) {
        Err(Error::MaxMessagesInflight) => {}
        other => panic!("expected window-full rejection, got {:?}", other),
    }

    // the blocking form waits for the first ack, then goes through
    let second = client
        .publish("T", b"second", QoS::AtLeastOnce, false)
        .unwrap()
        .unwrap();
    assert_ne!(first, second);

    client.wait_for_completion(second, WAIT).unwrap();
    client.disconnect(TICK).unwrap();
    client.destroy().unwrap();
    script.join().unwrap();
}

#[test]
fn large_payload_round_trip() {
    let payload: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
    let echo = payload.clone();

    let (uri, script) = broker(move |mut conn| {
        conn.accept();
        conn.grant_subscribe();

        let publish = conn.expect_publish();
        assert_eq!(publish.qos, QoS::ExactlyOnce);
        assert_eq!(publish.payload, echo);
        let packet_id = publish.packet_id.unwrap();
        conn.send(Packet::PublishReceived(PublishReceived { packet_id }));
        assert_eq!(conn.expect_pubrel(), packet_id);
        conn.send(Packet::PublishComplete(PublishComplete { packet_id }));

        // echo it back on the subscription
        conn.send(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic_name: "big",
            packet_id: None,
            payload: &echo,
        }));
        conn.expect_disconnect();
    });

    let (_ctx, client) = new_client(&uri, "bulk", MemoryPersistence::new());
    client.connect(ConnectOptions::new()).unwrap();
    client.subscribe("big", QoS::ExactlyOnce).unwrap();

    let token = client
        .publish("big", &payload, QoS::ExactlyOnce, false)
        .unwrap()
        .unwrap();
    client.wait_for_completion(token, WAIT).unwrap();

    let message = client.receive(WAIT).unwrap().expect("the echo");
    assert_eq!(&message.payload[..], &payload[..]);

    client.disconnect(TICK).unwrap();
    client.destroy().unwrap();
    script.join().unwrap();
}

#[test]
fn topic_with_embedded_nul_survives_delivery() {
    let (uri, script) = broker(|mut conn| {
        conn.accept();
        conn.grant_subscribe();
        conn.send(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic_name: "odd\u{0}topic",
            packet_id: None,
            payload: b"x",
        }));
        conn.expect_disconnect();
    });

    let (_ctx, client) = new_client(&uri, "nul", MemoryPersistence::new());
    client.connect(ConnectOptions::new()).unwrap();
    client.subscribe("#", QoS::AtMostOnce).unwrap();

    let message = client.receive(WAIT).unwrap().expect("a message");
    assert_eq!(message.topic, "odd\u{0}topic");
    assert_eq!(message.topic.len(), 9);

    client.disconnect(TICK).unwrap();
    client.destroy().unwrap();
    script.join().unwrap();
}

#[test]
fn publish_rejects_wildcard_topics() {
    let (uri, script) = broker(|mut conn| {
        conn.accept();
        conn.expect_disconnect();
    });

    let (_ctx, client) = new_client(&uri, "strict", MemoryPersistence::new());
    client.connect(ConnectOptions::new()).unwrap();

    assert!(matches!(
        client.publish("a/+", b"x", QoS::AtMostOnce, false),
        Err(Error::BadUtf8String)
    ));
    assert!(matches!(
        client.publish("a/#", b"x", QoS::AtMostOnce, false),
        Err(Error::BadUtf8String)
    ));
    assert!(matches!(
        client.publish("", b"x", QoS::AtMostOnce, false),
        Err(Error::NullParameter(_))
    ));

    client.disconnect(TICK).unwrap();
    client.destroy().unwrap();
    script.join().unwrap();
}

#[test]
fn destroy_during_connect_leaves_the_handle_unusable() {
    let (uri, script) = broker(|mut conn| {
        // swallow the CONNECT and go silent so the caller stays blocked
        conn.expect_connect();
        thread::sleep(Duration::from_millis(600));
    });

    let (_ctx, client) = new_client(&uri, "doomed", MemoryPersistence::new());

    let other = client.clone();
    let destroyer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        other.destroy().unwrap();
    });

    let result = client.connect(
        ConnectOptions::new().with_connect_timeout(Duration::from_secs(5)),
    );
    assert!(result.is_err(), "connect must fail once the handle is gone");

    destroyer.join().unwrap();
    assert!(matches!(
        client.publish("T", b"x", QoS::AtMostOnce, false),
        Err(Error::Destroyed)
    ));
    assert!(!client.is_connected());

    script.join().unwrap();
}
