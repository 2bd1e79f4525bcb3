#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

use magpie_client::packet::{
    self, ConnectAck, ConnectReturnCode, Packet, PacketId, PublishRelease, QoS, SubscribeAck,
    SubscribeReturnCode, UnsubscribeAck, WriteTo,
};

/// One accepted client connection, driven synchronously by a test script.
pub struct BrokerConn {
    stream: TcpStream,
    buf: Vec<u8>,
}

/// Owned view of a received CONNECT.
#[derive(Debug)]
pub struct ConnectInfo {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub will: Option<(String, Vec<u8>, QoS, bool)>,
    pub username: Option<String>,
}

/// Owned view of a received PUBLISH.
#[derive(Debug)]
pub struct PublishInfo {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<PacketId>,
    pub payload: Vec<u8>,
}

/// Binds a loopback listener and runs `script` against the first connection
/// on its own thread. Returns the `tcp://` URI to hand to the client and the
/// script thread handle, which tests join to surface script assertions.
pub fn broker<F>(script: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(BrokerConn) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept client");
        stream.set_nodelay(true).expect("set nodelay");
        script(BrokerConn {
            stream,
            buf: Vec::new(),
        });
    });

    (format!("tcp://{}", addr), handle)
}

impl BrokerConn {
    /// Blocks until one whole packet frame is buffered and returns its bytes.
    pub fn read_frame(&mut self) -> Vec<u8> {
        loop {
            if let Ok(Some(total)) = packet::frame_length(&self.buf) {
                if self.buf.len() >= total {
                    return self.buf.drain(..total).collect();
                }
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).expect("read from client");
            assert!(n > 0, "client closed the connection mid-script");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn send(&mut self, packet: Packet) {
        let mut buf = Vec::with_capacity(packet.size());
        packet.write_to(&mut buf);
        self.stream.write_all(&buf).expect("write to client");
    }

    pub fn expect_connect(&mut self) -> ConnectInfo {
        let frame = self.read_frame();
        match packet::parse(&frame).expect("parse CONNECT").1 {
            Packet::Connect(connect) => ConnectInfo {
                client_id: connect.client_id.to_string(),
                clean_session: connect.clean_session,
                keep_alive: connect.keep_alive,
                will: connect.last_will.map(|will| {
                    (
                        will.topic_name.to_string(),
                        will.message.to_vec(),
                        will.qos,
                        will.retain,
                    )
                }),
                username: connect.username.map(str::to_string),
            },
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }

    /// Reads CONNECT and accepts it.
    pub fn accept(&mut self) -> ConnectInfo {
        self.accept_with(false)
    }

    pub fn accept_with(&mut self, session_present: bool) -> ConnectInfo {
        let info = self.expect_connect();
        self.send(Packet::ConnectAck(ConnectAck {
            session_present,
            return_code: ConnectReturnCode::ConnectionAccepted,
        }));
        info
    }

    pub fn refuse(&mut self, return_code: ConnectReturnCode) {
        self.expect_connect();
        self.send(Packet::ConnectAck(ConnectAck {
            session_present: false,
            return_code,
        }));
    }

    pub fn expect_subscribe(&mut self) -> (PacketId, Vec<(String, QoS)>) {
        let frame = self.read_frame();
        match packet::parse(&frame).expect("parse SUBSCRIBE").1 {
            Packet::Subscribe(subscribe) => (
                subscribe.packet_id,
                subscribe
                    .subscriptions
                    .iter()
                    .map(|(topic, qos)| (topic.to_string(), *qos))
                    .collect(),
            ),
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }
    }

    /// Reads SUBSCRIBE and grants every filter at its requested QoS.
    pub fn grant_subscribe(&mut self) -> Vec<(String, QoS)> {
        let (packet_id, subscriptions) = self.expect_subscribe();
        self.send(Packet::SubscribeAck(SubscribeAck {
            packet_id,
            status: subscriptions
                .iter()
                .map(|(_, qos)| SubscribeReturnCode::Success(*qos))
                .collect(),
        }));
        subscriptions
    }

    pub fn expect_unsubscribe(&mut self) -> (PacketId, Vec<String>) {
        let frame = self.read_frame();
        match packet::parse(&frame).expect("parse UNSUBSCRIBE").1 {
            Packet::Unsubscribe(unsubscribe) => (
                unsubscribe.packet_id,
                unsubscribe
                    .topic_filters
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
            other => panic!("expected UNSUBSCRIBE, got {:?}", other),
        }
    }

    pub fn ack_unsubscribe(&mut self) -> Vec<String> {
        let (packet_id, filters) = self.expect_unsubscribe();
        self.send(Packet::UnsubscribeAck(UnsubscribeAck { packet_id }));
        filters
    }

    pub fn expect_publish(&mut self) -> PublishInfo {
        let frame = self.read_frame();
        match packet::parse(&frame).expect("parse PUBLISH").1 {
            Packet::Publish(publish) => PublishInfo {
                dup: publish.dup,
                qos: publish.qos,
                retain: publish.retain,
                topic: publish.topic_name.to_string(),
                packet_id: publish.packet_id,
                payload: publish.payload.to_vec(),
            },
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    pub fn expect_puback(&mut self) -> PacketId {
        let frame = self.read_frame();
        match packet::parse(&frame).expect("parse PUBACK").1 {
            Packet::PublishAck(ack) => ack.packet_id,
            other => panic!("expected PUBACK, got {:?}", other),
        }
    }

    pub fn expect_pubrec(&mut self) -> PacketId {
        let frame = self.read_frame();
        match packet::parse(&frame).expect("parse PUBREC").1 {
            Packet::PublishReceived(ack) => ack.packet_id,
            other => panic!("expected PUBREC, got {:?}", other),
        }
    }

    pub fn expect_pubrel(&mut self) -> PacketId {
        let frame = self.read_frame();
        match packet::parse(&frame).expect("parse PUBREL").1 {
            Packet::PublishRelease(PublishRelease { packet_id }) => packet_id,
            other => panic!("expected PUBREL, got {:?}", other),
        }
    }

    pub fn expect_pubcomp(&mut self) -> PacketId {
        let frame = self.read_frame();
        match packet::parse(&frame).expect("parse PUBCOMP").1 {
            Packet::PublishComplete(ack) => ack.packet_id,
            other => panic!("expected PUBCOMP, got {:?}", other),
        }
    }

    pub fn expect_disconnect(&mut self) {
        let frame = self.read_frame();
        match packet::parse(&frame).expect("parse DISCONNECT").1 {
            Packet::Disconnect => {}
            other => panic!("expected DISCONNECT, got {:?}", other),
        }
    }
}
