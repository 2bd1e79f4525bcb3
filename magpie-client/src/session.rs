use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use hexplay::HexViewBuilder;
use mio::net::TcpStream;

use crate::inflight::{Expected, Inflight, InflightTable, ReceivedQueue, MAX_MSG_ID};
use crate::message::{Message, Publication};
use crate::options::ConnectOptions;
use crate::packet::{
    self, Connect, ConnectAck, ConnectReturnCode, LastWill, Packet, PacketId, Publish, PublishAck,
    PublishComplete, PublishReceived, PublishRelease, QoS, SubscribeAck, UnsubscribeAck, WriteTo,
};
use crate::persist::{self, Kind, Persistence};
use crate::{Error, Result};

const READ_CHUNK: usize = 4 * 1024;

/// Where the connection handshake currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectState {
    Idle,
    TcpInProgress,
    AwaitingConnack,
    Connected,
    Disconnecting,
}

/// What a received packet meant to the caller driving the loop.
#[derive(Debug)]
pub(crate) enum Incoming {
    /// Handled entirely inside the session.
    None,
    /// An outbound publish finished its handshake and left the session.
    Completed(PacketId),
    /// Stored into the awaited-reply slot by the event loop.
    ConnectAck(ConnectAck),
    SubscribeAck(SubscribeAck),
    UnsubscribeAck(UnsubscribeAck),
}

/// Per-connection protocol state: the socket, the in-flight tables and the
/// counters that drive keep-alive, retry and packet-id assignment.
pub(crate) struct Session {
    pub client_id: String,
    pub server_uri: String,
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    pub connect_state: ConnectState,
    pub connected: bool,
    /// Cleared on the first socket error.
    pub good: bool,
    pub ping_outstanding: bool,
    pub clean_session: bool,
    pub session_present: bool,
    pub max_inflight: usize,
    pub last_contact: Instant,
    last_msg_id: PacketId,
    options: ConnectOptions,
    pub outbound: InflightTable,
    pub inbound: InflightTable,
    pub queue: ReceivedQueue,
    store: Box<dyn Persistence>,
}

impl Session {
    pub fn new(client_id: &str, server_uri: &str, store: Box<dyn Persistence>) -> Self {
        let options = ConnectOptions::default();

        Session {
            client_id: client_id.to_string(),
            server_uri: server_uri.to_string(),
            stream: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            connect_state: ConnectState::Idle,
            connected: false,
            good: false,
            ping_outstanding: false,
            clean_session: options.clean_session,
            session_present: false,
            max_inflight: options.max_inflight(),
            last_contact: Instant::now(),
            last_msg_id: 0,
            options,
            outbound: InflightTable::new(),
            inbound: InflightTable::new(),
            queue: ReceivedQueue::new(),
            store,
        }
    }

    pub fn configure(&mut self, options: ConnectOptions) {
        self.clean_session = options.clean_session;
        self.max_inflight = options.max_inflight();
        self.options = options;
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub fn take_stream(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }

    /// Bytes are buffered for the socket but not yet written.
    pub fn wants_write(&self) -> bool {
        !self.write_buf.is_empty() || self.connect_state == ConnectState::TcpInProgress
    }

    /// Starts the non-blocking TCP connect; completion is observed as a
    /// writable readiness event.
    pub fn open_transport(&mut self) -> Result<()> {
        let addr = self
            .server_uri
            .as_str()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "server URI resolved to no address",
                ))
            })?;

        debug!("client {} connecting to {}", self.client_id, addr);
        let stream = TcpStream::connect(&addr)?;
        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);
        self.connect_state = ConnectState::TcpInProgress;
        self.good = true;
        self.ping_outstanding = false;
        self.read_buf.clear();
        self.write_buf.clear();
        Ok(())
    }

    /// Reads the deferred connect result once the socket reports writable.
    pub fn finish_tcp_connect(&mut self) -> io::Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        match stream.take_error()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn send_connect(&mut self) -> Result<()> {
        let buf = {
            let packet = Packet::Connect(Connect {
                protocol_version: self.options.protocol_version,
                clean_session: self.options.clean_session,
                keep_alive: self.options.keep_alive.as_secs() as u16,
                client_id: &self.client_id,
                last_will: self.options.will.as_ref().map(|will| LastWill {
                    qos: will.qos,
                    retain: will.retained,
                    topic_name: &will.topic,
                    message: &will.payload,
                }),
                username: self.options.username.as_deref(),
                password: self.options.password.as_deref(),
            });
            let mut buf = Vec::with_capacity(packet.size());
            packet.write_to(&mut buf);
            trace!(
                "send {:#?} packet, {} bytes:\n{}",
                packet,
                buf.len(),
                HexViewBuilder::new(&buf).finish()
            );
            buf
        };

        self.send_raw(&buf)
    }

    pub(crate) fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut buf = Vec::with_capacity(packet.size());
        packet.write_to(&mut buf);
        trace!(
            "send {:#?} packet, {} bytes:\n{}",
            packet,
            buf.len(),
            HexViewBuilder::new(&buf).finish()
        );
        self.send_raw(&buf)
    }

    fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_buf.extend_from_slice(bytes);
        self.try_flush().map(|_| ())
    }

    /// Drains the pending-write buffer as far as the socket allows.
    ///
    /// `Ok(false)` means bytes remain and the caller should keep writable
    /// readiness registered.
    pub fn try_flush(&mut self) -> Result<bool> {
        while !self.write_buf.is_empty() {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return Ok(false),
            };

            match stream.write(&self.write_buf) {
                Ok(0) => {
                    self.good = false;
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Ok(n) => self.write_buf.advance(n),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.good = false;
                    return Err(err.into());
                }
            }
        }

        Ok(true)
    }

    /// Pulls whatever the socket has; `Ok(false)` when it would block.
    fn fill_read(&mut self) -> Result<bool> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(false),
        };

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.good = false;
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.good = false;
                    return Err(err.into());
                }
            }
        }
    }

    /// Splits one complete packet frame off the read buffer.
    fn next_frame(&mut self) -> Result<Option<Bytes>> {
        match packet::frame_length(&self.read_buf) {
            Ok(Some(total)) if self.read_buf.len() >= total => {
                Ok(Some(self.read_buf.split_to(total).freeze()))
            }
            Ok(_) => Ok(None),
            Err(_) => Err(Error::Protocol("malformed remaining length")),
        }
    }

    /// Reads and dispatches one packet; `Ok(None)` when no complete packet is
    /// buffered and the socket has nothing more to give.
    pub fn poll_packet(&mut self) -> Result<Option<Incoming>> {
        loop {
            if let Some(frame) = self.next_frame()? {
                return self.dispatch(frame).map(Some);
            }
            if !self.fill_read()? {
                return Ok(None);
            }
        }
    }

    fn dispatch(&mut self, frame: Bytes) -> Result<Incoming> {
        let (_, packet) =
            packet::parse(&frame).map_err(|_| Error::Protocol("malformed packet"))?;
        trace!(
            "received {:#?} packet, {} bytes:\n{}",
            packet,
            frame.len(),
            HexViewBuilder::new(&frame).finish()
        );

        self.last_contact = Instant::now();

        match packet {
            Packet::Publish(publish) => {
                self.on_publish(&publish, &frame)?;
                Ok(Incoming::None)
            }
            Packet::PublishAck(PublishAck { packet_id }) => self.on_publish_ack(packet_id),
            Packet::PublishReceived(PublishReceived { packet_id }) => {
                self.on_publish_received(packet_id)?;
                Ok(Incoming::None)
            }
            Packet::PublishRelease(PublishRelease { packet_id }) => {
                self.on_publish_release(packet_id)?;
                Ok(Incoming::None)
            }
            Packet::PublishComplete(PublishComplete { packet_id }) => {
                self.on_publish_complete(packet_id)
            }
            Packet::Pong => {
                trace!("client {} received ping response", self.client_id);
                self.ping_outstanding = false;
                Ok(Incoming::None)
            }
            Packet::ConnectAck(ack) => {
                if self.connect_state == ConnectState::AwaitingConnack {
                    self.on_connect_ack(&ack)?;
                }
                Ok(Incoming::ConnectAck(ack))
            }
            Packet::SubscribeAck(ack) => Ok(Incoming::SubscribeAck(ack)),
            Packet::UnsubscribeAck(ack) => Ok(Incoming::UnsubscribeAck(ack)),
            _ => Err(Error::Protocol("unexpected packet from broker")),
        }
    }

    /// Completes the handshake on an accepted CONNACK: the session becomes
    /// connected here, in the state machine, so a connection loss in the same
    /// event-loop pass is already seen as the loss of an established session.
    fn on_connect_ack(&mut self, ack: &ConnectAck) -> Result<()> {
        if ack.return_code != ConnectReturnCode::ConnectionAccepted {
            // the waiter surfaces the refusal and tears the transport down
            return Ok(());
        }

        self.connected = true;
        self.good = true;
        self.connect_state = ConnectState::Connected;
        self.session_present = ack.session_present;
        self.last_contact = Instant::now();
        info!(
            "client {} session {}",
            self.client_id,
            if ack.session_present { "resumed" } else { "created" }
        );

        if self.clean_session {
            self.clean_session_reset()?;
        } else {
            // whatever the previous incarnation left in flight goes out again
            // right away
            self.reset_retry();
            self.retry(Instant::now())?;
        }

        Ok(())
    }

    fn queue_message(&mut self, publish: &Publish) {
        self.queue.push_back(Message {
            topic: publish.topic_name.to_string(),
            payload: Bytes::copy_from_slice(publish.payload),
            qos: publish.qos,
            retained: publish.retain,
            // a QoS 2 message must never reach the application flagged dup
            dup: publish.qos != QoS::ExactlyOnce && publish.dup,
            packet_id: publish.packet_id,
        });
    }

    fn on_publish(&mut self, publish: &Publish, raw: &[u8]) -> Result<()> {
        match publish.qos {
            QoS::AtMostOnce => {
                self.queue_message(publish);
                Ok(())
            }
            QoS::AtLeastOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(Error::Protocol("QoS 1 PUBLISH without packet id"))?;
                self.queue_message(publish);
                self.send_packet(&Packet::PublishAck(PublishAck { packet_id }))
            }
            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(Error::Protocol("QoS 2 PUBLISH without packet id"))?;

                if self.inbound.contains(packet_id) {
                    // retransmission of a publish we already own: acknowledge
                    // again, deliver nothing
                    debug!("client {} ignoring duplicate publish {}", self.client_id, packet_id);
                    return self
                        .send_packet(&Packet::PublishReceived(PublishReceived { packet_id }));
                }

                self.store
                    .put(&persist::received_key(packet_id), &[raw])?;
                self.inbound.push_back(Inflight {
                    packet_id,
                    qos: publish.qos,
                    retain: publish.retain,
                    publication: Arc::new(Publication::new(publish.topic_name, publish.payload)),
                    last_touch: Some(Instant::now()),
                    next: Expected::PubRel,
                    len: raw.len(),
                });
                self.queue_message(publish);
                self.send_packet(&Packet::PublishReceived(PublishReceived { packet_id }))
            }
        }
    }

    fn on_publish_ack(&mut self, packet_id: PacketId) -> Result<Incoming> {
        if self.outbound.remove(packet_id).is_some() {
            debug!("client {} message {} acknowledged", self.client_id, packet_id);
            if let Err(err) = self.store.remove(&persist::sent_key(packet_id)) {
                warn!("fail to remove persisted publish {}: {}", packet_id, err);
            }
            Ok(Incoming::Completed(packet_id))
        } else {
            warn!("unexpected PUBACK id {}", packet_id);
            Ok(Incoming::None)
        }
    }

    fn on_publish_received(&mut self, packet_id: PacketId) -> Result<()> {
        let known = match self.outbound.find_mut(packet_id) {
            Some(msg) => {
                msg.next = Expected::PubComp;
                msg.last_touch = Some(Instant::now());
                true
            }
            None => false,
        };

        if !known {
            warn!("unexpected PUBREC id {}", packet_id);
            return Ok(());
        }

        let pubrel = Packet::PublishRelease(PublishRelease { packet_id });
        let mut buf = Vec::with_capacity(pubrel.size());
        pubrel.write_to(&mut buf);
        self.store.put(&persist::pubrel_key(packet_id), &[&buf])?;
        self.send_raw(&buf)
    }

    fn on_publish_release(&mut self, packet_id: PacketId) -> Result<()> {
        if self.inbound.remove(packet_id).is_some() {
            if let Err(err) = self.store.remove(&persist::received_key(packet_id)) {
                warn!("fail to remove persisted inbound publish {}: {}", packet_id, err);
            }
        } else {
            warn!("unexpected PUBREL id {}", packet_id);
        }

        // a PUBCOMP is owed even for an unknown id
        self.send_packet(&Packet::PublishComplete(PublishComplete { packet_id }))
    }

    fn on_publish_complete(&mut self, packet_id: PacketId) -> Result<Incoming> {
        if self.outbound.remove(packet_id).is_some() {
            debug!("client {} message {} completed", self.client_id, packet_id);
            if let Err(err) = self.store.remove(&persist::sent_key(packet_id)) {
                warn!("fail to remove persisted publish {}: {}", packet_id, err);
            }
            if let Err(err) = self.store.remove(&persist::pubrel_key(packet_id)) {
                warn!("fail to remove persisted PUBREL {}: {}", packet_id, err);
            }
            Ok(Incoming::Completed(packet_id))
        } else {
            warn!("unexpected PUBCOMP id {}", packet_id);
            Ok(Incoming::None)
        }
    }

    /// Next free packet identifier, wrapping within 1..=65535 and skipping
    /// ids still in flight in either direction.
    pub fn next_packet_id(&mut self) -> Result<PacketId> {
        for _ in 0..MAX_MSG_ID {
            self.last_msg_id = if self.last_msg_id == MAX_MSG_ID {
                1
            } else {
                self.last_msg_id + 1
            };

            if !self.outbound.contains(self.last_msg_id) && !self.inbound.contains(self.last_msg_id)
            {
                return Ok(self.last_msg_id);
            }
        }

        Err(Error::NoMoreMessageIds)
    }

    /// Sends a publish and, for QoS 1 and 2, makes it durable before the
    /// socket write so a connection drop cannot lose it.
    pub fn start_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retained: bool,
    ) -> Result<Option<PacketId>> {
        if qos == QoS::AtMostOnce {
            return self
                .send_packet(&Packet::Publish(Publish {
                    dup: false,
                    qos,
                    retain: retained,
                    topic_name: topic,
                    packet_id: None,
                    payload,
                }))
                .map(|_| None);
        }

        let packet_id = self.next_packet_id()?;
        let packet = Packet::Publish(Publish {
            dup: false,
            qos,
            retain: retained,
            topic_name: topic,
            packet_id: Some(packet_id),
            payload,
        });
        let mut buf = Vec::with_capacity(packet.size());
        packet.write_to(&mut buf);

        self.store.put(&persist::sent_key(packet_id), &[&buf])?;
        self.outbound.push_back(Inflight {
            packet_id,
            qos,
            retain: retained,
            publication: Arc::new(Publication::new(topic, payload)),
            last_touch: Some(Instant::now()),
            next: if qos == QoS::AtLeastOnce {
                Expected::PubAck
            } else {
                Expected::PubRec
            },
            len: buf.len(),
        });

        trace!(
            "send {:#?} packet, {} bytes:\n{}",
            packet,
            buf.len(),
            HexViewBuilder::new(&buf).finish()
        );
        if let Err(err) = self.send_raw(&buf) {
            // the message is persisted and in the outbound table, so it will
            // be resent after the next successful connect
            debug!("publish {} deferred by socket error: {}", packet_id, err);
        }

        Ok(Some(packet_id))
    }

    /// Keep-alive check: ping when quiet too long, fail when a ping went
    /// unanswered for a whole interval.
    pub fn keepalive(&mut self, now: Instant) -> Result<()> {
        let keep_alive = self.options.keep_alive;
        if !self.connected || keep_alive.as_secs() == 0 {
            return Ok(());
        }

        if now.duration_since(self.last_contact) >= keep_alive {
            if self.ping_outstanding {
                warn!("client {} missed ping response", self.client_id);
                return Err(Error::Timeout);
            }
            self.send_packet(&Packet::Ping)?;
            self.ping_outstanding = true;
        }

        Ok(())
    }

    /// Marks every outbound message for an immediate resend; used right after
    /// a session-resuming CONNACK.
    pub fn reset_retry(&mut self) {
        for msg in self.outbound.iter_mut() {
            msg.last_touch = None;
        }
    }

    /// Resends the unfinished leg of every overdue outbound handshake.
    pub fn retry(&mut self, now: Instant) -> Result<()> {
        if !self.connected {
            return Ok(());
        }

        let retry_interval = self.options.retry_interval;
        let mut due = Vec::new();
        for msg in self.outbound.iter_mut() {
            let overdue = msg
                .last_touch
                .map_or(true, |touch| now.duration_since(touch) >= retry_interval);
            if overdue {
                msg.last_touch = Some(now);
                due.push((msg.packet_id, msg.next, msg.qos, msg.retain, msg.publication.clone()));
            }
        }

        for (packet_id, next, qos, retain, publication) in due {
            match next {
                Expected::PubAck | Expected::PubRec => {
                    debug!("client {} retrying publish {}", self.client_id, packet_id);
                    self.send_packet(&Packet::Publish(Publish {
                        dup: true,
                        qos,
                        retain,
                        topic_name: &publication.topic,
                        packet_id: Some(packet_id),
                        payload: &publication.payload,
                    }))?;
                }
                Expected::PubComp => {
                    debug!("client {} retrying PUBREL {}", self.client_id, packet_id);
                    self.send_packet(&Packet::PublishRelease(PublishRelease { packet_id }))?;
                }
                Expected::PubRel => {}
            }
        }

        Ok(())
    }

    /// Discards all session state, as required when a clean session starts.
    pub fn clean_session_reset(&mut self) -> Result<()> {
        self.store.clear()?;
        self.outbound.clear();
        self.inbound.clear();
        self.queue.clear();
        self.last_msg_id = 0;
        Ok(())
    }

    /// Rebuilds the in-flight tables from the persistence store.
    ///
    /// Unreadable or malformed records are removed and skipped; orphaned
    /// PUBREL markers without their publish are dropped too.
    pub fn restore(&mut self) -> Result<()> {
        let keys = self.store.keys()?;
        for key in &keys {
            let (kind, packet_id) = match persist::classify(key) {
                Some(parts) => parts,
                None => continue,
            };

            match kind {
                Kind::SentPubrel => {
                    if !self.store.contains_key(&persist::sent_key(packet_id)) {
                        debug!("dropping orphaned PUBREL record {}", key);
                        let _ = self.store.remove(key);
                    }
                }
                Kind::Sent => {
                    let blob = match self.store.get(key) {
                        Ok(blob) => blob,
                        Err(err) => {
                            warn!("unreadable persisted record {}: {}", key, err);
                            let _ = self.store.remove(key);
                            continue;
                        }
                    };
                    match packet::restore(&blob) {
                        Ok(Packet::Publish(publish)) if publish.qos != QoS::AtMostOnce => {
                            let next = match publish.qos {
                                QoS::AtLeastOnce => Expected::PubAck,
                                _ if self.store.contains_key(&persist::pubrel_key(packet_id)) => {
                                    Expected::PubComp
                                }
                                _ => Expected::PubRec,
                            };
                            self.outbound.insert_in_order(Inflight {
                                packet_id,
                                qos: publish.qos,
                                retain: publish.retain,
                                publication: Arc::new(Publication::new(
                                    publish.topic_name,
                                    publish.payload,
                                )),
                                last_touch: None,
                                next,
                                len: blob.len(),
                            });
                        }
                        _ => {
                            warn!("bad persisted record {}", key);
                            let _ = self.store.remove(key);
                        }
                    }
                }
                Kind::Received => {
                    let blob = match self.store.get(key) {
                        Ok(blob) => blob,
                        Err(err) => {
                            warn!("unreadable persisted record {}: {}", key, err);
                            let _ = self.store.remove(key);
                            continue;
                        }
                    };
                    match packet::restore(&blob) {
                        Ok(Packet::Publish(publish)) if publish.qos == QoS::ExactlyOnce => {
                            self.inbound.insert_in_order(Inflight {
                                packet_id,
                                qos: publish.qos,
                                retain: publish.retain,
                                publication: Arc::new(Publication::new(
                                    publish.topic_name,
                                    publish.payload,
                                )),
                                last_touch: None,
                                next: Expected::PubRel,
                                len: blob.len(),
                            });
                        }
                        _ => {
                            warn!("bad persisted record {}", key);
                            let _ = self.store.remove(key);
                        }
                    }
                }
            }
        }

        self.outbound.rotate_for_wrap();

        if !self.outbound.is_empty() || !self.inbound.is_empty() {
            info!(
                "client {} restored {} outbound, {} inbound in-flight messages",
                self.client_id,
                self.outbound.len(),
                self.inbound.len()
            );
        }

        Ok(())
    }

    /// Tears the connection down and returns the socket for deregistration.
    ///
    /// With `send_disconnect`, a DISCONNECT packet goes out first on a
    /// best-effort basis. A clean session is erased here, so an immediate
    /// process exit cannot resurrect it.
    pub fn close(&mut self, send_disconnect: bool) -> Option<TcpStream> {
        if self.stream.is_some()
            && send_disconnect
            && (self.connected || self.connect_state != ConnectState::Idle)
        {
            let _ = self.send_packet(&Packet::Disconnect);
            let _ = self.try_flush();
        }

        self.connected = false;
        self.good = false;
        self.connect_state = ConnectState::Idle;
        self.ping_outstanding = false;
        self.read_buf.clear();
        self.write_buf.clear();

        if self.clean_session {
            if let Err(err) = self.clean_session_reset() {
                warn!("fail to clear clean session state: {}", err);
            }
        }

        self.stream.take()
    }

    pub fn close_store(&mut self) {
        if let Err(err) = self.store.close() {
            warn!("fail to close persistence store: {}", err);
        }
    }

    #[cfg(test)]
    pub fn pending_write(&self) -> &[u8] {
        &self.write_buf
    }

    #[cfg(test)]
    pub fn feed_read(&mut self, bytes: &[u8]) {
        self.read_buf.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use matches::assert_matches;

    use super::*;
    use crate::persist::MemoryPersistence;

    fn session_with_store(store: MemoryPersistence) -> Session {
        Session::new("tester", "127.0.0.1:1883", Box::new(store))
    }

    fn session() -> Session {
        session_with_store(MemoryPersistence::new())
    }

    fn wire(packet: &Packet) -> Vec<u8> {
        let mut buf = Vec::with_capacity(packet.size());
        packet.write_to(&mut buf);
        buf
    }

    #[test]
    fn test_packet_id_skips_inflight_ids() {
        let mut session = session();
        session.connected = true;

        assert_eq!(session.next_packet_id().unwrap(), 1);
        assert_eq!(session.next_packet_id().unwrap(), 2);

        // place 3 in the outbound table; the assigner has to skip it
        session.start_publish("t", b"x", QoS::AtLeastOnce, false).unwrap();
        assert_eq!(session.outbound.ids(), vec![3]);
        session.last_msg_id = 2;
        assert_eq!(session.next_packet_id().unwrap(), 4);
    }

    #[test]
    fn test_packet_id_wraps() {
        let mut session = session();
        session.last_msg_id = MAX_MSG_ID - 1;
        assert_eq!(session.next_packet_id().unwrap(), MAX_MSG_ID);
        assert_eq!(session.next_packet_id().unwrap(), 1);
    }

    #[test]
    fn test_qos1_publish_persists_and_completes() {
        let store = MemoryPersistence::new();
        let mut session = session_with_store(store.clone());
        session.connected = true;

        let token = session
            .start_publish("greeting", b"hello", QoS::AtLeastOnce, false)
            .unwrap()
            .unwrap();
        assert!(store.contains_key(&persist::sent_key(token)));
        assert_eq!(session.outbound.ids(), vec![token]);

        let incoming = session.on_publish_ack(token).unwrap();
        assert_matches!(incoming, Incoming::Completed(id) if id == token);
        assert!(session.outbound.is_empty());
        assert!(!store.contains_key(&persist::sent_key(token)));
    }

    #[test]
    fn test_qos2_publish_full_handshake() {
        let store = MemoryPersistence::new();
        let mut session = session_with_store(store.clone());
        session.connected = true;

        let token = session
            .start_publish("greeting", b"hello", QoS::ExactlyOnce, false)
            .unwrap()
            .unwrap();

        session.on_publish_received(token).unwrap();
        assert!(store.contains_key(&persist::pubrel_key(token)));
        assert_eq!(session.outbound.find_mut(token).unwrap().next, Expected::PubComp);

        let incoming = session.on_publish_complete(token).unwrap();
        assert_matches!(incoming, Incoming::Completed(id) if id == token);
        assert!(session.outbound.is_empty());
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_inbound_qos2_is_delivered_once() {
        let store = MemoryPersistence::new();
        let mut session = session_with_store(store.clone());
        session.connected = true;

        let publish = Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic_name: "t",
            packet_id: Some(9),
            payload: b"payload",
        };
        let raw = wire(&Packet::Publish(publish.clone()));

        session.on_publish(&publish, &raw).unwrap();
        assert_eq!(session.queue.len(), 1);
        assert!(store.contains_key(&persist::received_key(9)));

        // broker retransmits before seeing our PUBREC
        let dup = Publish { dup: true, ..publish };
        session.on_publish(&dup, &raw).unwrap();
        assert_eq!(session.queue.len(), 1, "duplicate must not be re-queued");

        session.on_publish_release(9).unwrap();
        assert!(session.inbound.is_empty());
        assert!(!store.contains_key(&persist::received_key(9)));
    }

    #[test]
    fn test_restore_classifies_records() {
        let store = MemoryPersistence::new();
        {
            let mut seed = store.clone();
            // QoS 1 publish awaiting PUBACK
            seed.put(
                "s-2",
                &[&wire(&Packet::Publish(Publish {
                    dup: false,
                    qos: QoS::AtLeastOnce,
                    retain: false,
                    topic_name: "a",
                    packet_id: Some(2),
                    payload: b"two",
                }))[..]],
            )
            .unwrap();
            // QoS 2 publish whose PUBREL went out
            seed.put(
                "s-5",
                &[&wire(&Packet::Publish(Publish {
                    dup: false,
                    qos: QoS::ExactlyOnce,
                    retain: false,
                    topic_name: "b",
                    packet_id: Some(5),
                    payload: b"five",
                }))[..]],
            )
            .unwrap();
            seed.put(
                "sc-5",
                &[&wire(&Packet::PublishRelease(PublishRelease { packet_id: 5 }))[..]],
            )
            .unwrap();
            // inbound QoS 2 awaiting PUBREL
            seed.put(
                "r-7",
                &[&wire(&Packet::Publish(Publish {
                    dup: false,
                    qos: QoS::ExactlyOnce,
                    retain: false,
                    topic_name: "c",
                    packet_id: Some(7),
                    payload: b"seven",
                }))[..]],
            )
            .unwrap();
            // orphaned PUBREL marker and a corrupt record
            seed.put(
                "sc-9",
                &[&wire(&Packet::PublishRelease(PublishRelease { packet_id: 9 }))[..]],
            )
            .unwrap();
            seed.put("s-11", &[&b"\x32\x99garbage"[..]]).unwrap();
        }

        let mut session = session_with_store(store.clone());
        session.restore().unwrap();

        assert_eq!(session.outbound.ids(), vec![2, 5]);
        assert_eq!(session.outbound.find_mut(2).unwrap().next, Expected::PubAck);
        assert_eq!(session.outbound.find_mut(5).unwrap().next, Expected::PubComp);
        assert_eq!(session.inbound.ids(), vec![7]);
        assert_eq!(session.inbound.find_mut(7).unwrap().next, Expected::PubRel);

        assert!(!store.contains_key("sc-9"), "orphaned PUBREL removed");
        assert!(!store.contains_key("s-11"), "corrupt record removed");
        assert!(store.contains_key("sc-5"), "live PUBREL marker kept");
    }

    #[test]
    fn test_clean_session_reset() {
        let store = MemoryPersistence::new();
        let mut session = session_with_store(store.clone());
        session.connected = true;

        session.start_publish("t", b"x", QoS::AtLeastOnce, false).unwrap();
        session.queue.push_back(Message::new("t", &b"x"[..]));
        assert!(!store.keys().unwrap().is_empty());

        session.clean_session_reset().unwrap();
        assert!(session.outbound.is_empty());
        assert_eq!(session.queue.len(), 0);
        assert!(store.keys().unwrap().is_empty());
        assert_eq!(session.next_packet_id().unwrap(), 1);
    }

    #[test]
    fn test_keepalive_pings_then_fails() {
        let mut session = session();
        session.connected = true;
        session.configure(ConnectOptions::new().with_keep_alive(Duration::from_secs(10)));

        let now = Instant::now();
        session.last_contact = now;
        session.keepalive(now).unwrap();
        assert!(session.pending_write().is_empty(), "no ping while fresh");

        let later = now + Duration::from_secs(10);
        session.keepalive(later).unwrap();
        assert_eq!(session.pending_write(), wire(&Packet::Ping).as_slice());
        assert!(session.ping_outstanding);

        // an unanswered ping for another interval breaks the connection
        let much_later = later + Duration::from_secs(10);
        assert_matches!(session.keepalive(much_later), Err(Error::Timeout));
    }

    #[test]
    fn test_retry_resends_with_dup() {
        let mut session = session();
        session.connected = true;

        let token = session
            .start_publish("t", b"x", QoS::AtLeastOnce, false)
            .unwrap()
            .unwrap();
        // pretend the broker stayed silent past the retry interval
        session.reset_retry();
        session.retry(Instant::now()).unwrap();

        let expected = wire(&Packet::Publish(Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic_name: "t",
            packet_id: Some(token),
            payload: b"x",
        }));
        assert_eq!(session.pending_write(), expected.as_slice());
    }

    #[test]
    fn test_dispatch_routes_acks_to_waiter_slots() {
        let mut session = session();
        session.connected = true;

        session.feed_read(&wire(&Packet::ConnectAck(ConnectAck {
            session_present: false,
            return_code: packet::ConnectReturnCode::ConnectionAccepted,
        })));
        assert_matches!(
            session.poll_packet().unwrap(),
            Some(Incoming::ConnectAck(_))
        );

        session.feed_read(&wire(&Packet::SubscribeAck(SubscribeAck {
            packet_id: 3,
            status: vec![packet::SubscribeReturnCode::Success(QoS::AtLeastOnce)],
        })));
        assert_matches!(
            session.poll_packet().unwrap(),
            Some(Incoming::SubscribeAck(_))
        );

        // a packet only brokers may receive is a protocol error
        session.feed_read(&wire(&Packet::Subscribe(packet::Subscribe {
            packet_id: 4,
            subscriptions: vec![("t", QoS::AtMostOnce)],
        })));
        assert_matches!(session.poll_packet(), Err(Error::Protocol(_)));
    }
}
