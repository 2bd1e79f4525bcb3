use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mio::{PollOpt, Ready, Token};

use crate::eventloop::{
    cycle, ensure_worker, lock, reregister, spawn_connection_lost, stop_worker_if_idle, teardown,
    Awaited, ClientState, Context, ContextInner, HandleId, SYNC_CYCLE,
};
use crate::handler::EventHandler;
use crate::message::Message;
use crate::options::{validate_topic_name, ConnectOptions};
use crate::packet::{Packet, PacketId, QoS, Subscribe, SubscribeReturnCode, Unsubscribe};
use crate::persist::Persistence;
use crate::session::{ConnectState, Session};
use crate::{Error, Result};

/// How long subscribe and unsubscribe wait for their acknowledgment.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// How long one `do_yield` call keeps the loop turning.
const YIELD_INTERVAL: Duration = Duration::from_millis(100);

/// The packet identifier under which a QoS 1 or 2 publish travels; resolves
/// through [`Client::wait_for_completion`] or the `delivery_complete`
/// callback.
pub type DeliveryToken = PacketId;

/// A handle to one MQTT client session.
///
/// Handles are cheap to clone and safe to share between threads; every
/// operation takes the library lock internally. A client works in one of two
/// modes: without a handler the caller drives the network through blocking
/// calls (`receive`, `do_yield`); with a handler installed via
/// [`set_handler`](Client::set_handler) a background worker thread owns the
/// event loop and fires callbacks.
#[derive(Clone)]
pub struct Client {
    ctx: Arc<ContextInner>,
    id: HandleId,
}

impl Client {
    /// Creates a client bound to `server_uri` (a `tcp://host:port` or
    /// `host:port` address) with the given persistence store. In-flight
    /// messages a previous incarnation persisted are restored immediately.
    pub fn create(
        ctx: &Context,
        server_uri: &str,
        client_id: &str,
        mut persistence: Box<dyn Persistence>,
    ) -> Result<Client> {
        if client_id.is_empty() {
            return Err(Error::NullParameter("client_id"));
        }

        let server_uri = server_uri
            .strip_prefix("tcp://")
            .unwrap_or(server_uri)
            .to_string();

        persistence.open(client_id, &server_uri)?;
        let mut session = Session::new(client_id, &server_uri, persistence);
        session.restore()?;

        let ctx = ctx.shared();
        let mut core = lock(&ctx.core);
        core.next_generation += 1;
        let generation = core.next_generation;
        let entry = core.clients.vacant_entry();
        let key = entry.key();
        entry.insert(ClientState {
            generation,
            token: key,
            session,
            handler: None,
            awaited: None,
            connect_io: None,
        });
        drop(core);

        info!("created client {} for {}", client_id, server_uri);
        Ok(Client {
            ctx,
            id: HandleId { key, generation },
        })
    }

    /// Installs the callback set and switches the client to background mode.
    /// Only valid while disconnected.
    pub fn set_handler<H: EventHandler + 'static>(&self, handler: H) -> Result<()> {
        let mut core = lock(&self.ctx.core);
        let state = core.client(self.id)?;
        if state.session.connected || state.session.connect_state != ConnectState::Idle {
            return Err(Error::InvalidState("callbacks require a disconnected client"));
        }
        state.handler = Some(Arc::new(handler));
        Ok(())
    }

    /// Connects to the broker and completes the MQTT handshake.
    ///
    /// Returns once CONNACK arrives, the connect timeout elapses, or the
    /// broker refuses the session; a refusal surfaces the broker's return
    /// code as [`Error::ConnectionRefused`].
    pub fn connect(&self, options: ConnectOptions) -> Result<()> {
        let deadline = Instant::now() + options.connect_timeout;

        let async_mode = {
            let mut core = lock(&self.ctx.core);
            let state = core.client(self.id)?;
            if state.session.connected || state.session.connect_state != ConnectState::Idle {
                return Err(Error::InvalidState("already connected"));
            }
            options.validate(&state.session.client_id)?;

            state.connect_io = None;
            state.awaited = None;
            state.session.configure(options);
            state.session.open_transport()?;
            if let Some(stream) = state.session.stream() {
                if let Err(err) = self.ctx.poll.register(
                    stream,
                    Token(state.token),
                    Ready::readable() | Ready::writable(),
                    PollOpt::level(),
                ) {
                    state.session.close(false);
                    return Err(err.into());
                }
            }
            state.handler.is_some()
        };

        if async_mode {
            ensure_worker(&self.ctx);
        }

        // wait for the non-blocking TCP connect to resolve
        let tcp_result = self.wait_for(deadline, |state| Ok(state.connect_io.take()));
        match tcp_result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.abort_connect();
                return Err(err.into());
            }
            Err(err) => {
                self.abort_connect();
                return Err(err);
            }
        }

        // transport is up: send CONNECT and await CONNACK
        {
            let mut core = lock(&self.ctx.core);
            let state = core.client(self.id)?;
            state.session.connect_state = ConnectState::AwaitingConnack;
            if let Err(err) = state.session.send_connect() {
                drop(core);
                self.abort_connect();
                return Err(err);
            }
            reregister(&self.ctx, state);
        }

        let ack = self.wait_for(deadline, |state| {
            if !state.session.good && state.session.connect_state == ConnectState::Idle {
                return Err(Error::Disconnected);
            }
            match state.awaited.take() {
                Some(Awaited::ConnectAck(ack)) => Ok(Some(ack)),
                Some(other) => {
                    state.awaited = Some(other);
                    Ok(None)
                }
                None => Ok(None),
            }
        });
        let ack = match ack {
            Ok(ack) => ack,
            Err(err) => {
                self.abort_connect();
                return Err(err);
            }
        };

        let mut core = lock(&self.ctx.core);
        let state = core.client(self.id)?;
        match ack.return_code.ok() {
            Ok(()) => {
                // the state machine completed the handshake when it
                // dispatched the CONNACK; it may also have lost the
                // connection again in the meantime
                if !state.session.connected {
                    return Err(Error::Disconnected);
                }
                reregister(&self.ctx, state);
                Ok(())
            }
            Err(code) => {
                info!("client {} refused: {}", state.session.client_id, code);
                if let Some(stream) = state.session.close(false) {
                    let _ = self.ctx.poll.deregister(&stream);
                }
                stop_worker_if_idle(&mut core);
                Err(Error::ConnectionRefused(code))
            }
        }
    }

    /// Whether the client currently holds an accepted connection.
    pub fn is_connected(&self) -> bool {
        let mut core = lock(&self.ctx.core);
        core.client(self.id)
            .map(|state| state.session.connected)
            .unwrap_or(false)
    }

    /// Whether the broker announced stored session state at the last connect.
    pub fn session_present(&self) -> bool {
        let mut core = lock(&self.ctx.core);
        core.client(self.id)
            .map(|state| state.session.session_present)
            .unwrap_or(false)
    }

    /// Subscribes to a single topic filter, returning the granted QoS.
    pub fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<QoS> {
        let status = self.subscribe_many(&[(topic_filter, qos)])?;
        match status[0] {
            SubscribeReturnCode::Success(granted) => Ok(granted),
            SubscribeReturnCode::Failure => Err(Error::SubscribeFailed),
        }
    }

    /// Subscribes to a list of topic filters, returning the broker's verdict
    /// for each in request order.
    pub fn subscribe_many(
        &self,
        subscriptions: &[(&str, QoS)],
    ) -> Result<Vec<SubscribeReturnCode>> {
        if subscriptions.is_empty() {
            return Err(Error::NullParameter("subscriptions"));
        }

        let packet_id = {
            let mut core = lock(&self.ctx.core);
            let state = core.client(self.id)?;
            if !state.session.connected {
                return Err(Error::Disconnected);
            }
            let packet_id = state.session.next_packet_id()?;
            let result = state.session.send_packet(&Packet::Subscribe(Subscribe {
                packet_id,
                subscriptions: subscriptions.to_vec(),
            }));
            match result {
                Ok(()) => {
                    reregister(&self.ctx, state);
                    packet_id
                }
                Err(err) => {
                    let lost = teardown(&self.ctx, state);
                    drop(core);
                    if let Some(handler) = lost {
                        spawn_connection_lost(handler);
                    }
                    return Err(err);
                }
            }
        };

        let ack = self.wait_for_ack(|awaited| match awaited {
            Awaited::SubscribeAck(ack) if ack.packet_id == packet_id => Ok(ack),
            other => Err(other),
        })?;

        if ack.status.len() != subscriptions.len() {
            self.drop_connection();
            return Err(Error::Protocol("SUBACK return-code count mismatch"));
        }
        Ok(ack.status)
    }

    /// Unsubscribes from a single topic filter.
    pub fn unsubscribe(&self, topic_filter: &str) -> Result<()> {
        self.unsubscribe_many(&[topic_filter])
    }

    /// Unsubscribes from a list of topic filters.
    pub fn unsubscribe_many(&self, topic_filters: &[&str]) -> Result<()> {
        if topic_filters.is_empty() {
            return Err(Error::NullParameter("topic_filters"));
        }

        let packet_id = {
            let mut core = lock(&self.ctx.core);
            let state = core.client(self.id)?;
            if !state.session.connected {
                return Err(Error::Disconnected);
            }
            let packet_id = state.session.next_packet_id()?;
            let result = state.session.send_packet(&Packet::Unsubscribe(Unsubscribe {
                packet_id,
                topic_filters: topic_filters.to_vec(),
            }));
            match result {
                Ok(()) => {
                    reregister(&self.ctx, state);
                    packet_id
                }
                Err(err) => {
                    let lost = teardown(&self.ctx, state);
                    drop(core);
                    if let Some(handler) = lost {
                        spawn_connection_lost(handler);
                    }
                    return Err(err);
                }
            }
        };

        self.wait_for_ack(|awaited| match awaited {
            Awaited::UnsubscribeAck(ack) if ack.packet_id == packet_id => Ok(ack),
            other => Err(other),
        })?;

        Ok(())
    }

    /// Publishes a message, blocking while the in-flight window is full.
    ///
    /// For QoS 1 and 2 the returned token resolves once the acknowledgment
    /// handshake completes; QoS 0 yields no token.
    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retained: bool,
    ) -> Result<Option<DeliveryToken>> {
        self.publish_inner(topic, payload, qos, retained, true)
    }

    /// Like [`publish`](Client::publish) but fails with
    /// [`Error::MaxMessagesInflight`] instead of blocking.
    pub fn try_publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retained: bool,
    ) -> Result<Option<DeliveryToken>> {
        self.publish_inner(topic, payload, qos, retained, false)
    }

    /// Publishes a pre-built [`Message`].
    pub fn publish_message(&self, message: &Message) -> Result<Option<DeliveryToken>> {
        self.publish_inner(
            &message.topic,
            &message.payload,
            message.qos,
            message.retained,
            true,
        )
    }

    fn publish_inner(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retained: bool,
        blocking: bool,
    ) -> Result<Option<DeliveryToken>> {
        validate_topic_name(topic)?;

        loop {
            let mut core = lock(&self.ctx.core);
            let state = core.client(self.id)?;
            if !state.session.connected {
                return Err(Error::Disconnected);
            }

            if qos == QoS::AtMostOnce || state.session.outbound.len() < state.session.max_inflight {
                let result = state.session.start_publish(topic, payload, qos, retained);
                if state.session.good {
                    reregister(&self.ctx, state);
                    return result;
                }
                // the socket died mid-publish; QoS 1 and 2 survive in
                // persistence, so the token is still good
                let lost = teardown(&self.ctx, state);
                drop(core);
                if let Some(handler) = lost {
                    spawn_connection_lost(handler);
                }
                return result;
            }

            if !blocking {
                return Err(Error::MaxMessagesInflight);
            }

            trace!("publish blocked on full in-flight window");
            if core.worker_running {
                let _guard = match self.ctx.cond.wait_timeout(core, SYNC_CYCLE) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            } else {
                drop(core);
                cycle(&self.ctx, SYNC_CYCLE, false);
            }
        }
    }

    /// Receives the next message, waiting up to `timeout`.
    ///
    /// Only valid without a handler installed. A zero timeout still runs one
    /// event-loop pass, so queued traffic is picked up. `Ok(None)` means the
    /// wait elapsed with nothing to deliver.
    pub fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;

        {
            let mut core = lock(&self.ctx.core);
            let state = core.client(self.id)?;
            if state.handler.is_some() {
                return Err(Error::InvalidState("receive requires no callbacks"));
            }
            if !state.session.connected {
                return Err(Error::Disconnected);
            }
            if let Some(message) = state.session.queue.pop_front() {
                return Ok(Some(message));
            }
        }

        loop {
            let now = Instant::now();
            cycle(
                &self.ctx,
                deadline.saturating_duration_since(now).min(SYNC_CYCLE),
                false,
            );

            let mut core = lock(&self.ctx.core);
            let state = core.client(self.id)?;
            if let Some(message) = state.session.queue.pop_front() {
                return Ok(Some(message));
            }
            if !state.session.connected {
                return Err(Error::Disconnected);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Gives the event loop roughly 100 ms of attention without delivering
    /// messages; lets a handler-less client service keep-alive and acks while
    /// the application is otherwise busy.
    pub fn do_yield(&self) {
        let worker_running = {
            let core = lock(&self.ctx.core);
            core.worker_running
        };
        if worker_running {
            thread::sleep(YIELD_INTERVAL);
            return;
        }

        let deadline = Instant::now() + YIELD_INTERVAL;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            cycle(&self.ctx, (deadline - now).min(SYNC_CYCLE), false);
        }
    }

    /// Blocks until the publish identified by `token` completes its
    /// handshake, the client disconnects, or `timeout` elapses.
    pub fn wait_for_completion(&self, token: DeliveryToken, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let id = self.id;

        crate::eventloop::wait_until(&self.ctx, deadline, move |core| {
            let state = core.client(id)?;
            if !state.session.outbound.contains(token) {
                return Ok(Some(()));
            }
            if !state.session.connected {
                return Err(Error::Disconnected);
            }
            Ok(None)
        })
    }

    /// Tokens of every publish still awaiting completion, oldest first.
    pub fn pending_delivery_tokens(&self) -> Result<Vec<DeliveryToken>> {
        let mut core = lock(&self.ctx.core);
        let state = core.client(self.id)?;
        Ok(state.session.outbound.ids())
    }

    /// Disconnects from the broker, waiting up to `timeout` for in-flight
    /// handshakes to finish before the DISCONNECT packet goes out.
    pub fn disconnect(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        {
            let mut core = lock(&self.ctx.core);
            let state = core.client(self.id)?;
            if !state.session.connected {
                return Err(Error::Disconnected);
            }
            state.session.connect_state = ConnectState::Disconnecting;
        }

        let id = self.id;
        let drained = crate::eventloop::wait_until(&self.ctx, deadline, move |core| {
            let state = core.client(id)?;
            if !state.session.connected {
                return Ok(Some(()));
            }
            if state.session.inbound.is_empty() && state.session.outbound.is_empty() {
                Ok(Some(()))
            } else {
                Ok(None)
            }
        });
        if let Err(Error::Timeout) = drained {
            debug!("disconnect proceeding with in-flight messages pending");
        }

        let mut core = lock(&self.ctx.core);
        if let Ok(state) = core.client(self.id) {
            if let Some(stream) = state.session.close(true) {
                let _ = self.ctx.poll.deregister(&stream);
            }
        }
        stop_worker_if_idle(&mut core);
        self.ctx.cond.notify_all();
        Ok(())
    }

    /// Destroys the client: disconnects if needed, closes the persistence
    /// store without clearing it, and invalidates every clone of this handle.
    /// The background worker stops once the last client is gone.
    pub fn destroy(&self) -> Result<()> {
        let mut core = lock(&self.ctx.core);
        match core.clients.get_mut(self.id.key) {
            Some(state) if state.generation == self.id.generation => {
                if let Some(stream) = state.session.close(true) {
                    let _ = self.ctx.poll.deregister(&stream);
                }
            }
            _ => return Err(Error::Destroyed),
        }

        let mut state = core.clients.remove(self.id.key);
        state.session.close_store();
        info!("destroyed client {}", state.session.client_id);

        stop_worker_if_idle(&mut core);
        self.ctx.cond.notify_all();
        Ok(())
    }

    /// Closes the connection after a socket failure observed by a caller
    /// thread, firing `connection_lost` when callbacks are installed.
    fn drop_connection(&self) {
        let lost = {
            let mut core = lock(&self.ctx.core);
            match core.client(self.id) {
                Ok(state) => teardown(&self.ctx, state),
                Err(_) => None,
            }
        };
        if let Some(handler) = lost {
            spawn_connection_lost(handler);
        }
    }

    /// Quietly closes a connection that never completed its handshake.
    fn abort_connect(&self) {
        let mut core = lock(&self.ctx.core);
        if let Ok(state) = core.client(self.id) {
            if let Some(stream) = state.session.close(false) {
                let _ = self.ctx.poll.deregister(&stream);
            }
        }
        stop_worker_if_idle(&mut core);
    }

    /// Waits on a per-client predicate; thin wrapper over the context wait.
    fn wait_for<R>(
        &self,
        deadline: Instant,
        mut pred: impl FnMut(&mut ClientState) -> Result<Option<R>>,
    ) -> Result<R> {
        let id = self.id;
        crate::eventloop::wait_until(&self.ctx, deadline, move |core| {
            let state = core.client(id)?;
            pred(state)
        })
    }

    /// Waits up to the fixed acknowledgment timeout for a matching reply in
    /// the awaited-packet slot.
    fn wait_for_ack<A>(
        &self,
        mut select: impl FnMut(Awaited) -> std::result::Result<A, Awaited>,
    ) -> Result<A> {
        let deadline = Instant::now() + ACK_TIMEOUT;
        self.wait_for(deadline, move |state| {
            if !state.session.connected {
                return Err(Error::Disconnected);
            }
            match state.awaited.take() {
                Some(awaited) => match select(awaited) {
                    Ok(ack) => Ok(Some(ack)),
                    Err(other) => {
                        state.awaited = Some(other);
                        Ok(None)
                    }
                },
                None => Ok(None),
            }
        })
    }
}
