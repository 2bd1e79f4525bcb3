use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use mio::{Events, Poll, PollOpt, Ready, Token};
use slab::Slab;

use crate::handler::EventHandler;
use crate::packet::{ConnectAck, SubscribeAck, UnsubscribeAck};
use crate::session::{ConnectState, Incoming, Session};
use crate::{Error, Result};

/// Keep-alive and retry cadence, shared across every client of a context.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);
/// Poll timeout the background worker settles into.
const WORKER_CYCLE: Duration = Duration::from_secs(1);
/// The worker's first poll is short so a pending connect is noticed promptly.
const FIRST_CYCLE: Duration = Duration::from_millis(10);
/// Poll timeout used by caller threads driving the loop themselves.
pub(crate) const SYNC_CYCLE: Duration = Duration::from_millis(100);

/// Shared library state: the poller, the client registry and the worker
/// thread. Create one `Context` per process (or one per broker fleet) and
/// create clients against it.
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new() -> io::Result<Context> {
        Ok(Context {
            inner: Arc::new(ContextInner {
                poll: Poll::new()?,
                core: Mutex::new(Core {
                    clients: Slab::new(),
                    last_housekeeping: Instant::now(),
                    worker_running: false,
                    worker_stop: false,
                    next_generation: 0,
                }),
                cond: Condvar::new(),
                events: Mutex::new(Events::with_capacity(64)),
                worker: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn shared(&self) -> Arc<ContextInner> {
        Arc::clone(&self.inner)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        {
            let mut core = lock(&self.inner.core);
            core.worker_stop = true;
        }
        let worker = lock(&self.inner.worker).take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

pub(crate) struct ContextInner {
    pub poll: Poll,
    pub core: Mutex<Core>,
    pub cond: Condvar,
    events: Mutex<Events>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

pub(crate) struct Core {
    pub clients: Slab<ClientState>,
    pub last_housekeeping: Instant,
    pub worker_running: bool,
    pub worker_stop: bool,
    pub next_generation: u64,
}

impl Core {
    /// Resolves a handle, failing when the slot was vacated or reused.
    pub fn client(&mut self, id: HandleId) -> Result<&mut ClientState> {
        match self.clients.get_mut(id.key) {
            Some(state) if state.generation == id.generation => Ok(state),
            _ => Err(Error::Destroyed),
        }
    }
}

/// A stable reference to a registry slot; the generation guards against the
/// slot being reused after `destroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HandleId {
    pub key: usize,
    pub generation: u64,
}

pub(crate) struct ClientState {
    pub generation: u64,
    pub token: usize,
    pub session: Session,
    pub handler: Option<Arc<dyn EventHandler>>,
    /// The reply a blocked caller is waiting on.
    pub awaited: Option<Awaited>,
    /// Deferred result of the non-blocking TCP connect.
    pub connect_io: Option<io::Result<()>>,
}

#[derive(Debug)]
pub(crate) enum Awaited {
    ConnectAck(ConnectAck),
    SubscribeAck(SubscribeAck),
    UnsubscribeAck(UnsubscribeAck),
}

/// Locks a mutex, surviving poisoning; state consistency is guarded by the
/// session flags, not by the panic history of other threads.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registers interest for a client socket; writable only while there is
/// something to write, so level-triggered polling stays quiet.
pub(crate) fn reregister(ctx: &ContextInner, state: &ClientState) {
    if let Some(stream) = state.session.stream() {
        let interest = if state.session.wants_write() {
            Ready::readable() | Ready::writable()
        } else {
            Ready::readable()
        };
        if let Err(err) = ctx
            .poll
            .reregister(stream, Token(state.token), interest, PollOpt::level())
        {
            warn!("fail to reregister socket: {}", err);
        }
    }
}

/// Closes a client's connection after a failure, preserving non-clean session
/// state. Returns the connection-lost handler to invoke (lock released) when
/// the client had an established connection.
pub(crate) fn teardown(
    ctx: &ContextInner,
    state: &mut ClientState,
) -> Option<Arc<dyn EventHandler>> {
    let was_connected = state.session.connected;

    if let Some(stream) = state.session.close(true) {
        let _ = ctx.poll.deregister(&stream);
    }
    if state.connect_io.is_none() {
        state.connect_io = Some(Err(io::Error::from(io::ErrorKind::ConnectionAborted)));
    }

    if was_connected {
        state.handler.clone()
    } else {
        None
    }
}

/// Runs `connection_lost` on its own thread so the callback can call
/// `connect` again without deadlocking the loop that noticed the failure.
pub(crate) fn spawn_connection_lost(handler: Arc<dyn EventHandler>) {
    let spawned = thread::Builder::new()
        .name("magpie-connection-lost".into())
        .spawn(move || handler.connection_lost());
    if let Err(err) = spawned {
        warn!("fail to spawn connection-lost thread: {}", err);
    }
}

/// One pass of the event loop: poll for readiness, feed ready sockets through
/// the sessions, run housekeeping, then deliver callbacks with the lock
/// released.
///
/// `deliver_messages` is set only on the worker thread, which keeps
/// `message_arrived` serial per client even when caller threads drive the
/// loop concurrently.
pub(crate) fn cycle(ctx: &ContextInner, timeout: Duration, deliver_messages: bool) {
    let mut events = lock(&ctx.events);
    if let Err(err) = ctx.poll.poll(&mut events, Some(timeout)) {
        warn!("poll failed: {}", err);
        return;
    }

    let mut lost = Vec::new();
    let mut completed = Vec::new();
    let mut core = lock(&ctx.core);

    for event in events.iter() {
        let key = event.token().0;

        if event.readiness().is_writable() {
            if let Some(state) = core.clients.get_mut(key) {
                if state.session.connect_state == ConnectState::TcpInProgress {
                    let result = state.session.finish_tcp_connect();
                    state.connect_io = Some(result);
                } else {
                    match state.session.try_flush() {
                        Ok(_) => reregister(ctx, state),
                        Err(err) => {
                            debug!("write failed: {}", err);
                            if let Some(handler) = teardown(ctx, state) {
                                lost.push(handler);
                            }
                        }
                    }
                }
            }
        }

        if event.readiness().is_readable() {
            loop {
                let state = match core.clients.get_mut(key) {
                    Some(state) => state,
                    None => break,
                };
                if state.session.connect_state == ConnectState::TcpInProgress {
                    // readiness during connect establishment carries no packet
                    break;
                }

                match state.session.poll_packet() {
                    Ok(Some(Incoming::None)) => reregister(ctx, state),
                    Ok(Some(Incoming::Completed(token))) => {
                        if let Some(handler) = state.handler.clone() {
                            completed.push((handler, token));
                        }
                        reregister(ctx, state);
                    }
                    Ok(Some(Incoming::ConnectAck(ack))) => {
                        state.awaited = Some(Awaited::ConnectAck(ack));
                    }
                    Ok(Some(Incoming::SubscribeAck(ack))) => {
                        state.awaited = Some(Awaited::SubscribeAck(ack));
                    }
                    Ok(Some(Incoming::UnsubscribeAck(ack))) => {
                        state.awaited = Some(Awaited::UnsubscribeAck(ack));
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(
                            "client {} connection failed: {}",
                            state.session.client_id, err
                        );
                        if let Some(handler) = teardown(ctx, state) {
                            lost.push(handler);
                        }
                        break;
                    }
                }
            }
        }
    }

    let now = Instant::now();
    if now.duration_since(core.last_housekeeping) >= HOUSEKEEPING_INTERVAL {
        core.last_housekeeping = now;
        for (_, state) in core.clients.iter_mut() {
            let result = state
                .session
                .keepalive(now)
                .and_then(|_| state.session.retry(now));
            match result {
                Ok(()) => reregister(ctx, state),
                Err(err) => {
                    info!(
                        "client {} closed by housekeeping: {}",
                        state.session.client_id, err
                    );
                    if let Some(handler) = teardown(ctx, state) {
                        lost.push(handler);
                    }
                }
            }
        }
    }

    // async-mode clients with pending arrivals
    let mut active = Vec::new();
    if deliver_messages {
        for (key, state) in core.clients.iter() {
            if let Some(ref handler) = state.handler {
                if state.session.queue.len() > 0 {
                    active.push((key, state.generation, handler.clone()));
                }
            }
        }
    }

    ctx.cond.notify_all();
    drop(core);
    drop(events);

    for handler in lost {
        spawn_connection_lost(handler);
    }
    for (handler, token) in completed {
        handler.delivery_complete(token);
    }
    for (key, generation, handler) in active {
        deliver_queue(ctx, key, generation, &handler);
    }
}

/// Hands queued messages to the handler one by one, stopping when the
/// application declines one; a declined message stays at the head of the
/// queue for the next delivery pass.
fn deliver_queue(ctx: &ContextInner, key: usize, generation: u64, handler: &Arc<dyn EventHandler>) {
    loop {
        let message = {
            let mut core = lock(&ctx.core);
            match core.clients.get_mut(key) {
                Some(state) if state.generation == generation => state.session.queue.pop_front(),
                _ => None,
            }
        };
        let message = match message {
            Some(message) => message,
            None => break,
        };

        let retained = message.clone();
        if !handler.message_arrived(message) {
            debug!("message declined by handler, keeping it queued");
            let mut core = lock(&ctx.core);
            if let Some(state) = core.clients.get_mut(key) {
                if state.generation == generation {
                    state.session.queue.push_front(retained);
                }
            }
            break;
        }
    }
}

/// Starts the background worker if it is not already running.
pub(crate) fn ensure_worker(ctx: &Arc<ContextInner>) {
    {
        let mut core = lock(&ctx.core);
        if core.worker_running {
            // revive a worker that was flagged to stop but has not yet exited
            core.worker_stop = false;
            return;
        }
        core.worker_running = true;
        core.worker_stop = false;
    }

    let worker_ctx = Arc::clone(ctx);
    let spawned = thread::Builder::new()
        .name("magpie-worker".into())
        .spawn(move || {
            let mut timeout = FIRST_CYCLE;
            loop {
                {
                    // the stop decision and the flag reset happen in one
                    // critical section, so ensure_worker never observes a
                    // worker that is "running" but already past its exit check
                    let mut core = lock(&worker_ctx.core);
                    if core.worker_stop {
                        core.worker_running = false;
                        core.worker_stop = false;
                        worker_ctx.cond.notify_all();
                        return;
                    }
                }
                cycle(&worker_ctx, timeout, true);
                timeout = WORKER_CYCLE;
            }
        });

    match spawned {
        Ok(handle) => {
            *lock(&ctx.worker) = Some(handle);
        }
        Err(err) => {
            warn!("fail to spawn worker thread: {}", err);
            let mut core = lock(&ctx.core);
            core.worker_running = false;
        }
    }
}

/// Flags the worker to stop once no client is connected or connecting.
pub(crate) fn stop_worker_if_idle(core: &mut Core) {
    if !core.worker_running {
        return;
    }
    let busy = core.clients.iter().any(|(_, state)| {
        state.session.connected || state.session.connect_state != ConnectState::Idle
    });
    if !busy {
        core.worker_stop = true;
    }
}

/// Blocks until `pred` yields a value, the deadline passes, or `pred` fails.
///
/// With the worker running, this parks on the condvar the cycle notifies;
/// otherwise the calling thread drives the event loop itself, releasing the
/// core lock around each poll.
pub(crate) fn wait_until<R>(
    ctx: &ContextInner,
    deadline: Instant,
    mut pred: impl FnMut(&mut Core) -> Result<Option<R>>,
) -> Result<R> {
    loop {
        {
            let mut core = lock(&ctx.core);
            if let Some(value) = pred(&mut core)? {
                return Ok(value);
            }

            if core.worker_running {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout);
                }
                let _guard = match ctx.cond.wait_timeout(core, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
                continue;
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout);
        }
        cycle(ctx, (deadline - now).min(SYNC_CYCLE), false);
    }
}
