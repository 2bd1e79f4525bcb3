use crate::message::Message;
use crate::packet::PacketId;

/// Callbacks a client in background-thread mode drives.
///
/// Installing a handler with [`Client::set_handler`](crate::Client::set_handler)
/// switches the client to background mode: a worker thread owns the event
/// loop and invokes these methods. All of them are called with no library
/// lock held, so implementations may call back into the client.
pub trait EventHandler: Send + Sync {
    /// A message matching one of the client's subscriptions arrived.
    ///
    /// Returning `true` consumes the message. Returning `false` signals the
    /// message could not be accepted; it stays at the head of the receive
    /// queue and is offered again on a later delivery cycle.
    ///
    /// Called serially per client, in the order the publishes arrived.
    fn message_arrived(&self, message: Message) -> bool;

    /// The connection was lost.
    ///
    /// Runs on a fresh short-lived thread, so an implementation may call
    /// [`connect`](crate::Client::connect) from here to re-establish the
    /// session without deadlocking the worker.
    fn connection_lost(&self) {}

    /// The acknowledgment handshake for the QoS 1 or 2 publish identified by
    /// `token` finished; the message is no longer held in the session or the
    /// persistence store.
    fn delivery_complete(&self, token: PacketId) {
        let _ = token;
    }
}
