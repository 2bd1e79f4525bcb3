//! A synchronous MQTT 3.1 / 3.1.1 client.
//!
//! The client speaks the protocol over plain TCP and keeps QoS 1 and 2
//! messages durable in a pluggable [`Persistence`] store, so delivery
//! guarantees hold across reconnects and process restarts. It can be driven
//! either from caller threads ([`Client::receive`], [`Client::do_yield`]) or
//! by a background worker thread firing the [`EventHandler`] callbacks.

#[macro_use]
extern crate log;

pub extern crate magpie_packet as packet;

mod client;
mod error;
mod eventloop;
mod handler;
mod inflight;
mod message;
mod options;
mod persist;
mod session;

pub use crate::client::{Client, DeliveryToken};
pub use crate::error::Error;
pub use crate::eventloop::Context;
pub use crate::handler::EventHandler;
pub use crate::message::{Message, Publication};
pub use crate::options::{ConnectOptions, Will};
pub use crate::persist::{MemoryPersistence, NoPersistence, Persistence};

pub use crate::packet::{ConnectReturnCode, PacketId, ProtocolVersion, QoS, SubscribeReturnCode};

/// Library result type.
pub type Result<T> = std::result::Result<T, Error>;
