//! The MQTT protocol works by exchanging a series of MQTT Control Packets in a defined way.
//!
//! This crate describes the format of these packets for protocol versions 3.1 and 3.1.1,
//! and provides a byte-accurate decoder and encoder for them.

#[macro_use]
extern crate bitflags;

mod decode;
mod encode;
mod packet;

pub use crate::decode::{frame_length, parse, restore, RestoreError};
pub use crate::encode::WriteTo;
pub use crate::packet::*;
