use bytes::Bytes;

use crate::packet::{PacketId, QoS};

/// Stored publication data, shared by every in-flight record that carries the
/// same application publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    /// the information channel the data was published to.
    pub topic: String,
    /// the application payload.
    pub payload: Bytes,
}

impl Publication {
    pub(crate) fn new(topic: &str, payload: &[u8]) -> Self {
        Publication {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
        }
    }
}

/// An application message, either submitted for publication or delivered from
/// a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// the information channel to which payload data is published.
    pub topic: String,
    /// the application payload.
    pub payload: Bytes,
    /// The level of assurance for delivery.
    pub qos: QoS,
    /// Whether the broker was (or is) asked to retain this message.
    pub retained: bool,
    /// Whether this delivery might be a re-delivery of an earlier attempt.
    pub dup: bool,
    pub(crate) packet_id: Option<PacketId>,
}

impl Message {
    /// Builds a QoS 0, non-retained message; adjust with the `with_*` methods.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Message {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retained: false,
            dup: false,
            packet_id: None,
        }
    }

    /// Sets the delivery quality of service.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Asks the broker to retain the message for future subscribers.
    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// The packet identifier the message was delivered or sent under, if any.
    pub fn packet_id(&self) -> Option<PacketId> {
        self.packet_id
    }
}
