use std::time::Duration;

use crate::packet::{ProtocolVersion, QoS};
use crate::{Error, Result};

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(20);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// In-flight window when the reliable flag is off.
const DEFAULT_MAX_INFLIGHT: usize = 10;

/// Longest client id MQTT 3.1 servers are required to accept.
const V31_CLIENT_ID_MAX_LEN: usize = 23;

/// Options governing one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) keep_alive: Duration,
    pub(crate) clean_session: bool,
    pub(crate) reliable: bool,
    pub(crate) retry_interval: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) will: Option<Will>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            protocol_version: ProtocolVersion::V311,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            reliable: false,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            username: None,
            password: None,
            will: None,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Speak the given protocol revision; the default is 3.1.1.
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Maximum quiet interval before the client proves liveness with a PINGREQ.
    /// Zero disables keep-alive.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Continue the existing session instead of starting a clean one.
    pub fn without_clean_session(mut self) -> Self {
        self.clean_session = false;
        self
    }

    /// Allow only one in-flight message at a time, so completions happen in
    /// submission order.
    pub fn reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    /// How long an unacknowledged message waits before it is resent.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Bound on the whole connect handshake, TCP included.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Authentication credentials.
    pub fn with_credentials(mut self, username: &str, password: Option<&[u8]>) -> Self {
        self.username = Some(username.to_string());
        self.password = password.map(|p| p.to_vec());
        self
    }

    /// Message the broker publishes on the client's behalf if this connection
    /// ends abnormally.
    pub fn with_last_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    pub(crate) fn max_inflight(&self) -> usize {
        if self.reliable {
            1
        } else {
            DEFAULT_MAX_INFLIGHT
        }
    }

    pub(crate) fn validate(&self, client_id: &str) -> Result<()> {
        if self.protocol_version == ProtocolVersion::V31 && client_id.len() > V31_CLIENT_ID_MAX_LEN
        {
            return Err(Error::InvalidState("client id too long for MQTT 3.1"));
        }
        if let Some(ref will) = self.will {
            validate_topic_name(&will.topic)?;
        }
        Ok(())
    }
}

/// Last-will testament attached to a connection.
#[derive(Debug, Clone)]
pub struct Will {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) qos: QoS,
    pub(crate) retained: bool,
}

impl Will {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Will {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retained: false,
        }
    }

    /// QoS the broker uses when publishing the will.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Ask the broker to retain the will message.
    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }
}

/// A publish topic has to be a non-empty UTF-8 string without wildcards.
pub(crate) fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::NullParameter("topic"));
    }
    if topic.contains('#') || topic.contains('+') {
        return Err(Error::BadUtf8String);
    }
    Ok(())
}
