use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::packet::PacketId;
use crate::{Error, Result};

/// Key prefix for an outbound publish awaiting acknowledgment.
pub const KEY_SENT: &str = "s-";
/// Key prefix marking that the PUBREL for an outbound publish went out.
pub const KEY_SENT_PUBREL: &str = "sc-";
/// Key prefix for an inbound QoS 2 publish awaiting the broker's PUBREL.
pub const KEY_RECEIVED: &str = "r-";

/// The record class a persistence key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Sent,
    SentPubrel,
    Received,
}

pub(crate) fn sent_key(packet_id: PacketId) -> String {
    format!("{}{}", KEY_SENT, packet_id)
}

pub(crate) fn pubrel_key(packet_id: PacketId) -> String {
    format!("{}{}", KEY_SENT_PUBREL, packet_id)
}

pub(crate) fn received_key(packet_id: PacketId) -> String {
    format!("{}{}", KEY_RECEIVED, packet_id)
}

/// Splits a store key into its record class and message id.
///
/// `sc-` has to be tried before `s-`, which is its prefix.
pub(crate) fn classify(key: &str) -> Option<(Kind, PacketId)> {
    let (kind, rest) = if let Some(rest) = key.strip_prefix(KEY_SENT_PUBREL) {
        (Kind::SentPubrel, rest)
    } else if let Some(rest) = key.strip_prefix(KEY_SENT) {
        (Kind::Sent, rest)
    } else if let Some(rest) = key.strip_prefix(KEY_RECEIVED) {
        (Kind::Received, rest)
    } else {
        return None;
    };

    rest.parse::<PacketId>().ok().map(|id| (kind, id))
}

/// A keyed blob store holding a client's in-flight messages across restarts.
///
/// Keys follow the grammar `<prefix><decimal message id>` with prefixes
/// [`KEY_SENT`], [`KEY_SENT_PUBREL`] and [`KEY_RECEIVED`].
pub trait Persistence: Send {
    /// Binds the store to one client/server pair.
    fn open(&mut self, client_id: &str, server_uri: &str) -> Result<()>;

    /// Releases the store without erasing its contents.
    fn close(&mut self) -> Result<()>;

    /// Writes the concatenation of `buffers` under `key`.
    fn put(&mut self, key: &str, buffers: &[&[u8]]) -> Result<()>;

    /// Reads the blob stored under `key` as one flattened buffer.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Removes the blob stored under `key`.
    fn remove(&mut self, key: &str) -> Result<()>;

    /// Lists every key in the store.
    fn keys(&self) -> Result<Vec<String>>;

    /// Whether a blob is stored under `key`.
    fn contains_key(&self, key: &str) -> bool;

    /// Erases every key of this client.
    fn clear(&mut self) -> Result<()>;
}

/// An in-memory store.
///
/// Clones share their contents, so a store handed to a re-created client
/// restores the state the previous incarnation left behind. Useful for
/// tests and for processes that only need durability across reconnects,
/// not across restarts.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Persistence for MemoryPersistence {
    fn open(&mut self, _client_id: &str, _server_uri: &str) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn put(&mut self, key: &str, buffers: &[&[u8]]) -> Result<()> {
        let mut blob = Vec::with_capacity(buffers.iter().map(|b| b.len()).sum());
        for buffer in buffers {
            blob.extend_from_slice(buffer);
        }
        self.blobs().insert(key.to_string(), blob);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Persistence(format!("no such key: {}", key)))
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.blobs().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.blobs().keys().cloned().collect())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.blobs().contains_key(key)
    }

    fn clear(&mut self) -> Result<()> {
        self.blobs().clear();
        Ok(())
    }
}

/// A store that keeps nothing.
///
/// Writes succeed as no-ops so that a deliberately store-less client can
/// still publish at QoS 1 and 2; reads fail and the key set is always empty,
/// so nothing survives the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersistence;

impl Persistence for NoPersistence {
    fn open(&mut self, _client_id: &str, _server_uri: &str) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn put(&mut self, _key: &str, _buffers: &[&[u8]]) -> Result<()> {
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        Err(Error::Persistence(format!("no store: {}", key)))
    }

    fn remove(&mut self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn contains_key(&self, _key: &str) -> bool {
        false
    }

    fn clear(&mut self) -> Result<()> {
        Ok(())
    }
}
