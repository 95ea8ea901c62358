//! Keys identifying the blocks to fetch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of routing and crypto keys.
pub const KEY_LENGTH: usize = 32;

/// Converts bytes to a hexadecimal string.
fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// The family of a key, which determines the scheduler it is fetched by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// Content hash key: immutable data addressed by its hash.
    Chk,
    /// Signed subspace key: data addressed by a public key and a name.
    Ssk,
}

/// A low-level routing key, as understood by the datastore and the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub key_type: KeyType,
    pub routing_key: [u8; KEY_LENGTH],
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.key_type, hex(&self.routing_key))
    }
}

/// A concrete fetch key: the routing key plus the material needed to decode the block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientKey {
    pub key_type: KeyType,
    pub routing_key: [u8; KEY_LENGTH],
    pub crypto_key: [u8; KEY_LENGTH],
}

impl ClientKey {
    pub fn new(
        key_type: KeyType,
        routing_key: [u8; KEY_LENGTH],
        crypto_key: [u8; KEY_LENGTH],
    ) -> Self {
        Self {
            key_type,
            routing_key,
            crypto_key,
        }
    }

    /// Returns the routing key of this key.
    pub fn node_key(&self) -> NodeKey {
        NodeKey {
            key_type: self.key_type,
            routing_key: self.routing_key,
        }
    }
}

// The crypto key is never printed.
impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKey")
            .field("key_type", &self.key_type)
            .field("routing_key", &hex(&self.routing_key))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.node_key(), f)
    }
}
