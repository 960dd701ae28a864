//! Protocol trait seams for the mesh networking layer.
//!
//! Traits are defined separately from implementations so the DHT can be
//! driven by any transport (the envelope RPC layer in production, an
//! in-memory network in tests) without circular module dependencies.

use anyhow::Result;
use async_trait::async_trait;

use crate::dht::{Key, NodeRecord};

/// DHT node operations for distributed routing and storage.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Ping a node to check liveness. Reused by bucket eviction.
    async fn ping(&self, to: &NodeRecord) -> Result<()>;

    /// Find the k closest nodes to a target id.
    async fn find_node(&self, to: &NodeRecord, target: Key) -> Result<Vec<NodeRecord>>;

    /// Find a value by key, returning the value with remaining TTL and/or
    /// closer nodes.
    async fn find_value(
        &self,
        to: &NodeRecord,
        key: Key,
    ) -> Result<(Option<(Vec<u8>, u64)>, Vec<NodeRecord>)>;

    /// Store a key-value pair on a remote node with a bounded TTL.
    async fn store(&self, to: &NodeRecord, key: Key, value: Vec<u8>, ttl_secs: u64) -> Result<()>;
}
