//! # Kademlia-style Distributed Hash Table
//!
//! Peer and service discovery over a 160-bit XOR-metric id space.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `put(key, value, ttl)` | Store locally, then replicate to the k closest |
//! | `get(key)` | Local check, then iterative lookup; remote hits cached |
//! | `lookup_nodes(target)` | Iterative FIND_NODE convergence |
//! | `observe_record(record)` | Routing table insertion with ping-before-evict |
//!
//! ## Routing Table
//!
//! Buckets hold up to k = 20 contacts. The table starts as a single bucket
//! covering the whole id space; only the bucket covering the local id's own
//! range splits when full, preserving resolution near self. Elsewhere, a
//! full bucket never drops a contact on a missed insertion alone: the
//! least-recently-seen contact is pinged first and evicted only if the
//! probe fails.
//!
//! ## Consistency
//!
//! Replication is eventually consistent by design: `STORE` is best-effort
//! parallel fan-out and `FIND_VALUE` may return stale or absent results
//! before convergence.
//!
//! ## Actor Architecture
//!
//! - [`DhtNode`]: public handle, cheap to clone
//! - `DhtActor`: owns routing table and storage, processes commands
//!   sequentially over an async channel

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::identity::PeerId;
use crate::protocols::DhtRpc;

/// Kademlia replication factor (bucket size).
pub const K: usize = 20;

/// Kademlia concurrency factor (parallel queries per lookup round).
pub const ALPHA: usize = 3;

/// Hard cap on lookup rounds.
const MAX_LOOKUP_ITERATIONS: usize = 16;

/// Total timeout for one iterative lookup.
const LOOKUP_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a single query within a lookup.
const PER_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for the eviction liveness ping.
const EVICTION_PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum TTL a stored value may request (24 hours).
pub const MAX_VALUE_TTL_SECS: u64 = 24 * 60 * 60;

/// Maximum size of a single stored value.
/// SECURITY: Prevents memory exhaustion from large value storage.
const MAX_STORED_VALUE_SIZE: usize = 64 * 1024;

/// Maximum entries in the local store.
/// SECURITY: Hard cap on storage entry count.
const LOCAL_STORE_MAX_ENTRIES: usize = 50_000;

/// Command channel capacity for the actor.
const DHT_COMMAND_CHANNEL_SIZE: usize = 128;

// ============================================================================
// Node Ids (160-bit XOR metric)
// ============================================================================

/// 160-bit DHT identifier, derived by truncating BLAKE3 output.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 20]);

/// DHT storage keys live in the same id space as nodes.
pub type Key = NodeId;

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Derive the DHT id for a peer from its public key.
    pub fn from_peer(peer: &PeerId) -> Self {
        Self::from_material(peer.as_bytes())
    }

    /// Derive a DHT key from arbitrary key material (service ids, content).
    pub fn from_material(material: &[u8]) -> Self {
        let hash = blake3::hash(material);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash.as_bytes()[..20]);
        Self(bytes)
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Leading zero bits of the XOR distance to `other` (0..=160).
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        let dist = self.xor_distance(other);
        let mut zeros = 0usize;
        for byte in dist {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros() as usize;
                break;
            }
        }
        zeros
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compare two XOR distances lexicographically.
#[inline]
pub fn distance_cmp(a: &[u8; 20], b: &[u8; 20]) -> std::cmp::Ordering {
    a.cmp(b)
}

// ============================================================================
// Node Records
// ============================================================================

/// A routing table entry: an id, how to reach it, and when it was last seen.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub addr: String,
    /// Milliseconds since epoch; local bookkeeping, refreshed on contact.
    pub last_seen_ms: u64,
}

impl NodeRecord {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
            last_seen_ms: crate::identity::now_ms(),
        }
    }

    fn touch(&mut self) {
        self.last_seen_ms = crate::identity::now_ms();
    }
}

impl PartialEq for NodeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeRecord {}

// ============================================================================
// Routing Table (splitting k-buckets)
// ============================================================================

#[derive(Debug)]
enum TouchOutcome {
    Inserted,
    Refreshed,
    /// Bucket full and not splittable; caller must ping `oldest` before
    /// the candidate may take its place.
    Full { oldest: NodeRecord },
}

/// A pending ping-before-evict decision handed to the async layer.
#[derive(Clone, Debug)]
pub struct PendingEviction {
    pub oldest: NodeRecord,
    pub candidate: NodeRecord,
}

#[derive(Debug, Default)]
struct KBucket {
    /// Oldest-first; the last entry is the most recently seen.
    records: Vec<NodeRecord>,
}

impl KBucket {
    fn touch(&mut self, mut record: NodeRecord, k: usize) -> TouchOutcome {
        record.touch();
        if let Some(pos) = self.records.iter().position(|r| r.id == record.id) {
            self.records.remove(pos);
            self.records.push(record);
            return TouchOutcome::Refreshed;
        }
        if self.records.len() < k {
            self.records.push(record);
            TouchOutcome::Inserted
        } else {
            let oldest = self.records[0].clone();
            TouchOutcome::Full { oldest }
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.records.iter().position(|r| &r.id == id) {
            self.records.remove(pos);
            true
        } else {
            false
        }
    }

    fn refresh(&mut self, id: &NodeId) {
        if let Some(pos) = self.records.iter().position(|r| &r.id == id) {
            let mut record = self.records.remove(pos);
            record.touch();
            self.records.push(record);
        }
    }
}

/// Splitting k-bucket routing table.
///
/// Bucket `i` holds ids whose common prefix with the local id is exactly `i`
/// bits; the deepest bucket holds everything at least as close. Only the
/// deepest bucket - the one covering the local id's own range - splits when
/// full, so resolution keeps growing near self while far ranges stay coarse.
#[derive(Debug)]
pub struct RoutingTable {
    local: NodeId,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local: NodeId, k: usize) -> Self {
        Self {
            local,
            k,
            buckets: vec![KBucket::default()],
        }
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.local.common_prefix_len(id).min(self.buckets.len() - 1)
    }

    /// Whether a bucket covers the local id's own range (only the deepest
    /// bucket does, and only it may split).
    fn is_splittable(&self, index: usize) -> bool {
        index == self.buckets.len() - 1 && self.buckets.len() < 160
    }

    fn split_deepest(&mut self) {
        let deepest = self.buckets.len() - 1;
        let old = std::mem::take(&mut self.buckets[deepest]);
        self.buckets.push(KBucket::default());
        for record in old.records {
            let idx = self.bucket_index(&record.id);
            self.buckets[idx].records.push(record);
        }
    }

    /// Insert or refresh a record.
    ///
    /// Returns a [`PendingEviction`] when the target bucket is full and not
    /// splittable: the caller pings the oldest contact and reports back via
    /// [`apply_ping_result`](Self::apply_ping_result). An untested contact is
    /// never dropped here.
    pub fn touch(&mut self, record: NodeRecord) -> Option<PendingEviction> {
        if record.id == self.local {
            return None;
        }
        loop {
            let idx = self.bucket_index(&record.id);
            match self.buckets[idx].touch(record.clone(), self.k) {
                TouchOutcome::Inserted | TouchOutcome::Refreshed => return None,
                TouchOutcome::Full { oldest } => {
                    if self.is_splittable(idx) {
                        self.split_deepest();
                        continue;
                    }
                    return Some(PendingEviction {
                        oldest,
                        candidate: record,
                    });
                }
            }
        }
    }

    /// Apply the result of an eviction liveness probe.
    ///
    /// A live oldest contact is refreshed and the candidate dropped; a dead
    /// one is evicted and the candidate takes its place if there is room.
    pub fn apply_ping_result(&mut self, pending: PendingEviction, oldest_alive: bool) {
        let idx = self.bucket_index(&pending.oldest.id);
        if oldest_alive {
            self.buckets[idx].refresh(&pending.oldest.id);
            return;
        }
        self.buckets[idx].remove(&pending.oldest.id);
        let cand_idx = self.bucket_index(&pending.candidate.id);
        let bucket = &mut self.buckets[cand_idx];
        if bucket.records.len() < self.k
            && !bucket.records.iter().any(|r| r.id == pending.candidate.id)
        {
            bucket.records.push(pending.candidate);
        }
    }

    pub fn remove(&mut self, id: &NodeId) {
        let idx = self.bucket_index(id);
        self.buckets[idx].remove(id);
    }

    /// The `n` known records closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<NodeRecord> {
        let mut all: Vec<NodeRecord> = self
            .buckets
            .iter()
            .flat_map(|b| b.records.iter().cloned())
            .collect();
        all.sort_by(|a, b| {
            let da = a.id.xor_distance(target);
            let db = b.id.xor_distance(target);
            distance_cmp(&da, &db)
        });
        all.truncate(n);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

// ============================================================================
// Local Storage
// ============================================================================

struct StoredEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// TTL-bounded local key-value store.
struct LocalStore {
    entries: HashMap<Key, StoredEntry>,
}

impl LocalStore {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn put(&mut self, key: Key, value: Vec<u8>, ttl_secs: u64) -> bool {
        if value.len() > MAX_STORED_VALUE_SIZE {
            debug!(key = %key, len = value.len(), "store rejected: value too large");
            return false;
        }
        if self.entries.len() >= LOCAL_STORE_MAX_ENTRIES && !self.entries.contains_key(&key) {
            // Drop the entry closest to expiry to make room
            if let Some(evict) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| *k)
            {
                self.entries.remove(&evict);
            }
        }
        let ttl = ttl_secs.clamp(1, MAX_VALUE_TTL_SECS);
        self.entries.insert(
            key,
            StoredEntry {
                value,
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );
        true
    }

    /// Value plus remaining TTL in seconds; expired entries are purged lazily.
    fn get(&mut self, key: &Key) -> Option<(Vec<u8>, u64)> {
        let entry = self.entries.get(key)?;
        let now = Instant::now();
        if entry.expires_at <= now {
            self.entries.remove(key);
            return None;
        }
        let remaining = entry.expires_at.duration_since(now).as_secs().max(1);
        Some((entry.value.clone(), remaining))
    }

    fn sweep_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Command {
    Observe(NodeRecord, oneshot::Sender<Option<PendingEviction>>),
    ApplyPingResult(PendingEviction, bool),
    RemoveDead(NodeId),
    Closest(NodeId, usize, oneshot::Sender<Vec<NodeRecord>>),
    GetLocal(Key, oneshot::Sender<Option<(Vec<u8>, u64)>>),
    StoreLocal(Key, Vec<u8>, u64, oneshot::Sender<bool>),
    SweepStore(oneshot::Sender<usize>),
    Len(oneshot::Sender<usize>),
    Quit,
}

struct DhtActor {
    routing: RoutingTable,
    store: LocalStore,
    cmd_rx: mpsc::Receiver<Command>,
}

impl DhtActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Observe(record, reply) => {
                    let pending = self.routing.touch(record);
                    let _ = reply.send(pending);
                }
                Command::ApplyPingResult(pending, alive) => {
                    self.routing.apply_ping_result(pending, alive);
                }
                Command::RemoveDead(id) => {
                    self.routing.remove(&id);
                }
                Command::Closest(target, n, reply) => {
                    let _ = reply.send(self.routing.closest(&target, n));
                }
                Command::GetLocal(key, reply) => {
                    let _ = reply.send(self.store.get(&key));
                }
                Command::StoreLocal(key, value, ttl, reply) => {
                    let _ = reply.send(self.store.put(key, value, ttl));
                }
                Command::SweepStore(reply) => {
                    let _ = reply.send(self.store.sweep_expired());
                }
                Command::Len(reply) => {
                    let _ = reply.send(self.routing.len());
                }
                Command::Quit => {
                    debug!("DHT actor shutting down");
                    break;
                }
            }
        }
    }
}

// ============================================================================
// DhtNode Handle
// ============================================================================

pub struct DhtNode<N: DhtRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: NodeId,
    self_record: NodeRecord,
    network: Arc<N>,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            self_record: self.self_record.clone(),
            network: self.network.clone(),
        }
    }
}

impl<N: DhtRpc + 'static> DhtNode<N> {
    pub fn new(id: NodeId, self_addr: String, network: N) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(DHT_COMMAND_CHANNEL_SIZE);
        let actor = DhtActor {
            routing: RoutingTable::new(id, K),
            store: LocalStore::new(),
            cmd_rx,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            id,
            self_record: NodeRecord::new(id, self_addr),
            network: Arc::new(network),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn self_record(&self) -> NodeRecord {
        self.self_record.clone()
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Observe a contact. If the bucket is full, the oldest contact is pinged
    /// in the background and evicted only on probe failure.
    pub async fn observe_record(&self, record: NodeRecord) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Observe(record, tx)).await.is_err() {
            return;
        }
        let Some(pending) = rx.await.ok().flatten() else {
            return;
        };
        let node = self.clone();
        tokio::spawn(async move {
            let alive = tokio::time::timeout(
                EVICTION_PING_TIMEOUT,
                node.network.ping(&pending.oldest),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
            trace!(
                oldest = %pending.oldest.id,
                candidate = %pending.candidate.id,
                alive,
                "eviction liveness probe completed"
            );
            let _ = node
                .cmd_tx
                .send(Command::ApplyPingResult(pending, alive))
                .await;
        });
    }

    pub async fn routing_len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Len(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn closest_known(&self, target: &NodeId, n: usize) -> Vec<NodeRecord> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Closest(*target, n, tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn store_local(&self, key: Key, value: Vec<u8>, ttl_secs: u64) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::StoreLocal(key, value, ttl_secs, tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    async fn get_local(&self, key: &Key) -> Option<(Vec<u8>, u64)> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetLocal(*key, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Purge expired stored values. Single-iteration entry point.
    pub async fn sweep_store_once(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::SweepStore(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    /// Bootstrap into the network via a seed record by looking up our own id.
    pub async fn bootstrap(&self, seed: NodeRecord) -> Result<Vec<NodeRecord>> {
        self.observe_record(seed.clone()).await;
        self.lookup_nodes_seeded(self.id, Some(seed)).await
    }

    /// Iterative FIND_NODE convergence toward `target`.
    pub async fn lookup_nodes(&self, target: NodeId) -> Result<Vec<NodeRecord>> {
        self.lookup_nodes_seeded(target, None).await
    }

    async fn lookup_nodes_seeded(
        &self,
        target: NodeId,
        seed: Option<NodeRecord>,
    ) -> Result<Vec<NodeRecord>> {
        let lookup_start = Instant::now();
        let mut shortlist = self.closest_known(&target, K).await;
        if let Some(seed) = seed {
            if seed.id != self.id && !shortlist.iter().any(|r| r.id == seed.id) {
                shortlist.push(seed);
            }
        }

        let mut seen: HashSet<NodeId> = shortlist.iter().map(|r| r.id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut best_distance = shortlist
            .first()
            .map(|r| r.id.xor_distance(&target))
            .unwrap_or([0xFF; 20]);

        for iteration in 0..MAX_LOOKUP_ITERATIONS {
            if lookup_start.elapsed() > LOOKUP_TOTAL_TIMEOUT {
                debug!(
                    target = %target,
                    iteration,
                    found = shortlist.len(),
                    "lookup timeout, returning current results"
                );
                break;
            }

            let candidates: Vec<NodeRecord> = shortlist
                .iter()
                .filter(|r| !queried.contains(&r.id) && r.id != self.id)
                .take(ALPHA)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.id);
            }

            let mut join_set = JoinSet::new();
            for record in candidates {
                let network = self.network.clone();
                join_set.spawn(async move {
                    let result = tokio::time::timeout(
                        PER_QUERY_TIMEOUT,
                        network.find_node(&record, target),
                    )
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("query timeout")));
                    (record, result)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let Ok((record, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(nodes) => {
                        self.observe_record(record).await;
                        for node in nodes {
                            if node.id == self.id {
                                continue;
                            }
                            self.observe_record(node.clone()).await;
                            if seen.insert(node.id) {
                                shortlist.push(node);
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %record.id, error = %e, "lookup query failed");
                        let _ = self.cmd_tx.send(Command::RemoveDead(record.id)).await;
                    }
                }
            }

            shortlist.sort_by(|a, b| {
                let da = a.id.xor_distance(&target);
                let db = b.id.xor_distance(&target);
                distance_cmp(&da, &db)
            });
            shortlist.truncate(K);

            let any_closer = shortlist
                .first()
                .map(|r| {
                    let d = r.id.xor_distance(&target);
                    if distance_cmp(&d, &best_distance) == std::cmp::Ordering::Less {
                        best_distance = d;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);

            if !any_closer {
                break;
            }
        }

        debug!(target = %target, found = shortlist.len(), queried = queried.len(), "iterative lookup completed");
        Ok(shortlist)
    }

    /// Answer an inbound FIND_NODE: the k closest known records.
    pub async fn handle_find_node(&self, from: NodeRecord, target: NodeId) -> Vec<NodeRecord> {
        self.observe_record(from).await;
        self.closest_known(&target, K).await
    }

    /// Answer an inbound FIND_VALUE: local storage first, else closer nodes.
    pub async fn handle_find_value(
        &self,
        from: NodeRecord,
        key: Key,
    ) -> (Option<(Vec<u8>, u64)>, Vec<NodeRecord>) {
        self.observe_record(from).await;
        if let Some(found) = self.get_local(&key).await {
            return (Some(found), Vec::new());
        }
        (None, self.closest_known(&key, K).await)
    }

    /// Answer an inbound STORE.
    pub async fn handle_store(&self, from: NodeRecord, key: Key, value: Vec<u8>, ttl_secs: u64) -> bool {
        self.observe_record(from).await;
        self.store_local(key, value, ttl_secs).await
    }

    /// Answer an inbound PING.
    pub async fn handle_ping(&self, from: NodeRecord) {
        self.observe_record(from).await;
    }

    /// Store a value: locally first, then best-effort parallel replication
    /// to the k closest nodes.
    pub async fn put(&self, key: Key, value: Vec<u8>, ttl_secs: u64) -> Result<usize> {
        if !self.store_local(key, value.clone(), ttl_secs).await {
            anyhow::bail!("local store rejected value for {}", key);
        }

        let closest = self.lookup_nodes(key).await?;
        let mut join_set = JoinSet::new();
        for record in closest.into_iter().take(K) {
            let network = self.network.clone();
            let value = value.clone();
            join_set.spawn(async move {
                tokio::time::timeout(
                    PER_QUERY_TIMEOUT,
                    network.store(&record, key, value, ttl_secs),
                )
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false)
            });
        }

        let mut replicated = 0usize;
        while let Some(joined) = join_set.join_next().await {
            if matches!(joined, Ok(true)) {
                replicated += 1;
            }
        }
        debug!(key = %key, replicated, "store fan-out completed");
        Ok(replicated)
    }

    /// Retrieve a value: local storage first, then iterative lookup.
    /// Values found remotely are cached locally with their remaining TTL.
    pub async fn get(&self, key: Key) -> Result<Option<Vec<u8>>> {
        if let Some((value, _)) = self.get_local(&key).await {
            return Ok(Some(value));
        }

        let lookup_start = Instant::now();
        let mut shortlist = self.closest_known(&key, K).await;
        let mut seen: HashSet<NodeId> = shortlist.iter().map(|r| r.id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();

        for _ in 0..MAX_LOOKUP_ITERATIONS {
            if lookup_start.elapsed() > LOOKUP_TOTAL_TIMEOUT {
                break;
            }
            let candidates: Vec<NodeRecord> = shortlist
                .iter()
                .filter(|r| !queried.contains(&r.id) && r.id != self.id)
                .take(ALPHA)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.id);
            }

            let mut join_set = JoinSet::new();
            for record in candidates {
                let network = self.network.clone();
                join_set.spawn(async move {
                    let result = tokio::time::timeout(
                        PER_QUERY_TIMEOUT,
                        network.find_value(&record, key),
                    )
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("query timeout")));
                    (record, result)
                });
            }

            let mut found: Option<(Vec<u8>, u64)> = None;
            while let Some(joined) = join_set.join_next().await {
                let Ok((record, result)) = joined else {
                    continue;
                };
                match result {
                    Ok((Some(value_ttl), _)) => {
                        self.observe_record(record).await;
                        if found.is_none() {
                            found = Some(value_ttl);
                        }
                    }
                    Ok((None, closer)) => {
                        self.observe_record(record).await;
                        for node in closer {
                            if node.id != self.id && seen.insert(node.id) {
                                shortlist.push(node);
                            }
                        }
                    }
                    Err(_) => {
                        let _ = self.cmd_tx.send(Command::RemoveDead(record.id)).await;
                    }
                }
            }

            if let Some((value, ttl)) = found {
                // Cache remote hit locally with its remaining TTL
                self.store_local(key, value.clone(), ttl).await;
                return Ok(Some(value));
            }

            shortlist.sort_by(|a, b| {
                let da = a.id.xor_distance(&key);
                let db = b.id.xor_distance(&key);
                distance_cmp(&da, &db)
            });
            shortlist.truncate(K);
        }

        Ok(None)
    }
}
