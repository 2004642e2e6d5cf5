// Coordination-store schema and the typed operations issued against it.
//
// The store holds three kinds of state:
//   - `conn:<id>`: connection metadata, JSON, with a millisecond TTL;
//   - `channel:{<node>}:[backend:]<channel>`: sorted sets of subscribers,
//     scored by last-renewal epoch-nanoseconds; members are the MessagePack
//     encoding of the connection record;
//   - `sub:0..sub:N-1`: pub/sub channels used to flood publishes to every
//     node in the cluster.
//
// The `{<node>}` hash-tag keeps all of one node's channel keys on a single
// shard, so scans and cleanups for a node are single-shard operations.
use async_trait::async_trait;
use heron_conn::{Conn, ConnId, Envelope};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub mod bus;
pub mod mem;
pub mod redis_store;
pub mod sweeper;

pub use mem::MemStore;
pub use redis_store::RedisStore;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("store transport: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("member codec: {0}")]
    Member(#[from] heron_conn::Error),
    #[error("envelope codec: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("sub-conn-count mismatch: cluster recorded {recorded}, this node configured {configured}")]
    SubCountMismatch { recorded: usize, configured: usize },
}

/// Key holding the cluster-wide broadcast channel count. Every node checks
/// its configured count against this at startup and refuses to run on a
/// mismatch, since differing counts would duplicate or drop publishes.
pub const SUB_COUNT_KEY: &str = "sub:count";

pub(crate) fn conn_key(id: &ConnId) -> String {
    format!("conn:{id}")
}

pub(crate) fn channel_key(node: &str, channel: &str, backend: bool) -> String {
    if backend {
        format!("channel:{{{node}}}:backend:{channel}")
    } else {
        format!("channel:{{{node}}}:{channel}")
    }
}

// Scan pattern for one half of the channel keyspace. The frontend pattern
// also matches backend keys; callers that care filter on the marker.
pub(crate) fn channel_pattern(backend: bool) -> String {
    channel_key("*", "*", backend)
}

pub(crate) fn sub_key(index: usize) -> String {
    format!("sub:{index}")
}

/// Extracts the `{<node>}` hash-tag from a channel key.
pub(crate) fn node_of_key(key: &str) -> Option<&str> {
    let start = key.find('{')?;
    let end = key[start..].find('}')? + start;
    Some(&key[start + 1..end])
}

pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Typed operations over the external coordination store.
///
/// `RedisStore` is the production implementation; `MemStore` provides the
/// same semantics in process for tests and demos.
#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert the connection record under `conn:<id>` with the given TTL.
    async fn set_conn(&self, conn: &Conn, ttl: Duration) -> Result<()>;

    /// Delete the connection record immediately.
    async fn unset_conn(&self, conn: &Conn) -> Result<()>;

    /// Fetch a connection record, or `None` if absent or expired.
    async fn get_conn(&self, id: &ConnId) -> Result<Option<Conn>>;

    /// Add `conn` to the channel's subscriber set with score = now-ns.
    async fn subscribe(&self, conn: &Conn, channel: &str) -> Result<()>;

    /// Remove `conn` from the channel's subscriber set.
    async fn unsubscribe(&self, conn: &Conn, channel: &str) -> Result<()>;

    /// Subscribers of `channel` on `node` whose score is within `window`.
    async fn get_subscribed(
        &self,
        node: &str,
        channel: &str,
        backend: bool,
        window: Duration,
    ) -> Result<Vec<Conn>>;

    /// All channel keys for the frontend or backend half of the keyspace.
    async fn scan_channels(&self, backend: bool) -> Result<Vec<String>>;

    /// De-duplicated set of node ids extracted from channel keys.
    async fn get_node_ids(&self) -> Result<Vec<String>>;

    /// Drop subscriber-set members whose score is older than `window`.
    async fn clean_channels(&self, backend: bool, window: Duration) -> Result<()>;

    /// Flood an envelope to every node via one of the `sub:<i>` channels.
    async fn broadcast(&self, envelope: &Envelope) -> Result<()>;

    /// Open a listener session on `sub:<index>`. The returned receiver ends
    /// when the session dies; the caller owns reconnection.
    async fn listen(&self, index: usize) -> Result<mpsc::Receiver<Envelope>>;

    /// The configured broadcast channel count N.
    fn sub_conn_count(&self) -> usize;

    /// Record N cluster-wide, failing fast if another node recorded a
    /// different value.
    async fn ensure_sub_count(&self) -> Result<()>;
}
