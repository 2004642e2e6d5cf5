// Redis-backed store adapter.
//
// At connect time the adapter probes `CLUSTER INFO` and picks the transport:
// a small pool of multiplexed connections against a single instance, or a
// cluster connection when the target reports cluster mode. The key schema is
// identical either way; the `{node}` hash-tags keep per-node scans on one
// shard.
use crate::{
    Error, Result, Store, SUB_COUNT_KEY, channel_pattern, conn_key, now_ns, sub_key,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use heron_conn::{Conn, ConnId, Envelope};
use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{FromRedisValue, cmd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

const SCAN_BATCH: usize = 100;
const LISTEN_PIPE_CAPACITY: usize = 64;

enum Cmder {
    Single {
        pool: Vec<MultiplexedConnection>,
        next: AtomicUsize,
    },
    Cluster(ClusterConnection),
}

impl Cmder {
    async fn query<T: FromRedisValue>(&self, command: &redis::Cmd) -> redis::RedisResult<T> {
        match self {
            Cmder::Single { pool, next } => {
                let index = next.fetch_add(1, Ordering::Relaxed) % pool.len();
                let mut conn = pool[index].clone();
                command.query_async(&mut conn).await
            }
            Cmder::Cluster(conn) => {
                let mut conn = conn.clone();
                command.query_async(&mut conn).await
            }
        }
    }
}

pub struct RedisStore {
    // Kept for opening fresh subscriber transports in `listen`.
    client: redis::Client,
    cmder: Cmder,
    sub_conns: usize,
}

impl RedisStore {
    /// Connect to the store at `addr` (host:port). `pool_size` bounds the
    /// command connections against a single instance; `sub_conns` is the
    /// cluster-wide broadcast channel count N.
    pub async fn connect(addr: &str, pool_size: usize, sub_conns: usize) -> Result<Self> {
        let url = format!("redis://{addr}");
        let client = redis::Client::open(url.as_str())?;
        let mut probe = client.get_multiplexed_async_connection().await?;

        // `CLUSTER INFO` works on standalone instances too; treat a refused
        // command the same as cluster mode being off.
        let info: Option<String> = cmd("CLUSTER")
            .arg("INFO")
            .query_async(&mut probe)
            .await
            .ok();
        let clustered = info
            .map(|text| text.contains("cluster_enabled:1"))
            .unwrap_or(false);

        let cmder = if clustered {
            tracing::info!(addr, "store is a cluster");
            let cluster = ClusterClient::new(vec![url.as_str()])?;
            Cmder::Cluster(cluster.get_async_connection().await?)
        } else {
            tracing::info!(addr, pool_size, "store is a single instance");
            let mut pool = vec![probe];
            for _ in 1..pool_size.max(1) {
                pool.push(client.get_multiplexed_async_connection().await?);
            }
            Cmder::Single {
                pool,
                next: AtomicUsize::new(0),
            }
        };

        Ok(Self {
            client,
            cmder,
            sub_conns,
        })
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .cmder
                .query(
                    cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn set_conn(&self, conn: &Conn, ttl: Duration) -> Result<()> {
        let body = serde_json::to_vec(conn)?;
        self.cmder
            .query::<()>(
                cmd("PSETEX")
                    .arg(conn_key(&conn.id))
                    .arg(ttl.as_millis() as u64)
                    .arg(body),
            )
            .await?;
        Ok(())
    }

    async fn unset_conn(&self, conn: &Conn) -> Result<()> {
        self.cmder
            .query::<()>(cmd("DEL").arg(conn_key(&conn.id)))
            .await?;
        Ok(())
    }

    async fn get_conn(&self, id: &ConnId) -> Result<Option<Conn>> {
        let body: Option<Vec<u8>> = self.cmder.query(cmd("GET").arg(conn_key(id))).await?;
        match body {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }

    async fn subscribe(&self, conn: &Conn, channel: &str) -> Result<()> {
        let key = crate::channel_key(conn.id.node(), channel, conn.is_backend);
        self.cmder
            .query::<()>(
                cmd("ZADD")
                    .arg(key)
                    .arg(now_ns())
                    .arg(conn.encode_member()?),
            )
            .await?;
        Ok(())
    }

    async fn unsubscribe(&self, conn: &Conn, channel: &str) -> Result<()> {
        let key = crate::channel_key(conn.id.node(), channel, conn.is_backend);
        self.cmder
            .query::<()>(cmd("ZREM").arg(key).arg(conn.encode_member()?))
            .await?;
        Ok(())
    }

    async fn get_subscribed(
        &self,
        node: &str,
        channel: &str,
        backend: bool,
        window: Duration,
    ) -> Result<Vec<Conn>> {
        let key = crate::channel_key(node, channel, backend);
        let bound = now_ns() - window.as_nanos() as i64;
        let members: Vec<Vec<u8>> = self
            .cmder
            .query(cmd("ZRANGEBYSCORE").arg(key).arg(bound).arg("+inf"))
            .await?;
        let mut subscribed = Vec::with_capacity(members.len());
        for member in &members {
            match Conn::decode_member(member) {
                Ok(conn) => subscribed.push(conn),
                Err(err) => tracing::warn!(error = %err, "undecodable channel-set member"),
            }
        }
        Ok(subscribed)
    }

    async fn scan_channels(&self, backend: bool) -> Result<Vec<String>> {
        self.scan(&channel_pattern(backend)).await
    }

    async fn get_node_ids(&self) -> Result<Vec<String>> {
        let keys = self.scan(&channel_pattern(false)).await?;
        let mut seen = std::collections::HashSet::new();
        let mut nodes = Vec::new();
        for key in &keys {
            if let Some(node) = crate::node_of_key(key) {
                if seen.insert(node.to_string()) {
                    nodes.push(node.to_string());
                }
            }
        }
        Ok(nodes)
    }

    async fn clean_channels(&self, backend: bool, window: Duration) -> Result<()> {
        let bound = now_ns() - window.as_nanos() as i64;
        // Exclusive upper bound: strictly-older members only.
        let upper = format!("({bound}");
        for key in self.scan(&channel_pattern(backend)).await? {
            let result = self
                .cmder
                .query::<i64>(cmd("ZREMRANGEBYSCORE").arg(&key).arg("-inf").arg(&upper))
                .await;
            if let Err(err) = result {
                tracing::error!(key, backend, error = %err, "error cleaning channel");
            }
        }
        Ok(())
    }

    async fn broadcast(&self, envelope: &Envelope) -> Result<()> {
        let body = serde_json::to_vec(envelope)?;
        let index = rand::thread_rng().gen_range(0..self.sub_conns.max(1));
        self.cmder
            .query::<()>(cmd("PUBLISH").arg(sub_key(index)).arg(body))
            .await?;
        Ok(())
    }

    async fn listen(&self, index: usize) -> Result<mpsc::Receiver<Envelope>> {
        // Each listener gets a dedicated transport so a dead session can be
        // torn down and re-dialed without touching command traffic.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(sub_key(index)).await?;

        let (tx, rx) = mpsc::channel(LISTEN_PIPE_CAPACITY);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::error!(index, error = %err, "error receiving broadcast");
                        return;
                    }
                };
                let envelope: Envelope = match serde_json::from_slice(&payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::error!(index, error = %err, "error decoding broadcast");
                        return;
                    }
                };
                if tx.send(envelope).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn sub_conn_count(&self) -> usize {
        self.sub_conns
    }

    async fn ensure_sub_count(&self) -> Result<()> {
        let set: Option<String> = self
            .cmder
            .query(
                cmd("SET")
                    .arg(SUB_COUNT_KEY)
                    .arg(self.sub_conns)
                    .arg("NX"),
            )
            .await?;
        if set.is_some() {
            return Ok(());
        }
        let recorded: Option<usize> = self.cmder.query(cmd("GET").arg(SUB_COUNT_KEY)).await?;
        match recorded {
            Some(recorded) if recorded == self.sub_conns => Ok(()),
            Some(recorded) => Err(Error::SubCountMismatch {
                recorded,
                configured: self.sub_conns,
            }),
            // Raced with an expiring key; the next node to start will check
            // against the value we just failed to observe.
            None => Ok(()),
        }
    }
}
