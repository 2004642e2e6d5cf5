// In-process store with the same TTL, score, and broadcast semantics as the
// redis adapter. Used by tests and demos; never by a deployed node.
use crate::{Error, Result, Store, channel_key, node_of_key, now_ns};
use async_trait::async_trait;
use heron_conn::{Conn, ConnId, Envelope};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

const BUS_CAPACITY: usize = 1024;
const LISTEN_PIPE_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct MemStore {
    // conn:<id> -> record + expiry.
    conns: Mutex<HashMap<String, (Conn, Instant)>>,
    // channel key -> member bytes -> score (epoch ns).
    channels: Mutex<HashMap<String, HashMap<Vec<u8>, i64>>>,
    // Broadcast fabric: every envelope is tagged with the sub-channel index
    // it was published on, so each listener sees its own channel only.
    bus: broadcast::Sender<(usize, Envelope)>,
    sub_conns: usize,
    recorded_sub_count: Mutex<Option<usize>>,
}

impl MemStore {
    pub fn new(sub_conns: usize) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            conns: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            bus,
            sub_conns,
            recorded_sub_count: Mutex::new(None),
        }
    }

    fn matching_keys(&self, backend: bool) -> Vec<String> {
        let channels = self.channels.lock().expect("channels lock");
        channels
            .keys()
            .filter(|key| key_matches(key, backend))
            .cloned()
            .collect()
    }
}

// Mirrors the scan patterns: the frontend pattern matches every channel key,
// the backend pattern only keys with the `backend:` marker after the tag.
fn key_matches(key: &str, backend: bool) -> bool {
    if !key.starts_with("channel:{") {
        return false;
    }
    if !backend {
        return true;
    }
    key.split_once('}')
        .map(|(_, rest)| rest.starts_with(":backend:"))
        .unwrap_or(false)
}

#[async_trait]
impl Store for MemStore {
    async fn set_conn(&self, conn: &Conn, ttl: Duration) -> Result<()> {
        let mut conns = self.conns.lock().expect("conns lock");
        conns.insert(
            crate::conn_key(&conn.id),
            (conn.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn unset_conn(&self, conn: &Conn) -> Result<()> {
        let mut conns = self.conns.lock().expect("conns lock");
        conns.remove(&crate::conn_key(&conn.id));
        Ok(())
    }

    async fn get_conn(&self, id: &ConnId) -> Result<Option<Conn>> {
        let mut conns = self.conns.lock().expect("conns lock");
        let key = crate::conn_key(id);
        match conns.get(&key) {
            Some((conn, expires_at)) if *expires_at > Instant::now() => Ok(Some(conn.clone())),
            Some(_) => {
                conns.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn subscribe(&self, conn: &Conn, channel: &str) -> Result<()> {
        let member = conn.encode_member()?;
        let key = channel_key(conn.id.node(), channel, conn.is_backend);
        let mut channels = self.channels.lock().expect("channels lock");
        channels.entry(key).or_default().insert(member, now_ns());
        Ok(())
    }

    async fn unsubscribe(&self, conn: &Conn, channel: &str) -> Result<()> {
        let member = conn.encode_member()?;
        let key = channel_key(conn.id.node(), channel, conn.is_backend);
        let mut channels = self.channels.lock().expect("channels lock");
        if let Some(set) = channels.get_mut(&key) {
            set.remove(&member);
            if set.is_empty() {
                channels.remove(&key);
            }
        }
        Ok(())
    }

    async fn get_subscribed(
        &self,
        node: &str,
        channel: &str,
        backend: bool,
        window: Duration,
    ) -> Result<Vec<Conn>> {
        let bound = now_ns() - window.as_nanos() as i64;
        let channels = self.channels.lock().expect("channels lock");
        let Some(set) = channels.get(&channel_key(node, channel, backend)) else {
            return Ok(Vec::new());
        };
        let mut subscribed = Vec::new();
        for (member, score) in set {
            if *score < bound {
                continue;
            }
            match Conn::decode_member(member) {
                Ok(conn) => subscribed.push(conn),
                Err(err) => tracing::warn!(error = %err, "undecodable channel-set member"),
            }
        }
        Ok(subscribed)
    }

    async fn scan_channels(&self, backend: bool) -> Result<Vec<String>> {
        Ok(self.matching_keys(backend))
    }

    async fn get_node_ids(&self) -> Result<Vec<String>> {
        let channels = self.channels.lock().expect("channels lock");
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for key in channels.keys() {
            if let Some(node) = node_of_key(key) {
                if seen.insert(node.to_string()) {
                    nodes.push(node.to_string());
                }
            }
        }
        Ok(nodes)
    }

    async fn clean_channels(&self, backend: bool, window: Duration) -> Result<()> {
        let bound = now_ns() - window.as_nanos() as i64;
        let mut channels = self.channels.lock().expect("channels lock");
        channels.retain(|key, set| {
            if !key_matches(key, backend) {
                return true;
            }
            set.retain(|_, score| *score >= bound);
            !set.is_empty()
        });
        Ok(())
    }

    async fn broadcast(&self, envelope: &Envelope) -> Result<()> {
        let index = rand::thread_rng().gen_range(0..self.sub_conns.max(1));
        // No listeners is fine; redis PUBLISH to zero subscribers succeeds.
        let _ = self.bus.send((index, envelope.clone()));
        Ok(())
    }

    async fn listen(&self, index: usize) -> Result<mpsc::Receiver<Envelope>> {
        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(LISTEN_PIPE_CAPACITY);
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok((i, envelope)) if i == index => {
                        if tx.send(envelope).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }

    fn sub_conn_count(&self) -> usize {
        self.sub_conns
    }

    async fn ensure_sub_count(&self) -> Result<()> {
        let mut recorded = self.recorded_sub_count.lock().expect("sub count lock");
        match *recorded {
            Some(count) if count != self.sub_conns => Err(Error::SubCountMismatch {
                recorded: count,
                configured: self.sub_conns,
            }),
            Some(_) => Ok(()),
            None => {
                *recorded = Some(self.sub_conns);
                Ok(())
            }
        }
    }
}
