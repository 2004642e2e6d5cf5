// Node-local delivery table and cluster fan-out.
//
// The router maps connection ids to mailboxes. Mutations (admission,
// teardown) take the write lock; fan-out takes the read lock for lookup
// only. A mailbox is a bounded queue plus a close signal, and enqueueing is
// never allowed to block: a full mailbox drops the envelope. One slow
// consumer must not stall cluster-wide fan-out.
use heron_conn::{ConnId, Envelope};
use heron_distr::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;

/// Bounded mailbox depth per connection.
pub const MAILBOX_CAPACITY: usize = 10;

// Per-drain-worker queue depth between the dispatcher and fan-out.
const DRAIN_QUEUE_DEPTH: usize = 64;

/// Outcome of a non-blocking mailbox enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The close signal fired first; dropped silently.
    Closing,
    /// Buffer full; dropped and logged.
    Dropped,
}

struct MailboxHandle {
    tx: mpsc::Sender<Envelope>,
    closed: watch::Receiver<bool>,
}

/// The worker-side end of a mailbox. Closing it tells every enqueue site to
/// stop before the map entry is removed.
pub struct Registration {
    envelopes: mpsc::Receiver<Envelope>,
    closed: watch::Sender<bool>,
}

impl Registration {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.envelopes.recv().await
    }

    pub fn close(&self) {
        let _ = self.closed.send(true);
    }
}

pub struct Router {
    node_id: String,
    // Liveness window used for subscriber lookups.
    window: Duration,
    conns: RwLock<HashMap<ConnId, MailboxHandle>>,
}

impl Router {
    pub fn new(node_id: impl Into<String>, window: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            window,
            conns: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Admit a connection: create its mailbox and hand back the worker end.
    pub async fn register(&self, id: ConnId) -> Registration {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);
        let mut conns = self.conns.write().await;
        conns.insert(
            id,
            MailboxHandle {
                tx,
                closed: closed_rx,
            },
        );
        Registration {
            envelopes: rx,
            closed: closed_tx,
        }
    }

    pub async fn deregister(&self, id: &ConnId) {
        let mut conns = self.conns.write().await;
        conns.remove(id);
    }

    pub async fn is_registered(&self, id: &ConnId) -> bool {
        self.conns.read().await.contains_key(id)
    }

    /// Enqueue onto a local mailbox. `None` means the connection is not
    /// hosted here (or already tore down): the caller skips it.
    pub async fn deliver(&self, id: &ConnId, envelope: Envelope) -> Option<Delivery> {
        let conns = self.conns.read().await;
        let handle = conns.get(id)?;
        if *handle.closed.borrow() {
            return Some(Delivery::Closing);
        }
        match handle.tx.try_send(envelope) {
            Ok(()) => Some(Delivery::Accepted),
            Err(TrySendError::Full(_)) => {
                metrics::counter!("heron_fanout_dropped_total").increment(1);
                tracing::error!(conn = %id, "mailbox full, dropping envelope");
                Some(Delivery::Dropped)
            }
            Err(TrySendError::Closed(_)) => Some(Delivery::Closing),
        }
    }

    /// Fan one envelope out to this node's subscribers of its channel.
    ///
    /// The lookup is inverted: a backend-originated publish seeks frontend
    /// subscribers and vice versa, which is what keeps publishers from
    /// hearing themselves and backends from echoing each other.
    pub async fn fan_out(&self, store: &dyn Store, envelope: &Envelope) {
        let want_backend = !envelope.conn.is_backend;
        let subscribed = match store
            .get_subscribed(&self.node_id, &envelope.channel, want_backend, self.window)
            .await
        {
            Ok(subscribed) => subscribed,
            Err(err) => {
                tracing::error!(channel = %envelope.channel, error = %err, "subscriber lookup failed");
                return;
            }
        };
        for target in subscribed {
            if let Some(Delivery::Accepted) = self.deliver(&target.id, envelope.clone()).await {
                metrics::counter!("heron_delivered_total").increment(1);
            }
        }
    }
}

/// Start the drain pool: `workers` tasks fanning envelopes out in parallel,
/// fed round-robin from the returned delivery queue. The broadcast bus
/// publishes into that queue.
pub fn start_drains(
    router: Arc<Router>,
    store: Arc<dyn Store>,
    workers: usize,
) -> (mpsc::Sender<Envelope>, Vec<JoinHandle<()>>) {
    let (delivery_tx, mut delivery_rx) =
        mpsc::channel(heron_distr::bus::DELIVERY_QUEUE_DEPTH);
    let mut worker_txs = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..workers.max(1) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(DRAIN_QUEUE_DEPTH);
        let router = Arc::clone(&router);
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                router.fan_out(store.as_ref(), &envelope).await;
            }
        }));
        worker_txs.push(tx);
    }
    handles.push(tokio::spawn(async move {
        let mut next = 0usize;
        while let Some(envelope) = delivery_rx.recv().await {
            let tx = &worker_txs[next % worker_txs.len()];
            next = next.wrapping_add(1);
            if tx.send(envelope).await.is_err() {
                return;
            }
        }
    }));
    (delivery_tx, handles)
}
