// Broadcast bus: N listener sessions pumping envelopes from the store's
// pub/sub channels onto one shared delivery queue.
//
// Each session owns its own transport. Any receive or decode failure kills
// the session; the loop here sleeps a second and dials again from scratch.
// Envelopes in flight during the outage are lost, which is acceptable under
// best-effort semantics.
use crate::Store;
use heron_conn::Envelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Depth of the shared delivery queue the router drains.
pub const DELIVERY_QUEUE_DEPTH: usize = 1000;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Start one listener task per broadcast channel. All of them feed
/// `delivery`; the tasks run until the delivery queue is closed.
pub fn start(store: Arc<dyn Store>, delivery: mpsc::Sender<Envelope>) -> Vec<JoinHandle<()>> {
    (0..store.sub_conn_count())
        .map(|index| {
            let store = Arc::clone(&store);
            let delivery = delivery.clone();
            tokio::spawn(run_listener(store, index, delivery))
        })
        .collect()
}

async fn run_listener(store: Arc<dyn Store>, index: usize, delivery: mpsc::Sender<Envelope>) {
    loop {
        match store.listen(index).await {
            Ok(mut session) => {
                tracing::info!(index, "broadcast listener started");
                while let Some(envelope) = session.recv().await {
                    metrics::counter!("heron_bus_envelopes_total").increment(1);
                    if delivery.send(envelope).await.is_err() {
                        // Delivery queue closed: the node is shutting down.
                        return;
                    }
                }
                tracing::error!(index, "broadcast listener disconnected");
            }
            Err(err) => {
                tracing::error!(index, error = %err, "could not start broadcast listener");
            }
        }
        metrics::counter!("heron_bus_reconnects_total").increment(1);
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
