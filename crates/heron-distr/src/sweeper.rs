// Periodic cleanup of channel-set members left behind by nodes that died
// without running teardown. Bounds staleness to window + window/2.
use crate::Store;
use std::sync::Arc;
use std::time::Duration;

/// Runs forever; each tick sweeps the frontend half, then the backend half.
pub async fn run(store: Arc<dyn Store>, window: Duration) {
    let period = window / 2;
    let start = tokio::time::Instant::now() + period;
    let mut tick = tokio::time::interval_at(start, period);
    loop {
        tick.tick().await;
        for backend in [false, true] {
            if let Err(err) = store.clean_channels(backend, window).await {
                tracing::error!(backend, error = %err, "channel sweep failed");
            }
        }
        metrics::counter!("heron_sweeper_cycles_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;
    use heron_conn::Conn;

    #[tokio::test]
    async fn sweeper_evicts_members_from_dead_nodes() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new(1));
        let window = Duration::from_millis(100);

        // A connection on a node that will never renew.
        let conn = Conn::new("dead-node");
        store.subscribe(&conn, "ch").await.expect("subscribe");
        let mut backend = Conn::new("dead-node");
        backend.is_backend = true;
        store.subscribe(&backend, "ch").await.expect("subscribe");

        let sweeper = tokio::spawn(run(Arc::clone(&store), window));
        tokio::time::sleep(Duration::from_millis(300)).await;
        sweeper.abort();

        assert!(store.scan_channels(false).await.expect("scan").is_empty());
        assert!(store.scan_channels(true).await.expect("scan").is_empty());
        let remaining = store
            .get_subscribed("dead-node", "ch", false, window)
            .await
            .expect("get");
        assert!(remaining.is_empty());
    }
}
