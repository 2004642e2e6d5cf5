// Gateway node: terminates websocket and HTTP traffic and bridges it onto
// the cluster-wide pub/sub fabric.
use heron_auth::Signer;
use heron_distr::Store;
use heron_router::Router;
use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod http;
pub mod observability;
pub mod worker;

/// Liveness window for connection metadata and subscription scores.
pub const CONN_TTL: Duration = Duration::from_secs(30);

/// Shared state handed to every request handler and connection worker.
pub struct Gateway {
    pub store: Arc<dyn Store>,
    pub router: Arc<Router>,
    pub signer: Signer,
    pub conn_ttl: Duration,
}

impl Gateway {
    pub fn new(store: Arc<dyn Store>, router: Arc<Router>, signer: Signer) -> Self {
        Self {
            store,
            router,
            signer,
            conn_ttl: CONN_TTL,
        }
    }

    // Shorter TTLs make liveness-window behavior testable.
    pub fn with_conn_ttl(mut self, ttl: Duration) -> Self {
        self.conn_ttl = ttl;
        self
    }
}
