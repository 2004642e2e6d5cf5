// Gateway node entry point.
use anyhow::{Context, Result};
use clap::Parser;
use gateway::config::{Args, listen_config};
use gateway::observability::{init_observability, serve_metrics};
use gateway::{CONN_TTL, Gateway, http};
use heron_auth::Signer;
use heron_conn::random_node_id;
use heron_distr::{RedisStore, Store};
use heron_router::Router;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let metrics_handle = init_observability();

    let (bind_addr, path_prefix) = listen_config(&args.ws_url)?;

    // One node id per process; it prefixes every connection id we mint and
    // hash-tags every channel key we write.
    let node_id = random_node_id();

    tracing::info!(addr = %args.redis_addr, pool_size = args.redis_pool_size, "connecting to redis");
    let store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(
            &args.redis_addr,
            args.redis_pool_size,
            args.redis_num_sub_conns,
        )
        .await
        .context("error connecting to redis")?,
    );
    store
        .ensure_sub_count()
        .await
        .context("sub-conn-count disagreement with the cluster")?;

    let router = Arc::new(Router::new(node_id.clone(), CONN_TTL));
    let gateway = Arc::new(Gateway::new(
        Arc::clone(&store),
        Arc::clone(&router),
        Signer::new(&args.auth_secret),
    ));

    // Fan-out plumbing: bus listeners feed the delivery queue, the drain
    // pool moves envelopes onto local mailboxes, the sweeper reaps entries
    // left behind by dead nodes.
    let (delivery_tx, _drains) = heron_router::start_drains(
        Arc::clone(&router),
        Arc::clone(&store),
        args.redis_num_sub_conns,
    );
    let _listeners = heron_distr::bus::start(Arc::clone(&store), delivery_tx);
    tokio::spawn(heron_distr::sweeper::run(Arc::clone(&store), CONN_TTL));

    tokio::spawn(serve_metrics(metrics_handle, args.metrics_addr));

    let app = http::app_with_prefix(gateway, &path_prefix);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("could not listen on {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, prefix = %path_prefix, node = %node_id, "websocket interface listening");
    axum::serve(listener, app)
        .await
        .context("websocket interface failed")?;
    Ok(())
}
