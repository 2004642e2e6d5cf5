use anyhow::{Context, Result, bail};
use clap::Parser;
use std::net::SocketAddr;
use url::Url;

// Node configuration sourced from command-line flags.
#[derive(Parser, Debug)]
#[command(name = "heron-gateway", version, about = "Websocket pub/sub bus node")]
pub struct Args {
    /// Address and URL the websocket interface should listen on. The path is
    /// stripped as a prefix before dispatch. Only http is supported.
    #[arg(long, default_value = "http://0.0.0.0:4444/subs")]
    pub ws_url: String,

    /// Secret key used to verify connection presence information. Must be
    /// the same across all nodes and backend applications.
    #[arg(long)]
    pub auth_secret: String,

    /// Address of the redis node to use. If the node is in a cluster the
    /// rest of the cluster is discovered automatically.
    #[arg(long, default_value = "127.0.0.1:6379")]
    pub redis_addr: String,

    /// Number of command connections to make per redis instance.
    #[arg(long, default_value_t = 10)]
    pub redis_pool_size: usize,

    /// Number of connections used to receive publishes broadcast across the
    /// cluster. Must be identical on every node.
    #[arg(long, default_value_t = 10)]
    pub redis_num_sub_conns: usize,

    /// Prometheus metrics listener.
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_addr: SocketAddr,
}

/// Splits `--ws-url` into a bind address and the path prefix to strip.
pub fn listen_config(ws_url: &str) -> Result<(String, String)> {
    let url = Url::parse(ws_url).with_context(|| format!("could not parse --ws-url {ws_url}"))?;
    if url.scheme() != "http" {
        bail!("--ws-url only supports http, got {}", url.scheme());
    }
    let host = url
        .host_str()
        .with_context(|| format!("--ws-url {ws_url} has no host"))?;
    let port = url.port().unwrap_or(80);
    let mut path = url.path().to_string();
    if path.is_empty() {
        path = "/".to_string();
    }
    Ok((format!("{host}:{port}"), path))
}
