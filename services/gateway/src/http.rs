// HTTP/websocket front door.
//
// `GET /<c1,c2>` with upgrade headers becomes a connection worker initially
// subscribed to the listed channels. `POST /<c1,c2>` publishes the JSON body
// on each channel. `GET /<c1,c2>/subbed` lists the cluster-wide subscribers
// and requires a backend principal.
use crate::{Gateway, worker};
use axum::Json;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use heron_conn::{Conn, Envelope};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Deserialize, Default)]
pub struct PresenceQuery {
    #[serde(default)]
    pub presence: String,
    #[serde(default)]
    pub sig: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubListRes {
    pub conns: Vec<Conn>,
}

/// Routes relative to the stripped `--ws-url` path prefix.
pub fn app(gateway: Arc<Gateway>) -> axum::Router {
    axum::Router::new()
        .route("/", get(ws_root).post(pub_root))
        .route("/{channels}", get(ws_handler).post(pub_handler))
        .route("/{channels}/subbed", get(subbed_handler))
        .with_state(gateway)
}

/// Mounts the front door under the configured path prefix.
pub fn app_with_prefix(gateway: Arc<Gateway>, prefix: &str) -> axum::Router {
    let inner = app(gateway);
    if prefix == "/" {
        inner
    } else {
        axum::Router::new().nest(prefix, inner)
    }
}

fn split_channels(segment: &str) -> Vec<String> {
    segment
        .split(',')
        .filter(|channel| !channel.is_empty())
        .map(str::to_string)
        .collect()
}

/// Builds the connection record for a request: fresh id on this node, the
/// declared presence if its signature verifies, backend iff the presence is
/// the literal `backend`.
fn conn_info(
    gateway: &Gateway,
    channels_segment: &str,
    query: &PresenceQuery,
) -> Result<(Conn, Vec<String>), (StatusCode, String)> {
    let channels = split_channels(channels_segment);
    let mut conn = Conn::new(gateway.router.node_id());
    if !query.presence.is_empty() {
        if !gateway.signer.verify(&query.sig, &query.presence) {
            return Err((StatusCode::BAD_REQUEST, "invalid signature".to_string()));
        }
        if query.presence == "backend" {
            conn.is_backend = true;
        } else {
            conn.presence = query.presence.clone();
        }
    }
    Ok((conn, channels))
}

async fn ws_root(
    state: State<Arc<Gateway>>,
    query: Query<PresenceQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    serve_ws(state, String::new(), query, ws).await
}

async fn ws_handler(
    state: State<Arc<Gateway>>,
    Path(channels): Path<String>,
    query: Query<PresenceQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    serve_ws(state, channels, query, ws).await
}

async fn serve_ws(
    State(gateway): State<Arc<Gateway>>,
    channels: String,
    Query(query): Query<PresenceQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match conn_info(&gateway, &channels, &query) {
        Ok((conn, channels)) => {
            ws.on_upgrade(move |socket| worker::run(gateway, socket, conn, channels))
        }
        Err(rejection) => rejection.into_response(),
    }
}

async fn pub_root(
    state: State<Arc<Gateway>>,
    query: Query<PresenceQuery>,
    body: Json<serde_json::Value>,
) -> Response {
    serve_pub(state, String::new(), query, body).await
}

async fn pub_handler(
    state: State<Arc<Gateway>>,
    Path(channels): Path<String>,
    query: Query<PresenceQuery>,
    body: Json<serde_json::Value>,
) -> Response {
    serve_pub(state, channels, query, body).await
}

async fn serve_pub(
    State(gateway): State<Arc<Gateway>>,
    channels: String,
    Query(query): Query<PresenceQuery>,
    Json(message): Json<serde_json::Value>,
) -> Response {
    let (conn, channels) = match conn_info(&gateway, &channels, &query) {
        Ok(parsed) => parsed,
        Err(rejection) => return rejection.into_response(),
    };
    for channel in &channels {
        let envelope = Envelope::publish(conn.clone(), channel.clone(), message.clone());
        if let Err(err) = gateway.store.broadcast(&envelope).await {
            tracing::error!(
                presence = %conn.presence,
                channel = %channel,
                error = %err,
                "publish failed"
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
        metrics::counter!("heron_publish_total").increment(1);
    }
    StatusCode::OK.into_response()
}

async fn subbed_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(channels): Path<String>,
    Query(query): Query<PresenceQuery>,
) -> Response {
    let (conn, channels) = match conn_info(&gateway, &channels, &query) {
        Ok(parsed) => parsed,
        Err(rejection) => return rejection.into_response(),
    };
    if !conn.is_backend {
        return (StatusCode::FORBIDDEN, "not allowed".to_string()).into_response();
    }
    match list_subbed(&gateway, &channels).await {
        Ok(conns) => Json(SubListRes { conns }).into_response(),
        Err(err) => {
            tracing::error!(?channels, error = %err, "error getting subscribed connections");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

// Union of the frontend subscribers of every channel across every node.
async fn list_subbed(gateway: &Gateway, channels: &[String]) -> heron_distr::Result<Vec<Conn>> {
    let nodes = gateway.store.get_node_ids().await?;
    let mut seen = HashSet::new();
    let mut conns = Vec::new();
    for node in &nodes {
        for channel in channels {
            let subscribed = gateway
                .store
                .get_subscribed(node, channel, false, gateway.conn_ttl)
                .await?;
            for conn in subscribed {
                if seen.insert(conn.clone()) {
                    conns.push(conn);
                }
            }
        }
    }
    Ok(conns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_auth::Signer;
    use heron_distr::MemStore;
    use heron_router::Router;
    use std::time::Duration;

    fn test_gateway() -> Gateway {
        let store = Arc::new(MemStore::new(1));
        let router = Arc::new(Router::new("n1", Duration::from_secs(30)));
        Gateway::new(store, router, Signer::new("secret"))
    }

    fn query(presence: &str, sig: &str) -> PresenceQuery {
        PresenceQuery {
            presence: presence.to_string(),
            sig: sig.to_string(),
        }
    }

    #[test]
    fn channels_come_from_the_path_segment() {
        let gateway = test_gateway();
        let (_, channels) =
            conn_info(&gateway, "a,b,c", &PresenceQuery::default()).expect("conn info");
        assert_eq!(channels, vec!["a", "b", "c"]);

        let (_, channels) = conn_info(&gateway, "", &PresenceQuery::default()).expect("conn info");
        assert!(channels.is_empty());

        let (_, channels) = conn_info(&gateway, "a,,b", &PresenceQuery::default()).expect("conn info");
        assert_eq!(channels, vec!["a", "b"]);
    }

    #[test]
    fn anonymous_connections_are_frontend() {
        let gateway = test_gateway();
        let (conn, _) = conn_info(&gateway, "ch", &PresenceQuery::default()).expect("conn info");
        assert!(!conn.is_backend);
        assert!(conn.presence.is_empty());
        assert_eq!(conn.id.node(), "n1");
    }

    #[test]
    fn signed_presence_is_recorded() {
        let gateway = test_gateway();
        let sig = gateway.signer.sign("alice");
        let (conn, _) = conn_info(&gateway, "ch", &query("alice", &sig)).expect("conn info");
        assert_eq!(conn.presence, "alice");
        assert!(!conn.is_backend);
    }

    #[test]
    fn backend_presence_flips_the_flag() {
        let gateway = test_gateway();
        let sig = gateway.signer.sign("backend");
        let (conn, _) = conn_info(&gateway, "ch", &query("backend", &sig)).expect("conn info");
        assert!(conn.is_backend);
        assert!(conn.presence.is_empty());
    }

    #[test]
    fn bad_signature_is_rejected() {
        let gateway = test_gateway();
        let err = conn_info(&gateway, "ch", &query("alice", "bogus_1.0")).expect_err("rejected");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        // A signature for a different value does not transfer.
        let sig = gateway.signer.sign("bob");
        let err = conn_info(&gateway, "ch", &query("alice", &sig)).expect_err("rejected");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
