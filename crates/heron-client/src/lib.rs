//! Client for talking to one or more bus nodes.
//!
//! Subscribing:
//!
//! ```no_run
//! use heron_client::Client;
//!
//! # async fn run() -> heron_client::Result<()> {
//! let client = Client::new(["http://127.0.0.1:4444/subs"]);
//! let mut subscription = client.subscribe(&["someChannel".to_string()]).await?;
//! while let Some(envelope) = subscription.recv().await {
//!     println!("got envelope: {envelope:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Backend applications prove knowledge of the shared secret:
//!
//! ```no_run
//! use heron_client::{Client, backend_presence};
//!
//! let client = Client::new(["http://127.0.0.1:4444/subs"])
//!     .with_presence(backend_presence("secret key"));
//! ```
use futures_util::StreamExt;
use heron_auth::Signer;
use heron_conn::{Conn, Envelope};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no node urls configured")]
    NoUrls,
    #[error("invalid node url: {0}")]
    Url(#[from] url::ParseError),
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request rejected: {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("protocol: {0}")]
    Protocol(String),
}

/// Supplies a presence label and its signature for each new request.
pub type PresenceFn = Arc<dyn Fn() -> (String, String) + Send + Sync>;

/// Presence function for a backend application.
pub fn backend_presence(secret: impl AsRef<[u8]>) -> PresenceFn {
    let signer = Signer::new(secret);
    Arc::new(move || ("backend".to_string(), signer.sign("backend")))
}

/// Presence function signing an ordinary client label.
pub fn signed_presence(secret: impl AsRef<[u8]>, presence: impl Into<String>) -> PresenceFn {
    let signer = Signer::new(secret);
    let presence = presence.into();
    Arc::new(move || (presence.clone(), signer.sign(&presence)))
}

#[derive(Clone)]
pub struct Client {
    // Node urls, picked from randomly per request.
    urls: Vec<String>,
    presence: Option<PresenceFn>,
    http: reqwest::Client,
}

impl Client {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            presence: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_presence(mut self, presence: PresenceFn) -> Self {
        self.presence = Some(presence);
        self
    }

    fn request_url(&self, scheme: &str, suffix: &str, channels: &[String]) -> Result<Url> {
        if self.urls.is_empty() {
            return Err(Error::NoUrls);
        }
        let base = &self.urls[rand::thread_rng().gen_range(0..self.urls.len())];
        let mut url = Url::parse(base)?;
        url.set_scheme(scheme)
            .map_err(|_| Error::Protocol(format!("cannot use scheme {scheme} with {base}")))?;
        let mut path = url.path().trim_end_matches('/').to_string();
        path.push('/');
        path.push_str(&channels.join(","));
        if !suffix.is_empty() {
            path.push('/');
            path.push_str(suffix);
        }
        url.set_path(&path);
        let (presence, sig) = match &self.presence {
            Some(presence_fn) => presence_fn(),
            None => (String::new(), String::new()),
        };
        url.query_pairs_mut()
            .append_pair("presence", &presence)
            .append_pair("sig", &sig);
        Ok(url)
    }

    /// Open a connection subscribed to `channels` and stream its envelopes.
    pub async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        let url = self.request_url("ws", "", channels)?;
        let (mut ws, _) = connect_async(url.as_str()).await?;

        // First frame: the server-assigned connection object.
        let conn = loop {
            let frame = ws
                .next()
                .await
                .ok_or_else(|| Error::Protocol("connection closed before hello".to_string()))??;
            if let Message::Text(text) = frame {
                break serde_json::from_str::<Conn>(&text)
                    .map_err(|err| Error::Protocol(format!("bad hello frame: {err}")))?;
            }
        };

        let (tx, rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::debug!(error = %err, "subscription stream ended");
                        return;
                    }
                };
                match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, frame = %text, "dropping undecodable frame")
                    }
                }
            }
        });
        Ok(Subscription {
            conn,
            envelopes: rx,
            reader,
        })
    }

    /// Publish `message` on every channel in `channels`.
    pub async fn publish(&self, message: &serde_json::Value, channels: &[String]) -> Result<()> {
        let url = self.request_url("http", "", channels)?;
        let response = self.http.post(url.as_str()).json(message).send().await?;
        check_status(response).await?;
        Ok(())
    }

    /// Union of the connections subscribed to `channels` across the cluster.
    /// The client must be configured with a backend presence.
    pub async fn get_subscribed(&self, channels: &[String]) -> Result<Vec<Conn>> {
        let url = self.request_url("http", "subbed", channels)?;
        let response = self.http.get(url.as_str()).send().await?;
        let response = check_status(response).await?;
        let listing: SubListRes = response.json().await?;
        Ok(listing.conns)
    }
}

#[derive(Debug, serde::Deserialize)]
struct SubListRes {
    conns: Vec<Conn>,
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Rejected { status, body })
}

/// A live subscription connection. Dropping it closes the socket.
pub struct Subscription {
    conn: Conn,
    envelopes: mpsc::Receiver<Envelope>,
    reader: tokio::task::JoinHandle<()>,
}

impl Subscription {
    /// The connection record the server assigned to this subscription.
    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    /// Next envelope, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.envelopes.recv().await
    }

    pub fn stop(self) {
        self.reader.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn request_url_joins_channels_and_suffix() {
        let client = Client::new(["http://127.0.0.1:4444/subs"]);
        let url = client
            .request_url("ws", "", &channels(&["a", "b"]))
            .expect("url");
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/subs/a,b");
        assert_eq!(url.query(), Some("presence=&sig="));

        let url = client
            .request_url("http", "subbed", &channels(&["a"]))
            .expect("url");
        assert_eq!(url.path(), "/subs/a/subbed");
    }

    #[test]
    fn request_url_signs_the_presence() {
        let client = Client::new(["http://127.0.0.1:4444/subs"])
            .with_presence(backend_presence("secret"));
        let url = client
            .request_url("http", "", &channels(&["ch"]))
            .expect("url");
        let query = url.query().expect("query");
        assert!(query.contains("presence=backend"));
        let sig = url
            .query_pairs()
            .find(|(key, _)| key == "sig")
            .map(|(_, value)| value.to_string())
            .expect("sig");
        assert!(Signer::new("secret").verify(&sig, "backend"));
    }

    #[test]
    fn no_urls_is_an_error() {
        let client = Client::new(Vec::<String>::new());
        assert!(matches!(
            client.request_url("ws", "", &[]),
            Err(Error::NoUrls)
        ));
    }
}
