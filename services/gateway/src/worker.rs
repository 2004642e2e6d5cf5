// Per-connection worker.
//
// Every live websocket gets one worker that owns the write half of the
// socket. Reads, fanned-out envelopes, and the renewal timer are merged into
// a single event loop, so frames leave the socket in the order they were
// observed. Every exit path runs the same teardown: unsubscribe everywhere,
// delete the metadata key, close the mailbox, deregister from the router.
use crate::Gateway;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use heron_conn::{Conn, Envelope, EnvelopeKind};
use heron_router::Registration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "lowercase")]
enum Command {
    Echo { message: Value },
    Auth { presence: String, signature: String },
    Pub { channel: String, message: Value },
    Sub { channel: String },
    Unsub { channel: String },
}

// Pushed to the peer when something unexpected happened; the connection
// stays open.
#[derive(Debug, Serialize)]
struct ErrorFrame {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<Value>,
}

pub async fn run(gateway: Arc<Gateway>, socket: WebSocket, conn: Conn, initial: Vec<String>) {
    let (sink, mut stream) = socket.split();
    let mut registration = gateway.router.register(conn.id.clone()).await;
    tracing::debug!(conn = %conn.id, subs = ?initial, "conn created");

    let mut session = Session {
        gateway,
        conn,
        subs: Vec::new(),
        sink,
    };
    if session.init(initial).await {
        session.event_loop(&mut stream, &mut registration).await;
    }
    session.teardown(&registration).await;
    tracing::debug!(conn = %session.conn.id, "conn closed");
}

struct Session {
    gateway: Arc<Gateway>,
    conn: Conn,
    // Channels this worker currently holds subscriptions for.
    subs: Vec<String>,
    sink: SplitSink<WebSocket, Message>,
}

impl Session {
    /// Announce the connection, store its metadata, and take the initial
    /// subscriptions. Returns false if the session is unusable.
    async fn init(&mut self, initial: Vec<String>) -> bool {
        let conn = self.conn.clone();
        if self.send(&conn).await.is_err() {
            return false;
        }
        if let Err(err) = self.gateway.store.set_conn(&conn, self.gateway.conn_ttl).await {
            let _ = self
                .write_error("error storing connection", &err.to_string(), None)
                .await;
            return false;
        }
        for channel in initial {
            if let Err(err) = self.subscribe_channel(&channel).await {
                let _ = self
                    .write_error("error subscribing", &err.to_string(), None)
                    .await;
                return false;
            }
        }
        true
    }

    async fn event_loop(
        &mut self,
        stream: &mut SplitStream<WebSocket>,
        registration: &mut Registration,
    ) {
        let period = self.gateway.conn_ttl / 4;
        let start = tokio::time::Instant::now() + period;
        let mut renewal = tokio::time::interval_at(start, period);
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_frame(text.as_str()).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                },
                envelope = registration.recv() => match envelope {
                    Some(envelope) => {
                        if self.send(&envelope).await.is_err() {
                            return;
                        }
                        metrics::counter!("heron_frames_out_total").increment(1);
                    }
                    None => return,
                },
                _ = renewal.tick() => self.renew().await,
            }
        }
    }

    // The Err variant means the socket write failed and the session is over.
    async fn handle_frame(&mut self, text: &str) -> Result<(), axum::Error> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                return self
                    .write_error(
                        "malformed frame",
                        &err.to_string(),
                        Some(Value::String(text.to_string())),
                    )
                    .await;
            }
        };
        let command: Command = match serde_json::from_value(value.clone()) {
            Ok(command) => command,
            Err(err) => {
                return self
                    .write_error("unknown command", &err.to_string(), Some(value))
                    .await;
            }
        };
        match command {
            Command::Echo { .. } => self.send_raw(text).await,
            Command::Auth {
                presence,
                signature,
            } => self.handle_auth(presence, signature).await,
            Command::Pub { channel, message } => {
                let envelope = Envelope::publish(self.conn.clone(), channel, message);
                if let Err(err) = self.gateway.store.broadcast(&envelope).await {
                    return self
                        .write_error("error broadcasting publish", &err.to_string(), Some(value))
                        .await;
                }
                metrics::counter!("heron_publish_total").increment(1);
                Ok(())
            }
            Command::Sub { channel } => {
                if let Err(err) = self.subscribe_channel(&channel).await {
                    return self
                        .write_error("error subscribing", &err.to_string(), Some(value))
                        .await;
                }
                Ok(())
            }
            Command::Unsub { channel } => {
                if let Err(err) = self.unsubscribe_channel(&channel).await {
                    return self
                        .write_error("error unsubscribing", &err.to_string(), Some(value))
                        .await;
                }
                Ok(())
            }
        }
    }

    /// A signature over the raw connection id promotes to backend, but only
    /// while no subscriptions are active: a connection cannot straddle the
    /// frontend/backend split. A signature over the declared presence
    /// records that presence instead.
    async fn handle_auth(
        &mut self,
        presence: String,
        signature: String,
    ) -> Result<(), axum::Error> {
        if self.gateway.signer.verify(&signature, self.conn.id.as_str()) {
            if !self.subs.is_empty() {
                return self
                    .write_error(
                        "auth rejected",
                        "cannot promote to backend with active subscriptions",
                        None,
                    )
                    .await;
            }
            self.conn.is_backend = true;
        } else if self.gateway.signer.verify(&signature, &presence) {
            let previous = self.conn.clone();
            self.conn.presence = presence;
            // Channel-set members embed the connection record; re-key the
            // live subscriptions under the new encoding.
            for channel in &self.subs {
                if let Err(err) = self.gateway.store.unsubscribe(&previous, channel).await {
                    tracing::error!(conn = %self.conn.id, channel = %channel, error = %err, "error re-keying subscription");
                }
                if let Err(err) = self.gateway.store.subscribe(&self.conn, channel).await {
                    tracing::error!(conn = %self.conn.id, channel = %channel, error = %err, "error re-keying subscription");
                }
            }
        } else {
            return self
                .write_error("auth rejected", "invalid signature", None)
                .await;
        }
        let conn = self.conn.clone();
        if let Err(err) = self.gateway.store.set_conn(&conn, self.gateway.conn_ttl).await {
            return self
                .write_error("error storing connection", &err.to_string(), None)
                .await;
        }
        Ok(())
    }

    async fn subscribe_channel(&mut self, channel: &str) -> heron_distr::Result<()> {
        self.gateway.store.subscribe(&self.conn, channel).await?;
        if !self.subs.iter().any(|c| c == channel) {
            // Presence events announce new frontend subscribers to backends.
            if !self.conn.is_backend {
                let event = Envelope::presence(EnvelopeKind::Sub, self.conn.clone(), channel);
                self.gateway.store.broadcast(&event).await?;
            }
            self.subs.push(channel.to_string());
        }
        Ok(())
    }

    async fn unsubscribe_channel(&mut self, channel: &str) -> heron_distr::Result<()> {
        self.gateway.store.unsubscribe(&self.conn, channel).await?;
        if let Some(pos) = self.subs.iter().position(|c| c == channel) {
            self.subs.remove(pos);
            if !self.conn.is_backend {
                let event = Envelope::presence(EnvelopeKind::Unsub, self.conn.clone(), channel);
                self.gateway.store.broadcast(&event).await?;
            }
        }
        Ok(())
    }

    /// Refresh the metadata TTL and every subscription score. Failures are
    /// logged and retried on the next tick; the connection stays up.
    async fn renew(&mut self) {
        let conn = self.conn.clone();
        if let Err(err) = self.gateway.store.set_conn(&conn, self.gateway.conn_ttl).await {
            tracing::error!(conn = %self.conn.id, error = %err, "error re-setting conn");
        }
        for channel in &self.subs {
            if let Err(err) = self.gateway.store.subscribe(&self.conn, channel).await {
                tracing::error!(conn = %self.conn.id, channel = %channel, error = %err, "error re-subscribing conn");
            }
        }
    }

    async fn teardown(&mut self, registration: &Registration) {
        for channel in self.subs.clone() {
            if let Err(err) = self.gateway.store.unsubscribe(&self.conn, &channel).await {
                tracing::error!(conn = %self.conn.id, channel = %channel, error = %err, "error unsubbing during teardown");
            }
            if !self.conn.is_backend {
                let event =
                    Envelope::presence(EnvelopeKind::Unsub, self.conn.clone(), channel.as_str());
                if let Err(err) = self.gateway.store.broadcast(&event).await {
                    tracing::error!(conn = %self.conn.id, channel = %channel, error = %err, "error publishing unsubscribe");
                }
            }
        }
        if let Err(err) = self.gateway.store.unset_conn(&self.conn).await {
            tracing::error!(conn = %self.conn.id, error = %err, "error unsetting conn");
        }
        registration.close();
        self.gateway.router.deregister(&self.conn.id).await;
    }

    async fn send<T: Serialize>(&mut self, value: &T) -> Result<(), axum::Error> {
        match serde_json::to_string(value) {
            Ok(text) => self.sink.send(Message::Text(text.into())).await,
            Err(err) => {
                tracing::error!(conn = %self.conn.id, error = %err, "error encoding frame");
                Ok(())
            }
        }
    }

    async fn send_raw(&mut self, text: &str) -> Result<(), axum::Error> {
        self.sink.send(Message::Text(text.to_string().into())).await
    }

    async fn write_error(
        &mut self,
        message: &str,
        error: &str,
        from: Option<Value>,
    ) -> Result<(), axum::Error> {
        tracing::error!(conn = %self.conn.id, error, "{}", message);
        self.send(&ErrorFrame {
            error: error.to_string(),
            from,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(frame: Value) -> Result<Command, serde_json::Error> {
        serde_json::from_value(frame)
    }

    #[test]
    fn command_frames_parse() {
        assert_eq!(
            parse(json!({"command": "echo", "message": "hi"})).expect("echo"),
            Command::Echo {
                message: json!("hi")
            }
        );
        assert_eq!(
            parse(json!({"command": "auth", "presence": "p", "signature": "s"})).expect("auth"),
            Command::Auth {
                presence: "p".to_string(),
                signature: "s".to_string()
            }
        );
        assert_eq!(
            parse(json!({"command": "pub", "channel": "ch", "message": {"a": 1}})).expect("pub"),
            Command::Pub {
                channel: "ch".to_string(),
                message: json!({"a": 1})
            }
        );
        assert_eq!(
            parse(json!({"command": "sub", "channel": "ch"})).expect("sub"),
            Command::Sub {
                channel: "ch".to_string()
            }
        );
        assert_eq!(
            parse(json!({"command": "unsub", "channel": "ch"})).expect("unsub"),
            Command::Unsub {
                channel: "ch".to_string()
            }
        );
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(parse(json!({"command": "nope"})).is_err());
        assert!(parse(json!({"channel": "ch"})).is_err());
        assert!(parse(json!({"command": "pub"})).is_err());
    }

    #[test]
    fn error_frames_carry_the_original() {
        let frame = ErrorFrame {
            error: "unknown command".to_string(),
            from: Some(json!({"command": "nope"})),
        };
        let value = serde_json::to_value(&frame).expect("encode");
        assert_eq!(
            value.get("error").and_then(|v| v.as_str()),
            Some("unknown command")
        );
        assert_eq!(value["from"]["command"], json!("nope"));

        let bare = ErrorFrame {
            error: "boom".to_string(),
            from: None,
        };
        let value = serde_json::to_value(&bare).expect("encode");
        assert!(value.get("from").is_none());
    }
}
