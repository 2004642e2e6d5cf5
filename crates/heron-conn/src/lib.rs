// Shared connection identity and envelope types used across crates.
//
// A connection id embeds the owning node (`<node-id>_<hex-random>`), so any
// holder of an id can tell which node terminates that connection. Channel-set
// members are the MessagePack serialization of the whole connection record,
// which lets subscriber listings return hydrated records without a second
// store round trip.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("encode member: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode member: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

const ID_SEP: char = '_';

/// Returns a fresh 128-bit node id, hex encoded. Drawn once at process start
/// and used as the prefix of every connection id minted by that node.
pub fn random_node_id() -> String {
    hex::encode(Uuid::new_v4().as_bytes())
}

/// Opaque connection id of the form `<node-id>_<hex-random>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(String);

impl ConnId {
    // Mint a new globally unique id owned by `node_id`.
    pub fn generate(node_id: &str) -> Self {
        Self(format!(
            "{node_id}{ID_SEP}{}",
            hex::encode(Uuid::new_v4().as_bytes())
        ))
    }

    /// The id of the node that owns this connection, or empty if the id is
    /// not in the expected form.
    pub fn node(&self) -> &str {
        match self.0.split_once(ID_SEP) {
            Some((node, _)) => node,
            None => "",
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Everything stored about a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conn {
    pub id: ConnId,
    /// Client-chosen identity label, shown to other subscribers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub presence: String,
    /// True iff the connection proved knowledge of the shared secret.
    #[serde(rename = "isBackend", default, skip_serializing_if = "is_false")]
    pub is_backend: bool,
}

impl Conn {
    pub fn new(node_id: &str) -> Self {
        Self {
            id: ConnId::generate(node_id),
            presence: String::new(),
            is_backend: false,
        }
    }

    /// Compact binary encoding used as the channel-set member.
    pub fn encode_member(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode_member(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Application message.
    Pub,
    /// Presence event: a frontend connection subscribed.
    Sub,
    /// Presence event: a frontend connection unsubscribed or went away.
    Unsub,
}

/// A single item traversing the broadcast bus and, eventually, a socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub conn: Conn,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,
}

impl Envelope {
    pub fn publish(conn: Conn, channel: impl Into<String>, message: serde_json::Value) -> Self {
        Self {
            kind: EnvelopeKind::Pub,
            conn,
            channel: channel.into(),
            message: Some(message),
        }
    }

    // Presence events carry no message body.
    pub fn presence(kind: EnvelopeKind, conn: Conn, channel: impl Into<String>) -> Self {
        Self {
            kind,
            conn,
            channel: channel.into(),
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_embeds_owning_node() {
        let node = random_node_id();
        let id = ConnId::generate(&node);
        assert_eq!(id.node(), node);
        // 128-bit random suffix, hex encoded.
        let suffix = id.as_str().strip_prefix(&format!("{node}_")).expect("prefix");
        assert_eq!(suffix.len(), 32);
    }

    #[test]
    fn malformed_id_has_empty_node() {
        let id = ConnId::from("noseparator".to_string());
        assert_eq!(id.node(), "");
    }

    #[test]
    fn ids_are_unique() {
        let node = random_node_id();
        assert_ne!(ConnId::generate(&node), ConnId::generate(&node));
    }

    #[test]
    fn conn_json_omits_defaults() {
        let conn = Conn::new("n1");
        let value = serde_json::to_value(&conn).expect("encode");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(conn.id.as_str()));
        assert!(value.get("presence").is_none());
        assert!(value.get("isBackend").is_none());
    }

    #[test]
    fn conn_json_keeps_set_fields() {
        let mut conn = Conn::new("n1");
        conn.presence = "alice".to_string();
        conn.is_backend = true;
        let value = serde_json::to_value(&conn).expect("encode");
        assert_eq!(value.get("presence").and_then(|v| v.as_str()), Some("alice"));
        assert_eq!(value.get("isBackend").and_then(|v| v.as_bool()), Some(true));
    }

    #[test]
    fn member_encoding_round_trips() {
        let mut conn = Conn::new("n1");
        conn.presence = "alice".to_string();
        let bytes = conn.encode_member().expect("encode");
        let decoded = Conn::decode_member(&bytes).expect("decode");
        assert_eq!(decoded, conn);
    }

    #[test]
    fn member_decoding_rejects_garbage() {
        assert!(Conn::decode_member(b"\xffnot-msgpack").is_err());
    }

    #[test]
    fn envelope_wire_shape() {
        let conn = Conn::new("n1");
        let envelope = Envelope::publish(conn.clone(), "ch", json!("hello"));
        let value = serde_json::to_value(&envelope).expect("encode");
        assert_eq!(value.get("type").and_then(|v| v.as_str()), Some("pub"));
        assert_eq!(value.get("channel").and_then(|v| v.as_str()), Some("ch"));
        assert_eq!(value.get("message").and_then(|v| v.as_str()), Some("hello"));

        let presence = Envelope::presence(EnvelopeKind::Unsub, conn, "ch");
        let value = serde_json::to_value(&presence).expect("encode");
        assert_eq!(value.get("type").and_then(|v| v.as_str()), Some("unsub"));
        assert!(value.get("message").is_none());
    }

    #[test]
    fn envelope_json_round_trips() {
        let mut conn = Conn::new("n1");
        conn.is_backend = true;
        let envelope = Envelope::publish(conn, "orders", json!({"total": 3}));
        let text = serde_json::to_string(&envelope).expect("encode");
        let decoded: Envelope = serde_json::from_str(&text).expect("decode");
        assert_eq!(decoded, envelope);
    }
}
