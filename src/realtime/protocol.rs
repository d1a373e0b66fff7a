//! Wire protocol for the realtime channel. Messages are internally-tagged
//! JSON; CRDT update and presence payloads are opaque bytes carried as
//! base64 strings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serde adapter: `Vec<u8>` <-> base64 string.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Same adapter for optional payloads; `null` means "cleared".
pub mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|value| STANDARD.decode(value.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// First frame on connections that did not present an Authorization
    /// header during the handshake.
    Auth {
        token: String,
    },
    Join {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        #[serde(rename = "shareToken", default)]
        share_token: Option<String>,
    },
    Leave {
        #[serde(rename = "documentId")]
        document_id: Uuid,
    },
    Update {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        #[serde(with = "b64")]
        bytes: Vec<u8>,
    },
    /// `bytes: null` clears the sender's presence record.
    Presence {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        #[serde(with = "b64_opt", default)]
        bytes: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqUpdate {
    pub seq: i64,
    #[serde(with = "b64")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "peerId")]
    pub peer_id: Uuid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Complete state for a joining peer: snapshot (if available) plus the
    /// log tail above it. With no snapshot, `snapshot_seq` is 0 and
    /// `updates` carries the whole log.
    Init {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        #[serde(with = "b64_opt", default)]
        snapshot: Option<Vec<u8>>,
        #[serde(rename = "snapshotSeq")]
        snapshot_seq: i64,
        updates: Vec<SeqUpdate>,
    },
    Update {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        seq: i64,
        #[serde(with = "b64")]
        bytes: Vec<u8>,
    },
    Presence {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        #[serde(rename = "peerId")]
        peer_id: Uuid,
        #[serde(with = "b64_opt", default)]
        bytes: Option<Vec<u8>>,
    },
    PresenceRequest {
        #[serde(rename = "documentId")]
        document_id: Uuid,
    },
    PeerJoined {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        #[serde(rename = "peerId")]
        peer_id: Uuid,
        name: Option<String>,
    },
    PeerLeft {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        #[serde(rename = "peerId")]
        peer_id: Uuid,
    },
    ActivePeers {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        peers: Vec<PeerInfo>,
    },
    ExecuteResult {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        #[serde(rename = "executionId")]
        execution_id: Uuid,
        status: String,
        output: Option<String>,
        error: Option<String>,
        #[serde(rename = "executionTimeMs")]
        execution_time_ms: Option<i64>,
    },
    Error {
        reason: String,
        #[serde(rename = "documentId", skip_serializing_if = "Option::is_none")]
        document_id: Option<Uuid>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_update_round_trips() {
        let msg = ClientMessage::Update {
            document_id: Uuid::new_v4(),
            bytes: vec![1, 2, 3, 255],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"update\""));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::Update { bytes, .. } => assert_eq!(bytes, vec![1, 2, 3, 255]),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn presence_clear_serializes_as_null() {
        let msg = ClientMessage::Presence {
            document_id: Uuid::new_v4(),
            bytes: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::Presence { bytes, .. } => assert!(bytes.is_none()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn tags_are_kebab_case() {
        let msg = ServerMessage::PresenceRequest {
            document_id: Uuid::new_v4(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"presence-request\""));

        let msg = ServerMessage::PeerJoined {
            document_id: Uuid::new_v4(),
            peer_id: Uuid::new_v4(),
            name: Some("ada".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"peer-joined\""));
    }

    #[test]
    fn init_includes_snapshot_and_tail() {
        let msg = ServerMessage::Init {
            document_id: Uuid::new_v4(),
            snapshot: Some(vec![9, 9]),
            snapshot_seq: 7,
            updates: vec![SeqUpdate {
                seq: 8,
                bytes: vec![1],
            }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        match back {
            ServerMessage::Init {
                snapshot,
                snapshot_seq,
                updates,
                ..
            } => {
                assert_eq!(snapshot, Some(vec![9, 9]));
                assert_eq!(snapshot_seq, 7);
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].seq, 8);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
