//! Commands appended to the replicated log.
//!
//! The log carries opaque [`RawCommand`] bytes; the state machine decodes them into [`Command`]
//! and applies the result to the [`Store`]. Reads are served locally and never become commands.

use serde::{Deserialize, Serialize};

use crate::{codec::base64_bytes, store::Store};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    MapPut {
        namespace: String,
        key: String,
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    },
    MapPutIfAbsent {
        namespace: String,
        key: String,
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    },
    MapRemove {
        namespace: String,
        key: String,
    },
    MapClear {
        namespace: String,
    },
    CachePut {
        namespace: String,
        key: String,
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    },
    CacheRemove {
        namespace: String,
        key: String,
    },
    CacheClear {
        namespace: String,
    },
}

/// Encoded command as stored in raft log entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommand(#[serde(with = "base64_bytes")] pub Vec<u8>);

impl From<Vec<u8>> for RawCommand {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeError {
    pub message: String,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed command: {}", self.message)
    }
}

impl std::error::Error for DecodeError {}

/// Outcome of applying one log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// The mutator's return value (was-new, was-written, removed, existed).
    pub data: Option<bool>,
    pub error: Option<DecodeError>,
}

impl ApplyResult {
    /// Result for membership and blank entries.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn applied(data: bool) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn rejected(error: DecodeError) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }
}

impl Command {
    pub fn encode(&self) -> Result<RawCommand, serde_json::Error> {
        serde_json::to_vec(self).map(RawCommand)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError {
            message: e.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        match self {
            Command::MapPut { namespace, .. }
            | Command::MapPutIfAbsent { namespace, .. }
            | Command::MapRemove { namespace, .. }
            | Command::MapClear { namespace }
            | Command::CachePut { namespace, .. }
            | Command::CacheRemove { namespace, .. }
            | Command::CacheClear { namespace } => namespace,
        }
    }

    /// Applies the command, holding the touched structure's write guard only for the mutation.
    pub async fn apply(self, store: &Store) -> bool {
        match self {
            Command::MapPut {
                namespace,
                key,
                value,
            } => store.map_mut().await.put(&namespace, &key, value),
            Command::MapPutIfAbsent {
                namespace,
                key,
                value,
            } => store.map_mut().await.put_if_absent(&namespace, &key, value),
            Command::MapRemove { namespace, key } => {
                store.map_mut().await.remove(&namespace, &key)
            }
            Command::MapClear { namespace } => store.map_mut().await.clear(&namespace),
            Command::CachePut {
                namespace,
                key,
                value,
            } => store.cache_mut().await.put(&namespace, &key, value),
            Command::CacheRemove { namespace, key } => {
                store.cache_mut().await.remove(&namespace, &key)
            }
            Command::CacheClear { namespace } => store.cache_mut().await.clear(&namespace),
        }
    }
}

/// Decodes and applies one committed payload. Malformed bytes leave the store untouched.
pub async fn apply_raw(raw: &RawCommand, store: &Store) -> ApplyResult {
    match Command::decode(&raw.0) {
        Ok(command) => ApplyResult::applied(command.apply(store).await),
        Err(err) => {
            tracing::warn!(error = %err, "skipping undecodable log entry");
            ApplyResult::rejected(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn put(ns: &str, key: &str, value: &str) -> Command {
        Command::MapPut {
            namespace: ns.to_string(),
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn workload() -> Vec<Command> {
        vec![
            put("users", "alice", "1"),
            put("users", "bob", "2"),
            Command::MapPutIfAbsent {
                namespace: "users".to_string(),
                key: "alice".to_string(),
                value: b"ignored".to_vec(),
            },
            Command::CachePut {
                namespace: "sessions".to_string(),
                key: "s1".to_string(),
                value: b"a".to_vec(),
            },
            Command::CachePut {
                namespace: "sessions".to_string(),
                key: "s2".to_string(),
                value: b"b".to_vec(),
            },
            Command::CachePut {
                namespace: "sessions".to_string(),
                key: "s3".to_string(),
                value: b"c".to_vec(),
            },
            Command::MapRemove {
                namespace: "users".to_string(),
                key: "bob".to_string(),
            },
            Command::CacheRemove {
                namespace: "sessions".to_string(),
                key: "s3".to_string(),
            },
            put("scratch", "k", "v"),
            Command::MapClear {
                namespace: "scratch".to_string(),
            },
        ]
    }

    #[test]
    fn wire_format_is_tagged_json_with_base64_values() {
        let raw = put("ns", "k", "hi").encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw.0).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"op": "map_put", "namespace": "ns", "key": "k", "value": "aGk="})
        );
    }

    #[tokio::test]
    async fn same_log_yields_same_state_on_every_replica() {
        let replicas = [Store::new(2), Store::new(2)];
        let mut results = Vec::new();
        for store in &replicas {
            let mut per_replica = Vec::new();
            for cmd in workload() {
                per_replica.push(apply_raw(&cmd.encode().unwrap(), store).await);
            }
            results.push(per_replica);
        }

        assert_eq!(results[0], results[1]);
        assert_eq!(replicas[0].snapshot().await, replicas[1].snapshot().await);
        assert_eq!(replicas[0].map_get("users", "alice").await, Some(b"1".to_vec()));
        assert_eq!(replicas[0].map_get("users", "bob").await, None);
        assert_eq!(replicas[0].map_get("scratch", "k").await, None);
        assert_eq!(replicas[0].cache_get("sessions", "s1").await, None);
        assert_eq!(replicas[0].cache_get("sessions", "s2").await, Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn apply_returns_mutator_result() {
        let store = Store::default();
        let first = apply_raw(&put("ns", "k", "v").encode().unwrap(), &store).await;
        let second = apply_raw(&put("ns", "k", "w").encode().unwrap(), &store).await;
        let clear_missing = apply_raw(
            &Command::CacheClear {
                namespace: "nothing".to_string(),
            }
            .encode()
            .unwrap(),
            &store,
        )
        .await;

        assert_eq!(first, ApplyResult::applied(true));
        assert_eq!(second, ApplyResult::applied(false));
        assert_eq!(clear_missing, ApplyResult::applied(false));
    }

    #[tokio::test]
    async fn malformed_payload_is_reported_and_ignored() {
        let store = Store::default();
        apply_raw(&put("ns", "k", "v").encode().unwrap(), &store).await;
        let before = store.snapshot().await;

        let result = apply_raw(&RawCommand(b"{\"op\":\"launch\"}".to_vec()), &store).await;

        assert_eq!(result.data, None);
        assert!(result.error.is_some());
        assert_eq!(store.snapshot().await, before);
    }
}
