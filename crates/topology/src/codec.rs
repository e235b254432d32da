//! Versioned persistence codec
//!
//! Persisted entities are written as a CBOR envelope carrying a schema name
//! and version alongside the payload. Readers accept any version up to their
//! own, upgrading older payloads through [`Persisted::upgrade`]. Unknown
//! fields are ignored and new fields are expected to carry serde defaults.

use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::CodecError;

/// An entity with a stable persisted form
pub trait Persisted: Serialize + DeserializeOwned {
    /// Schema name written into the envelope
    const SCHEMA: &'static str;

    /// Current schema version
    const VERSION: u16;

    /// Rewrite a payload written by an older version into the current shape
    fn upgrade(from_version: u16, payload: Value) -> Result<Value, CodecError> {
        let _ = from_version;
        Ok(payload)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    schema: String,
    version: u16,
    payload: Value,
}

/// Encode an entity into its versioned envelope
pub fn encode<T: Persisted>(value: &T) -> Result<Vec<u8>, CodecError> {
    let payload = Value::serialized(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    let envelope = Envelope {
        schema: T::SCHEMA.to_string(),
        version: T::VERSION,
        payload,
    };

    let mut buf = Vec::new();
    ciborium::into_writer(&envelope, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode an entity from its versioned envelope
pub fn decode<T: Persisted>(bytes: &[u8]) -> Result<T, CodecError> {
    let envelope: Envelope =
        ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;

    if envelope.schema != T::SCHEMA {
        return Err(CodecError::SchemaMismatch {
            expected: T::SCHEMA.to_string(),
            found: envelope.schema,
        });
    }
    if envelope.version > T::VERSION {
        return Err(CodecError::UnsupportedVersion {
            schema: envelope.schema,
            found: envelope.version,
            supported: T::VERSION,
        });
    }

    let payload = if envelope.version < T::VERSION {
        T::upgrade(envelope.version, envelope.payload)?
    } else {
        envelope.payload
    };

    payload
        .deserialized()
        .map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Metadata, MetadataEntry, MetadataKind, Node, NodeId, ShardId, StorageNode, StorageNodeId,
        Topology, UserDef,
    };
    use assert_matches::assert_matches;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
        #[serde(default)]
        size: u32,
    }

    impl Persisted for Widget {
        const SCHEMA: &'static str = "widget";
        const VERSION: u16 = 2;

        fn upgrade(from_version: u16, payload: Value) -> Result<Value, CodecError> {
            // v1 stored only the bare name
            match (from_version, payload) {
                (1, Value::Text(name)) => Ok(Value::Map(vec![
                    (Value::Text("name".into()), Value::Text(name)),
                    (Value::Text("size".into()), Value::Integer(1.into())),
                ])),
                (_, other) => Ok(other),
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct WidgetV1(String);

    impl Persisted for WidgetV1 {
        const SCHEMA: &'static str = "widget";
        const VERSION: u16 = 1;
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct WidgetV3 {
        name: String,
        size: u32,
        color: String,
    }

    impl Persisted for WidgetV3 {
        const SCHEMA: &'static str = "widget";
        const VERSION: u16 = 3;
    }

    #[test]
    fn topology_survives_encoding() {
        let mut topo = Topology::new("kvstore");
        topo.add_storage_node(StorageNode::new(StorageNodeId(1), "host1", 5000))
            .unwrap();
        topo.add_shard(ShardId(1)).unwrap();
        topo.add_node(Node::new(NodeId::data(1, 1), StorageNodeId(1)))
            .unwrap();

        let bytes = encode(&topo).unwrap();
        let decoded: Topology = decode(&bytes).unwrap();
        assert_eq!(decoded, topo);
    }

    #[test]
    fn older_versions_are_upgraded() {
        let bytes = encode(&WidgetV1("gear".to_string())).unwrap();
        let widget: Widget = decode(&bytes).unwrap();
        assert_eq!(
            widget,
            Widget {
                name: "gear".to_string(),
                size: 1
            }
        );
    }

    #[test]
    fn newer_versions_are_rejected() {
        let bytes = encode(&WidgetV3 {
            name: "gear".to_string(),
            size: 2,
            color: "red".to_string(),
        })
        .unwrap();
        assert_matches!(
            decode::<Widget>(&bytes),
            Err(CodecError::UnsupportedVersion { found: 3, .. })
        );
    }

    #[test]
    fn schema_must_match() {
        let mut md = Metadata::new(MetadataKind::Security);
        md.put(
            "alice",
            MetadataEntry::User(UserDef {
                name: "alice".to_string(),
                admin: true,
                password_hash: "h".to_string(),
            }),
        );
        let bytes = encode(&md).unwrap();
        assert_matches!(
            decode::<Topology>(&bytes),
            Err(CodecError::SchemaMismatch { .. })
        );
        assert_eq!(decode::<Metadata>(&bytes).unwrap(), md);
    }
}
