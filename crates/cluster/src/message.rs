use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire-format envelope for every frame exchanged between cluster nodes.
///
/// Payloads are MessagePack-encoded. The `correlation_id` of an assignment
/// is the run id, and the sub echoes it on its result so the coordinator
/// can tell stale or foreign reports apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Protocol topic, one of [`crate::messages::topics`].
    pub topic: String,

    /// MessagePack-encoded payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    pub timestamp: DateTime<Utc>,

    pub correlation_id: Uuid,

    /// Protocol version. Nodes refuse envelopes from a different version.
    #[serde(default = "default_version")]
    pub version: u16,
}

pub const PROTOCOL_VERSION: u16 = 1;

fn default_version() -> u16 {
    PROTOCOL_VERSION
}

impl Message {
    /// Encode `payload` under `topic` for the run or exchange `correlation_id`.
    pub fn encode<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            topic: topic.into(),
            payload: rmp_serde::to_vec(payload)?,
            timestamp: Utc::now(),
            correlation_id,
            version: PROTOCOL_VERSION,
        })
    }

    /// Whether this envelope was produced by a node speaking our protocol version.
    pub fn is_current_version(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }

    /// Serialize the whole envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}
