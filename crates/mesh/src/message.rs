use chrono::{DateTime, Utc};
use cogwheel_core::PeerId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::ClockSnapshot;
use crate::error::MeshError;

/// Wire envelope for peer-to-peer delegation traffic.
///
/// Payloads are MessagePack-encoded. Every message carries the sender's
/// Merkle clock snapshot so the receiver can order reports causally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Protocol topic, see [`crate::protocol::topics`].
    pub topic: String,

    pub sender: PeerId,

    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    pub clock: ClockSnapshot,

    /// Wall-clock creation time. Informational only.
    pub timestamp: DateTime<Utc>,

    /// Ties replies (accept, reject, result) to the proposal that caused them.
    pub correlation_id: Uuid,

    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Message {
    pub fn new<T: Serialize>(
        topic: impl Into<String>,
        sender: PeerId,
        clock: ClockSnapshot,
        payload: &T,
    ) -> Result<Self, MeshError> {
        Self::with_correlation(topic, sender, clock, payload, Uuid::new_v4())
    }

    pub fn with_correlation<T: Serialize>(
        topic: impl Into<String>,
        sender: PeerId,
        clock: ClockSnapshot,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, MeshError> {
        Ok(Self {
            topic: topic.into(),
            sender,
            payload: rmp_serde::to_vec(payload)?,
            clock,
            timestamp: Utc::now(),
            correlation_id,
            version: 1,
        })
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, MeshError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Serialize `Vec<u8>` as a MessagePack binary rather than an array.
mod serde_bytes {
    use std::fmt;

    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte buffer")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element()? {
                out.push(b);
            }
            Ok(out)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        d.deserialize_byte_buf(BytesVisitor)
    }
}
