//! Application messages: the explicit codec registry and type-erased payloads.
//!
//! Applications register every message type they exchange before the mesh
//! starts. Each registration maps a stable kind string to an encode/decode
//! pair; the kind travels on the wire and selects the decoder on receipt.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::MeshError;
use crate::peer::Peer;
use crate::wire::Frame;

type AnyValue = Arc<dyn Any + Send + Sync>;
type EncodeFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<Vec<u8>, MeshError> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<AnyValue, MeshError> + Send + Sync>;

/// An application message with the registry kind it travels under.
#[derive(Clone)]
pub struct Payload {
    kind: Arc<str>,
    value: AnyValue,
}

impl Payload {
    /// The registered kind of this message.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Borrow the message as `T`, if that is its type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Whether the message is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").field("kind", &self.kind).finish()
    }
}

/// An inbound application message as handed to the mesh's consumer.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// The peer the message arrived from.
    pub source: Arc<Peer>,
    /// When the frame was decoded.
    pub received_at: DateTime<Utc>,
    /// The decoded message.
    pub payload: Payload,
}

impl MessageEnvelope {
    pub(crate) fn new(source: Arc<Peer>, payload: Payload) -> Self {
        Self {
            source,
            received_at: Utc::now(),
            payload,
        }
    }
}

/// Receipt for a broadcast: which peers were written to without error.
#[derive(Debug, Clone)]
pub struct BroadcastStatus {
    /// One entry per distinct remote token reached, in snapshot order.
    pub reached: Vec<Arc<Peer>>,
    /// When the fan-out finished.
    pub timestamp: DateTime<Utc>,
    /// The message that was sent.
    pub payload: Payload,
}

/// Receipt for a unicast write.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub destination: Arc<Peer>,
    pub payload: Payload,
}

struct Codec {
    kind: Arc<str>,
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Registry of message kinds the mesh can carry.
#[derive(Default)]
pub struct MessageRegistry {
    by_kind: HashMap<Arc<str>, Arc<Codec>>,
    by_type: HashMap<TypeId, Arc<Codec>>,
}

impl MessageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `kind`, encoded as JSON.
    pub fn register<T>(&mut self, kind: &str) -> Result<&mut Self, MeshError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register_with::<T, _, _>(
            kind,
            |value| Ok(serde_json::to_vec(value)?),
            |bytes| Ok(serde_json::from_slice(bytes)?),
        )
    }

    /// Register `T` under `kind` with a custom codec.
    pub fn register_with<T, E, D>(
        &mut self,
        kind: &str,
        encode: E,
        decode: D,
    ) -> Result<&mut Self, MeshError>
    where
        T: Send + Sync + 'static,
        E: Fn(&T) -> Result<Vec<u8>, MeshError> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<T, MeshError> + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<T>();
        if kind.is_empty() || kind.len() > u16::MAX as usize {
            return Err(MeshError::InvalidConfig(format!(
                "message kind for {type_name} must be 1..={} bytes",
                u16::MAX
            )));
        }
        if self.by_kind.contains_key(kind) {
            return Err(MeshError::DuplicateMessageKind(kind.to_string()));
        }
        if self.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(MeshError::DuplicateMessageKind(type_name.to_string()));
        }

        let kind: Arc<str> = Arc::from(kind);
        let codec = Arc::new(Codec {
            kind: Arc::clone(&kind),
            type_name,
            encode: Arc::new(move |value: &(dyn Any + Send + Sync)| {
                let value = value.downcast_ref::<T>().ok_or_else(|| {
                    MeshError::UnregisteredMessage(format!("payload is not a {type_name}"))
                })?;
                encode(value)
            }),
            decode: Arc::new(move |bytes: &[u8]| {
                let value: AnyValue = Arc::new(decode(bytes)?);
                Ok(value)
            }),
        });
        tracing::debug!("Registering message kind {kind} for {type_name}");
        self.by_type.insert(TypeId::of::<T>(), Arc::clone(&codec));
        self.by_kind.insert(kind, codec);
        Ok(self)
    }

    /// Whether a codec is registered for `kind`.
    pub fn contains(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.by_kind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    /// Wrap `value` in a [`Payload`] tagged with its registered kind.
    pub fn payload<T: Any + Send + Sync>(&self, value: T) -> Result<Payload, MeshError> {
        let codec = self.by_type.get(&TypeId::of::<T>()).ok_or_else(|| {
            MeshError::UnregisteredMessage(std::any::type_name::<T>().to_string())
        })?;
        Ok(Payload {
            kind: Arc::clone(&codec.kind),
            value: Arc::new(value),
        })
    }

    /// Encode a payload into a complete message frame.
    pub(crate) fn encode_frame(&self, payload: &Payload) -> Result<Bytes, MeshError> {
        let codec = self
            .by_kind
            .get(payload.kind())
            .ok_or_else(|| MeshError::UnregisteredMessage(payload.kind().to_string()))?;
        let body = (codec.encode)(payload.value.as_ref())?;
        Frame::Message {
            kind: payload.kind().to_string(),
            body: Bytes::from(body),
        }
        .encode()
    }

    /// Decode the body of a message frame.
    pub(crate) fn decode(&self, kind: &str, body: &[u8]) -> Result<Payload, MeshError> {
        let codec = self
            .by_kind
            .get(kind)
            .ok_or_else(|| MeshError::UnregisteredMessage(kind.to_string()))?;
        let value = (codec.decode)(body)?;
        Ok(Payload {
            kind: Arc::clone(&codec.kind),
            value,
        })
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self
            .by_kind
            .values()
            .map(|c| (c.kind.as_ref(), c.type_name))
            .collect();
        kinds.sort();
        f.debug_struct("MessageRegistry").field("kinds", &kinds).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
