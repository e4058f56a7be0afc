use crate::{QueueError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A pluggable encode/decode implementation identified by a stable tag.
///
/// Backends exchange task arguments as `serde_json::Value`, the
/// process-internal interchange type, so an implementation must use a
/// self-describing format.
pub trait SerializationBackend: Send + Sync + std::fmt::Debug {
    /// Stable tag stored in the envelope's `backend_tag` field.
    fn tag(&self) -> &str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON backend, the default.
#[derive(Debug)]
pub struct JsonBackend;

impl SerializationBackend for JsonBackend {
    fn tag(&self) -> &str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| QueueError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::Decode(e.to_string()))
    }
}

/// YAML backend, mostly useful where payloads are inspected by hand.
#[derive(Debug)]
pub struct YamlBackend;

impl SerializationBackend for YamlBackend {
    fn tag(&self) -> &str {
        "yaml"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| QueueError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_yaml::from_slice(bytes).map_err(|e| QueueError::Decode(e.to_string()))
    }
}

/// Table of serialization backends keyed by tag, with one designated default.
///
/// Populated once at startup, then shared immutably (`Arc`) between the
/// publisher and workers.
pub struct SerializationRegistry {
    backends: HashMap<String, Arc<dyn SerializationBackend>>,
    default_tag: String,
}

impl SerializationRegistry {
    /// Build a registry whose default is the given backend.
    pub fn new(default_backend: Arc<dyn SerializationBackend>) -> Result<Self> {
        let default_tag = default_backend.tag().to_string();
        if default_tag.is_empty() {
            return Err(QueueError::EmptyBackendTag);
        }

        let mut backends = HashMap::new();
        backends.insert(default_tag.clone(), default_backend);
        Ok(SerializationRegistry {
            backends,
            default_tag,
        })
    }

    /// Registry with only the JSON backend.
    pub fn json_only() -> Self {
        SerializationRegistry {
            backends: HashMap::from([(
                "json".to_string(),
                Arc::new(JsonBackend) as Arc<dyn SerializationBackend>,
            )]),
            default_tag: "json".to_string(),
        }
    }

    /// Add a backend. Tags are globally unique.
    pub fn register(&mut self, backend: Arc<dyn SerializationBackend>) -> Result<()> {
        let tag = backend.tag().to_string();
        if tag.is_empty() {
            return Err(QueueError::EmptyBackendTag);
        }
        if self.backends.contains_key(&tag) {
            return Err(QueueError::DuplicateTag(tag));
        }
        self.backends.insert(tag, backend);
        Ok(())
    }

    /// Backend to encode with: the override if given, else the default.
    pub fn resolve_for_encode(
        &self,
        override_tag: Option<&str>,
    ) -> Result<Arc<dyn SerializationBackend>> {
        let tag = override_tag.unwrap_or(&self.default_tag);
        self.backends
            .get(tag)
            .cloned()
            .ok_or_else(|| QueueError::UnknownBackend(tag.to_string()))
    }

    /// Backend named by an incoming envelope. An unknown tag here is fatal
    /// for the message: this consumer cannot process it and must dead-letter
    /// it rather than retry.
    pub fn resolve_for_decode(&self, tag: &str) -> Result<Arc<dyn SerializationBackend>> {
        self.backends
            .get(tag)
            .cloned()
            .ok_or_else(|| QueueError::UnknownBackend(tag.to_string()))
    }

    pub fn default_tag(&self) -> &str {
        &self.default_tag
    }
}
