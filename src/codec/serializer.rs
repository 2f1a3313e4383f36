//! Pluggable byte serializers.
//!
//! A serializer turns the structural form of a value (`serde_json::Value`)
//! into bytes and back. Serializers are selected by identifier; an unknown
//! identifier resolves to the registry's default.

use crate::error::{JournalError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Byte serializer strategy.
pub trait Serializer: Send + Sync {
    /// Stable identifier written into event metadata.
    fn identifier(&self) -> &str;

    fn to_binary(&self, value: &Value) -> Result<Vec<u8>>;

    fn from_binary(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn identifier(&self) -> &str {
        "json"
    }

    fn to_binary(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn from_binary(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| JournalError::Deserialization(e.to_string()))
    }
}

/// MessagePack bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn identifier(&self) -> &str {
        "msgpack"
    }

    fn to_binary(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn from_binary(&self, bytes: &[u8]) -> Result<Value> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Registration map of serializers with an explicit default.
#[derive(Clone)]
pub struct SerializerRegistry {
    by_id: HashMap<String, Arc<dyn Serializer>>,
    default: Arc<dyn Serializer>,
}

impl SerializerRegistry {
    /// Registry holding the built-in serializers, defaulting to `default_id`
    /// (or JSON when `default_id` is unknown).
    pub fn with_default(default_id: &str) -> Self {
        let mut registry = Self {
            by_id: HashMap::new(),
            default: Arc::new(JsonSerializer),
        };
        registry.register(Arc::new(JsonSerializer));
        registry.register(Arc::new(MessagePackSerializer));
        registry.default = registry.resolve(default_id);
        registry
    }

    /// Add or replace a serializer under its identifier.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) {
        self.by_id
            .insert(serializer.identifier().to_string(), serializer);
    }

    /// Look up a serializer, falling back to the default.
    pub fn resolve(&self, id: &str) -> Arc<dyn Serializer> {
        match self.by_id.get(id) {
            Some(serializer) => Arc::clone(serializer),
            None => {
                warn!(
                    serializer = id,
                    fallback = self.default.identifier(),
                    "serializer not found, using default"
                );
                Arc::clone(&self.default)
            }
        }
    }

    /// Serializer used when nothing else is bound.
    pub fn default_serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.default)
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_default("json")
    }
}
