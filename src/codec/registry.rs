//! Manifest registry.
//!
//! Maps a stable manifest string to the functions that turn a payload of
//! the registered type into its structural form and back. Populated at
//! startup; an unknown manifest on read is a plain lookup miss.

use super::payload::Payload;
use crate::error::{JournalError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

type ToValueFn = fn(&Payload) -> Result<Value>;
type FromValueFn = fn(Value) -> Result<Payload>;

/// Registration of one payload type.
pub struct TypeEntry {
    manifest: String,
    type_tag: String,
    serializer: Option<String>,
    to_value: ToValueFn,
    from_value: FromValueFn,
}

impl TypeEntry {
    /// Stable name stored with every record of this type.
    pub fn manifest(&self) -> &str {
        &self.manifest
    }

    /// Short record type written to the store.
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Serializer bound to this type, if any.
    pub fn serializer(&self) -> Option<&str> {
        self.serializer.as_deref()
    }

    /// Structural form of `payload`; fails if it is not of this type.
    pub fn to_value(&self, payload: &Payload) -> Result<Value> {
        (self.to_value)(payload)
    }

    /// Rebuild a payload from its structural form.
    pub fn from_value(&self, value: Value) -> Result<Payload> {
        (self.from_value)(value)
    }
}

impl std::fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeEntry")
            .field("manifest", &self.manifest)
            .field("type_tag", &self.type_tag)
            .field("serializer", &self.serializer)
            .finish()
    }
}

/// Registry of payload types by manifest and by Rust type.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    by_manifest: HashMap<String, Arc<TypeEntry>>,
    by_type: HashMap<TypeId, Arc<TypeEntry>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its fully-qualified type name (which includes the
    /// defining crate).
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        self.insert::<T>(std::any::type_name::<T>().to_string(), None)
    }

    /// Register `T` under an explicit manifest.
    pub fn register_as<T>(&mut self, manifest: impl Into<String>) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        self.insert::<T>(manifest.into(), None)
    }

    /// Register `T` under an explicit manifest, bound to a serializer.
    pub fn register_with_serializer<T>(
        &mut self,
        manifest: impl Into<String>,
        serializer: impl Into<String>,
    ) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        self.insert::<T>(manifest.into(), Some(serializer.into()))
    }

    fn insert<T>(&mut self, manifest: String, serializer: Option<String>) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        let entry = Arc::new(TypeEntry {
            type_tag: type_tag(std::any::type_name::<T>()),
            manifest: manifest.clone(),
            serializer,
            to_value: encode_value::<T>,
            from_value: decode_value::<T>,
        });
        self.by_manifest.insert(manifest, Arc::clone(&entry));
        self.by_type.insert(TypeId::of::<T>(), entry);
        self
    }

    /// Entry for a manifest read from the store.
    pub fn by_manifest(&self, manifest: &str) -> Option<Arc<TypeEntry>> {
        self.by_manifest.get(manifest).cloned()
    }

    /// Entry for the concrete type of a payload about to be written.
    pub fn for_payload(&self, payload: &Payload) -> Result<Arc<TypeEntry>> {
        self.by_type
            .get(&payload.value_type_id())
            .cloned()
            .ok_or_else(|| JournalError::TypeNotRegistered(payload.type_name().to_string()))
    }

    /// Number of registered manifests.
    pub fn len(&self) -> usize {
        self.by_manifest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_manifest.is_empty()
    }
}

fn encode_value<T>(payload: &Payload) -> Result<Value>
where
    T: Serialize + Any,
{
    let value = payload.downcast_ref::<T>().ok_or_else(|| {
        JournalError::Serialization(format!(
            "payload {} is not a {}",
            payload.type_name(),
            std::any::type_name::<T>()
        ))
    })?;
    Ok(serde_json::to_value(value)?)
}

fn decode_value<T>(value: Value) -> Result<Payload>
where
    T: DeserializeOwned + Any + Send + Sync,
{
    let decoded: T = serde_json::from_value(value)
        .map_err(|e| JournalError::Deserialization(e.to_string()))?;
    Ok(Payload::new(decoded))
}

/// Lower-camel-cased short name of a type: `shop::events::OrderPlaced` →
/// `orderPlaced`. Generic arguments are dropped.
pub fn type_tag(type_name: &str) -> String {
    let without_generics = type_name.split('<').next().unwrap_or(type_name);
    let short = without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics);
    let mut chars = short.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
