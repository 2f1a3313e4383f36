//! Metadata persisted next to every record body.

use super::serializer::Serializer;
use crate::error::{JournalError, Result};
use serde::{Deserialize, Serialize};

/// Which logical journal a record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalKind {
    Event,
    Snapshot,
}

/// Metadata of one stored record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub persistence_id: String,
    pub manifest: String,
    pub sequence_nr: u64,
    #[serde(default)]
    pub writer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Microseconds since Unix epoch.
    pub timestamp: i64,
    pub journal: JournalKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Identifier of the body serializer.
    #[serde(default = "default_serializer")]
    pub serializer: String,
}

fn default_serializer() -> String {
    "json".to_string()
}

impl EventMetadata {
    /// Encode with the metadata serializer.
    pub fn to_bytes(&self, serializer: &dyn Serializer) -> Result<Vec<u8>> {
        serializer.to_binary(&serde_json::to_value(self)?)
    }

    /// Decode; fails on bytes that are not journal metadata.
    pub fn from_bytes(bytes: &[u8], serializer: &dyn Serializer) -> Result<Self> {
        let value = serializer.from_binary(bytes)?;
        serde_json::from_value(value).map_err(|e| JournalError::Deserialization(e.to_string()))
    }
}
