//! Read-side event adapters (upcasting).

use super::payload::Payload;
use std::collections::HashMap;
use std::sync::Arc;

/// Turns one stored payload into zero or more logical events.
pub trait EventAdapter: Send + Sync {
    fn from_journal(&self, payload: Payload, manifest: &str) -> Vec<Payload>;
}

impl<F> EventAdapter for F
where
    F: Fn(Payload, &str) -> Vec<Payload> + Send + Sync,
{
    fn from_journal(&self, payload: Payload, manifest: &str) -> Vec<Payload> {
        self(payload, manifest)
    }
}

/// Adapters bound by manifest. Unbound manifests pass through unchanged.
#[derive(Clone, Default)]
pub struct EventAdapters {
    by_manifest: HashMap<String, Arc<dyn EventAdapter>>,
}

impl EventAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapt payloads stored under `manifest` with `adapter`.
    pub fn bind(mut self, manifest: impl Into<String>, adapter: Arc<dyn EventAdapter>) -> Self {
        self.by_manifest.insert(manifest.into(), adapter);
        self
    }

    /// Domain events for one stored payload.
    pub fn adapt(&self, payload: Payload, manifest: &str) -> Vec<Payload> {
        match self.by_manifest.get(manifest) {
            Some(adapter) => adapter.from_journal(payload, manifest),
            None => vec![payload],
        }
    }
}
