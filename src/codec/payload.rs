//! Type-erased payloads and the persistent representation of an event.

use crate::types::Timestamp;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

/// A domain value of any registered type.
///
/// Cloning is cheap; the value itself is shared.
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Payload {
    /// Wrap a value of any type; registration is checked on write.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Wrap `inner` with a tag set.
    pub fn tagged<I, S>(inner: Payload, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Payload::new(Tagged {
            payload: inner,
            tags: tags.into_iter().map(Into::into).collect(),
        })
    }

    /// The value, if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Type id of the concrete value.
    pub fn value_type_id(&self) -> TypeId {
        (*self.value).type_id()
    }

    /// Fully-qualified name of the concrete type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload<{}>", self.type_name)
    }
}

/// Marker wrapping a payload with the tags it should be indexed under.
#[derive(Clone, Debug)]
pub struct Tagged {
    pub payload: Payload,
    pub tags: BTreeSet<String>,
}

/// Reference to an actor, carried as its path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SenderRef {
    path: String,
}

impl SenderRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Resolves serialized sender paths against the live actor registry.
pub trait SenderResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Option<SenderRef>;
}

/// Resolver that trusts every path.
#[derive(Clone, Copy, Debug, Default)]
pub struct PathResolver;

impl SenderResolver for PathResolver {
    fn resolve(&self, path: &str) -> Option<SenderRef> {
        Some(SenderRef::new(path))
    }
}

/// Resolver backed by a set of live actor paths.
#[derive(Debug, Default)]
pub struct ActorRegistry {
    live: RwLock<HashSet<String>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` as a live actor and return its reference.
    pub fn register(&self, path: impl Into<String>) -> SenderRef {
        let path = path.into();
        self.live.write().insert(path.clone());
        SenderRef::new(path)
    }

    /// Forget `path`; later lookups resolve to nothing.
    pub fn unregister(&self, path: &str) {
        self.live.write().remove(path);
    }
}

impl SenderResolver for ActorRegistry {
    fn resolve(&self, path: &str) -> Option<SenderRef> {
        if self.live.read().contains(path) {
            Some(SenderRef::new(path))
        } else {
            None
        }
    }
}

/// An event as the journal sees it.
#[derive(Clone, Debug)]
pub struct PersistentRepr {
    pub payload: Payload,
    pub persistence_id: String,
    pub sequence_nr: u64,
    /// Filled in by the codec on write; the stored manifest on read.
    pub manifest: String,
    pub writer_id: String,
    pub sender: Option<SenderRef>,
    pub timestamp: Timestamp,
    /// Tags decoded from metadata. On write, tags come from a [`Tagged`] payload.
    pub tags: BTreeSet<String>,
}

impl PersistentRepr {
    /// Event `sequence_nr` of `persistence_id`, stamped now.
    pub fn new(payload: Payload, persistence_id: impl Into<String>, sequence_nr: u64) -> Self {
        Self {
            payload,
            persistence_id: persistence_id.into(),
            sequence_nr,
            manifest: String::new(),
            writer_id: String::new(),
            sender: None,
            timestamp: Timestamp::now(),
            tags: BTreeSet::new(),
        }
    }

    /// Attach the sender of the command that produced the event.
    pub fn with_sender(mut self, sender: SenderRef) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Override the writer id; otherwise the codec's is used.
    pub fn with_writer_id(mut self, writer_id: impl Into<String>) -> Self {
        self.writer_id = writer_id.into();
        self
    }
}
