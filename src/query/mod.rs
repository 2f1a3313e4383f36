//! Read-side building blocks: cursor/filter engine, stream source, envelope.

mod envelope;
pub mod filter;
pub mod source;

pub use envelope::EventEnvelope;
pub use filter::{decide, Decision, QueryFilter};
pub use source::{RecordStream, SourceOptions};
