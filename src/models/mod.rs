pub mod cache;
pub mod event;
pub mod result;
pub mod run;
pub mod source;

pub use cache::{CacheEntry, CacheStats};
pub use event::{Event, EventType};
pub use result::{ConfigResult, Protocol, SemanticHash};
pub use run::{RunRecord, RunStatus, StageDurations};
pub use source::{SourceMetadata, SourceState, Tier};
