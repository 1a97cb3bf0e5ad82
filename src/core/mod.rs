pub mod engine;
pub mod source;

pub use engine::SnapshotEngine;
pub use source::SourceId;
