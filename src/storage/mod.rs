pub mod segment;
pub mod segment_dir;

pub use segment::Segment;
pub use segment_dir::{SegmentDirEngine, SegmentSnapshot};
