// Byte sources: in-memory buffers, whole-resource downloads, and HTTP range reads.

pub mod http_range_source;
pub mod http_source;
pub mod memory_source;
pub mod traits;

pub use http_range_source::HttpRangeSource;
pub use http_source::HttpSource;
pub use memory_source::MemorySource;
pub use traits::{ByteRangeSource, SourceDescriptor, SourceInfo};
