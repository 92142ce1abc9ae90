// Byte sinks: in-memory buffers, external file handles, and the durable block store.

pub mod block_sink;
pub mod handle_sink;
pub mod memory_sink;
pub mod traits;

pub use block_sink::{BlockRef, BlockSink};
pub use handle_sink::{EntryWriter, FileEntry, FsEntry, FsWriter, HandleSink};
pub use memory_sink::MemorySink;
pub use traits::{Blob, ByteSink};
