// Durable storage behind the session registry: the shared instances table and
// the per-session block stores.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStorage;
pub use sqlite::{SqliteBlocks, SqliteRegistry};
pub use traits::{Block, BlockStorage, RegistryStore, SessionId, SessionRecord};
