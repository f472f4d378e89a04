pub mod memory_store;
pub mod message_archive;
pub mod redis_store;

pub use memory_store::InMemorySessionStore;
pub use message_archive::DiscardingMessageArchive;
pub use redis_store::RedisSessionStore;
