pub mod dao;
pub mod memory;
pub mod models;

pub use dao::{AutoPublishStore, PgStore};
pub use memory::MemoryStore;
