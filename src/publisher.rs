pub mod daemon;
pub mod heap;

pub use daemon::{PublishCommand, PublishScheduler, PublisherHandle, PublisherSettings};
pub use heap::PublishHeap;
