pub mod pipeline;
pub mod source;
pub mod transport;

pub use pipeline::HttpPipelineRunner;
pub use source::HttpMonitorSource;
pub use transport::{HttpUploadTransport, MockUploadTransport, UploadTransport};
