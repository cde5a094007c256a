pub mod engine;

pub use engine::{EngineSettings, EngineStatus, ExecutionEngine};
