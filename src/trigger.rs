pub mod cron;
pub mod evaluator;
pub mod monitor;
pub mod schedule;

pub use evaluator::TriggerEvaluator;
pub use monitor::{MonitorRunner, MonitorSource};
