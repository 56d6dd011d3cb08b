//! Download orchestration

mod orchestrator;
mod task;

pub use orchestrator::{JobLimits, Orchestrator};
