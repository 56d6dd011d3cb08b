//! Download job model and registry

mod job;
mod registry;

pub use job::*;
pub use registry::JobRegistry;
