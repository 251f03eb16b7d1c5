pub mod config;
pub mod core;
pub mod progress;
pub mod result;
pub mod utils;

pub use crate::core::appx::identity::PackageTarget;
pub use crate::core::cancel::CancelFlag;
pub use crate::core::removal::orchestrator::{RemovalOrchestrator, RemovalOutcome, RemovalReport};
pub use crate::progress::removal_progress::ProgressCb;
