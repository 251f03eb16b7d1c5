pub mod analysis;
pub mod batch;
pub mod orchestrator;
