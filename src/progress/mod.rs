pub mod removal_progress;
