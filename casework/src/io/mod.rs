//! Side-effecting parts of the pipeline: storage, workers, and reasoning plumbing.

pub mod config;
pub mod fs;
pub mod metadata;
pub mod process;
pub mod prompt;
pub mod reasoner;
pub mod structured;
pub mod workers;
