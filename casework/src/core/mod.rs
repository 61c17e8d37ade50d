//! Deterministic, pure logic shared by the casework pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod completeness;
pub mod document_id;
pub mod heuristics;
pub mod plan;
pub mod quality;
pub mod stage;
pub mod types;
