//! Staged compliance-document pipeline with a planning supervisor.
//!
//! Documents move through intake, extraction and classification under a
//! planner that builds and adapts an execution plan per request. The layout:
//!
//! - **[`core`]**: Pure, deterministic logic (document ids, stage order, scoring,
//!   plan rules). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (metadata store, workers, reasoning
//!   provider, config). Isolated behind traits so tests can substitute fakes.
//!
//! Orchestration modules ([`blackboard`], [`agents`], [`planner`], [`feedback`],
//! [`session`]) coordinate core logic with I/O to serve requests.

pub mod agents;
pub mod blackboard;
pub mod core;
pub mod exit_codes;
pub mod feedback;
pub mod io;
pub mod logging;
pub mod planner;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
