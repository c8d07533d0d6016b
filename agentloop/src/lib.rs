//! Resilient, resumable execution loop for external coding agents.
//!
//! The crate runs an agent command line tool against tasks, one supervised
//! attempt at a time per slot. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (key parsing, model selection, the
//!   circuit state machine, output sub-parsers). No I/O.
//! - **[`io`]**: Side-effecting operations (config file, processes, git,
//!   checkpoints).
//!
//! Orchestration modules ([`breaker`], [`concurrency`], [`parse`], [`executor`],
//! [`resume`], [`looping`]) compose the two into attempts and task loops.

pub mod breaker;
pub mod cancel;
pub mod concurrency;
pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod parse;
pub mod resume;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
