//! Worker-side runtime for airlift agents.
//!
//! A freshly created compute unit boots into this crate's binary and runs
//! the continuous execution loop: decompose the task spec into a feature
//! list, then implement one feature per session until the list is complete
//! or the iteration budget runs out. All externally visible state lives in
//! the durable store (`agents/{agent_id}/...`), not in the worker — the
//! orchestrator never calls into a running worker, and a replacement
//! worker resumes from whatever the last sync flushed.
//!
//! The crate also exports the pieces the orchestrator shares with the
//! worker: the state model ([`state`]), the store key layout, and the
//! bounded-output process helper ([`process`]).

pub mod features;
pub mod logging;
pub mod looping;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod session;
pub mod state;
pub mod store;
pub mod sync;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
