//! Provider-agnostic launcher for long-running autonomous coding workers.
//!
//! One capability contract — launch, status, logs, stop, list — over four
//! structurally different backends: GCE VMs (create + wait-for-operation
//! over REST), local Docker containers (daemon CLI), EC2 instances (CLI
//! with an SSM credential side channel), and Railway services (GraphQL
//! mutations). The architecture enforces a strict separation:
//!
//! - **[`provider`]**: the five-verb contract and the four adapters, each
//!   over an injectable transport so one conformance suite covers them all.
//! - **[`store`]**: durable object storage as the sole source of truth for
//!   worker state; live backend state and store state are reconciled,
//!   never destructively merged.
//! - **[`payload`]**: pure bootstrap-script generation with a structural
//!   escaping contract and no credential inputs.
//! - **[`launcher`]**: binds configuration, credential resolution, and one
//!   adapter into the operator operations.
//!
//! The worker side of the system lives in the `airlift-harness` crate.

pub mod auth;
pub mod config;
pub mod launcher;
pub mod logging;
pub mod payload;
pub mod provider;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
