//! # ccrelay-core
//!
//! The request-lifecycle engine behind ccrelay: a programmable reverse
//! proxy for LLM API traffic. Given an inbound request this crate
//! classifies it, applies provider-specific transformation, admits it
//! onto a bounded per-route worker pool, executes the upstream call, and
//! hands back a tagged result for the binary crate to write out.
//!
//! ## Module organization
//!
//! - [`config`] — the `Config` snapshot contract, its JSON loader, and
//!   atomic hot-reload handle
//! - [`classify`] — method+path+header classification into
//!   `{Block, Passthrough, Route}`
//! - [`matcher`] — glob-to-regex path matching shared by the classifier
//!   and the model maps
//! - [`transform`] — model-map rewriting, VL-map selection, and header
//!   injection for `inject`-mode providers
//! - [`task`] — the unit of scheduled work and its lifecycle states
//! - [`queue`] — the priority queue backing each route-queue key
//! - [`concurrency`] — the worker-pool manager: admission, waiting,
//!   dispatch, and cancellation
//! - [`executor`] — the outbound HTTP call: SSE detection, streaming,
//!   the single 429 retry
//! - [`writer`] — converts a tagged proxy result into an `HttpResponse`
//! - [`coordination`] — the Leader/Follower WebSocket channel for
//!   provider-switch notifications across instances
//! - [`orchestrator`] — ties the above together into one call per
//!   request
//! - [`logs`] — structured console logging and the request log sink
//! - [`error`] — the `thiserror`-derived error enums for each layer

pub mod classify;
pub mod concurrency;
pub mod config;
pub mod coordination;
pub mod error;
pub mod executor;
pub mod logs;
pub mod matcher;
pub mod orchestrator;
pub mod queue;
pub mod task;
pub mod transform;
pub mod writer;
