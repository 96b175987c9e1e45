//! clusterscope: operational introspection for cluster runtimes.
//!
//! The crate pulls live state from an entity backend and from serialized
//! dumps, then renders human- or machine-readable summaries. Its core is a
//! small concurrency layer used in two shapes:
//!
//! * `core::fanout`: bounded fan-out: every entity is queried with two
//!   sequential calls by a fixed-size worker pool; per-entity failures are
//!   recorded without aborting the batch.
//! * `core::bridge`: a producer and a consumer connected by a bounded,
//!   backpressured in-memory channel, with both outcomes reconciled into one.
//!
//! ## Modules
//!
//! * `config`: TOML configuration with `validator` checks.
//! * `core`: the fan-out collector, the stream bridge, their traits and errors.
//! * `backend`: concrete entity backends (local procfs).
//! * `stream`: JSON-lines dump source and distribution sink for the bridge.
//! * `report`: text and JSON rendering.
//! * `logger`: `tracing` subscriber initialization.

pub mod backend;
pub mod config;
pub mod core;
pub mod logger;
pub mod report;
pub mod stream;
