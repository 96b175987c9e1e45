//! Concurrency core: bounded fan-out collection and the stream bridge.

pub mod bridge;
pub mod error;
pub mod fanout;
pub mod retry;
pub mod traits;
pub mod types;
