//! Stream stages plugged into the bridge: a JSON-lines dump producer and a
//! distribution reducer.

pub mod distribution;
pub mod dump;
