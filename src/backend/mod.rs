//! Concrete entity backends.

pub mod procfs;
