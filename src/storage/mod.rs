//! Persistence of pipeline artifacts.

pub mod artifacts;
