//! Small, dependency-free utility types shared across modules.

pub mod types;
