//! Shared test utilities
#![allow(dead_code)]

mod fixtures;
mod registry;

pub use fixtures::*;
pub use registry::*;
