//! simbackend: a simulated LLM backend for dry runs and tests.
//!
//! Answers come from per-model response surfaces in a JSON world file, not
//! from a network call.

pub mod executor;
pub mod world;

pub use executor::SimulatedExecutor;
pub use world::{ModelProfile, PromptProfile, ResponseProfile, SimWorld};
