//! Domain layer for the budget threshold pipeline.
//!
//! Everything in this crate is pure: money and threshold value types, the
//! threshold evaluator, and the retry policy value object. I/O lives in the
//! storage, channel, and app crates.

pub mod evaluator;
pub mod retry;
pub mod types;
