//! # Relay Core
//!
//! Core types and error definitions for the relay dispatcher: task and batch
//! domain model, priority tiers, worker-type affinities, dead-letter records,
//! and the unified error taxonomy shared across all relay crates.

pub mod batch;
pub mod dead_letter;
pub mod error;
pub mod id;
pub mod task;

pub use batch::*;
pub use dead_letter::*;
pub use error::*;
pub use id::*;
pub use task::*;
