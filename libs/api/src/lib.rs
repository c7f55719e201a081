//! # gantry-api
//!
//! Wire contract for the gantry cluster core: the request/response types
//! exchanged between the master (scheduler), the per-node engine (container
//! runtime agent), and the per-container initd (process supervisor).
//!
//! ## Design Principles
//!
//! - Every type is plain data with a stable serde representation; no
//!   behavior beyond small helpers.
//! - Domain failures travel inside responses as `(reason, message)` pairs,
//!   one reason vocabulary per call surface, serialized snake_case.
//! - Required vs. optional fields are fixed here, so every component
//!   validates the same shape at its boundary.

mod container;
mod process;
mod scheduler;

pub use container::*;
pub use process::*;
pub use scheduler::*;
