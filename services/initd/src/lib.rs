//! Per-container init supervisor.
//!
//! One initd runs inside each container's execution context. It exposes a
//! small HTTP surface for forking processes under a requested identity and
//! for inspecting or signalling the resulting process table.

pub mod api;
pub mod config;
pub mod error;
pub mod supervisor;
