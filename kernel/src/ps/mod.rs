//! Process Manager (ps)
//!
//! Environments and the table that owns them. Lifecycle transitions that
//! involve the scheduler (running, destroying, reaping) live in `ke`.

pub mod env;

pub use env::{Env, EnvTable, Lookup};
