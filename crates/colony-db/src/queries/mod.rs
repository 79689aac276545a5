//! Per-table query functions.
//!
//! Every function takes a live `&mut SqliteConnection` so callers can
//! compose them inside a single transaction; the operation layer in
//! `colony-core` owns the transaction boundaries.

pub mod agent_state;
pub mod dependencies;
pub mod events;
pub mod leases;
pub mod projects;
pub mod retro;
pub mod tasks;

/// SQLite's bound-parameter ceiling; batched queries chunk their id lists
/// to stay under it.
pub(crate) const MAX_BIND_PARAMS: usize = 999;
