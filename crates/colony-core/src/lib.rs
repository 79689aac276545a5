//! Operation layer of the colony coordination store.
//!
//! Every public operation composes `colony-db` query functions inside a
//! single transaction and is all-or-nothing: task registry CRUD with
//! optimistic versioning, dependency graph maintenance, lease management,
//! the claim-next scheduler, the close pipeline, the append-only event
//! journal, agent focus/checkpointing, the retrospective work queue, and
//! project namespace cleanup.
//!
//! The store is library-embedded: callers own the pool (see
//! `colony_db::pool::init_db`) and may invoke operations from any number
//! of tasks concurrently. Single-writer semantics for exclusive work come
//! from leases; lost updates are prevented by compare-and-swap on each
//! task's `version`.

pub mod checkpoint;
pub mod close;
pub mod graph;
pub mod journal;
pub mod lease;
pub mod project;
pub mod registry;
pub mod retro;
pub mod scheduler;

pub use colony_db::models;
pub use colony_db::{Result, StoreError};
