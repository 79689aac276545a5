//! Persistence leaf of the colony coordination store.
//!
//! Owns the SQLite schema, connection pool, data models, categorized error
//! type, ID generation, and the per-table query modules. Query functions
//! take a live `&mut SqliteConnection` so the operation layer can compose
//! several of them inside one transaction.

pub mod config;
pub mod error;
pub mod ids;
pub mod models;
pub mod pool;
pub mod queries;
pub mod txn;

pub use error::{Result, StoreError};
