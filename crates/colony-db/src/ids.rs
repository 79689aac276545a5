//! Generation of monotonic-prefixed globally-unique IDs.
//!
//! IDs have the form `{prefix}_{unix_nanos}_{12 hex}`: the nanosecond
//! timestamp keeps them roughly sortable by creation time, and the random
//! suffix guards against same-instant collisions.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// Prefix for task IDs.
pub const TASK_PREFIX: &str = "task";

/// Prefix for project IDs.
pub const PROJECT_PREFIX: &str = "proj";

/// Prefix for retrospective job IDs.
pub const RETRO_PREFIX: &str = "retro";

/// Random bytes appended after the timestamp (12 hex characters).
const RANDOM_BYTES: usize = 6;

/// Generate a new globally-unique ID with the given prefix.
///
/// Panics if the system clock predates the unix epoch or the OS entropy
/// source fails; a degraded random suffix would silently collapse
/// uniqueness to the timestamp, so both are treated as fatal.
pub fn new_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_nanos();

    let mut suffix = [0u8; RANDOM_BYTES];
    rand::rng().fill_bytes(&mut suffix);

    format!("{prefix}_{nanos}_{}", hex::encode(suffix))
}
