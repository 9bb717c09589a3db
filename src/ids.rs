//! Id - process-unique identifiers for neurons and connections
//!
//! Identifiers are opaque, cheap to copy, and totally ordered. The ordering
//! matters: every id-keyed map in the object layer iterates in id order, so
//! kernel emission is deterministic across runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque unique identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Id(u64);

impl Id {
    /// Generate a fresh identifier, unique within the process
    pub fn generate() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let a = Id::generate();
        let b = Id::generate();
        let c = Id::generate();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(a < b && b < c);
    }
}
