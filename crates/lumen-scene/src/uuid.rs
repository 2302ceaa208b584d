//! Persistent entity identifiers.
//!
//! A [`Uuid`] is a random, non-zero 64-bit value assigned to an entity when it
//! is created and kept across save/load and edit/play transitions. Zero is
//! reserved as the "unset" reference and is never produced by [`Uuid::new`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A persistent, non-zero entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Uuid(u64);

impl Uuid {
    /// Generate a fresh random identifier. Never returns zero.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let raw: u64 = rng.gen();
            if raw != 0 {
                return Self(raw);
            }
        }
    }

    /// Wrap a raw value. Returns `None` for zero, the unset reference.
    #[inline]
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl Default for Uuid {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<u64> for Uuid {
    type Error = String;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Self::from_raw(raw).ok_or_else(|| "entity uuid must be non-zero".to_owned())
    }
}

impl From<Uuid> for u64 {
    fn from(id: Uuid) -> Self {
        id.0
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({:016x})", self.0)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_non_zero_and_distinct() {
        let ids: Vec<Uuid> = (0..256).map(|_| Uuid::new()).collect();
        assert!(ids.iter().all(|id| id.to_raw() != 0));
        let mut raw: Vec<u64> = ids.iter().map(|id| id.to_raw()).collect();
        raw.sort_unstable();
        raw.dedup();
        assert_eq!(raw.len(), 256);
    }

    #[test]
    fn zero_is_not_a_uuid() {
        assert_eq!(Uuid::from_raw(0), None);
        assert_eq!(Uuid::from_raw(7).map(Uuid::to_raw), Some(7));
    }

    #[test]
    fn serializes_as_plain_number() {
        let id = Uuid::from_raw(42).unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: Uuid = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<Uuid>("0").is_err());
    }
}
