//! Server-scoped entity ids and the monotonic id generator.
//!
//! An id is a `(generator, sequence)` pair of u32s. Every server owns one
//! generator number; all ids it mints share it, with sequences counting up
//! from 1. The textual form `[g.s]` (base 10) is what the transaction log
//! stores and is the only form the parser accepts.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A `(generator, sequence)` entity id.
///
/// Ordered lexicographically so the model can keep ids in ordered maps and
/// enumerate deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid {
    pub generator: u32,
    pub sequence: u32,
}

impl Uuid {
    /// The absent-id sentinel.
    pub const NULL: Uuid = Uuid {
        generator: 0,
        sequence: 0,
    };

    pub const fn new(generator: u32, sequence: u32) -> Self {
        Self {
            generator,
            sequence,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Uuid::NULL
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}.{}]", self.generator, self.sequence)
    }
}

/// Error for a textual id that is not of the form `[g.s]`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed id literal: {0:?}")]
pub struct ParseUuidError(pub String);

impl FromStr for Uuid {
    type Err = ParseUuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| ParseUuidError(s.to_string()))?;
        let (gen, seq) = inner
            .split_once('.')
            .ok_or_else(|| ParseUuidError(s.to_string()))?;
        let generator = gen.parse().map_err(|_| ParseUuidError(s.to_string()))?;
        let sequence = seq.parse().map_err(|_| ParseUuidError(s.to_string()))?;
        Ok(Uuid {
            generator,
            sequence,
        })
    }
}

/// Mints fresh ids for one server and tracks replayed ones.
///
/// Replayed entities arrive with externally supplied ids; `observe` advances
/// the counter past any id carrying our own generator number so fresh ids
/// never collide after a restart.
#[derive(Debug)]
pub struct IdentityGen {
    generator: u32,
    next_sequence: u32,
}

impl IdentityGen {
    pub fn new(generator: u32) -> Self {
        Self {
            generator,
            next_sequence: 1,
        }
    }

    pub fn generator(&self) -> u32 {
        self.generator
    }

    /// Mint the next id.
    pub fn next(&mut self) -> Uuid {
        let id = Uuid::new(self.generator, self.next_sequence);
        self.next_sequence += 1;
        id
    }

    /// Note an externally supplied id so future fresh ids skip past it.
    pub fn observe(&mut self, id: Uuid) {
        if id.generator == self.generator && id.sequence >= self.next_sequence {
            self.next_sequence = id.sequence + 1;
        }
    }
}
