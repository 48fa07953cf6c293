//! Order id generation.
//!
//! Order ids are 63-bit snowflake identifiers:
//!
//! ```text
//! | 41 bits: ms since epoch | 10 bits: node | 12 bits: sequence |
//! ```
//!
//! Ids from one node are strictly increasing. Ids from different nodes are
//! unique and ordered by millisecond.

use crate::ids::OrderId;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default epoch (2010-11-04T01:42:54.657Z), in Unix milliseconds.
pub const DEFAULT_EPOCH_MS: i64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

/// Largest valid node id.
pub const MAX_NODE_ID: i64 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const NODE_SHIFT: u32 = SEQUENCE_BITS;
const TIME_SHIFT: u32 = NODE_BITS + SEQUENCE_BITS;

/// Generator of globally unique, time-ordered order ids.
pub trait IdGenerator: Send + Sync {
    /// Produce the next id.
    fn next_id(&self) -> OrderId;
}

/// Errors from configuring an id generator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdGeneratorError {
    /// Node id outside `0..=MAX_NODE_ID`
    #[error("Node id {0} out of range 0..={MAX_NODE_ID}")]
    InvalidNodeId(i64),
}

#[derive(Debug)]
struct SnowflakeState {
    last_ms: i64,
    sequence: i64,
}

/// Snowflake id generator for one node.
///
/// When the wall clock moves backwards the generator keeps issuing ids from
/// its last timestamp. When a millisecond's sequence is exhausted it moves
/// its logical timestamp one millisecond ahead instead of sleeping.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    node_id: i64,
    epoch_ms: i64,
    state: Mutex<SnowflakeState>,
}

impl SnowflakeGenerator {
    /// Create a generator for `node_id` with the default epoch.
    ///
    /// # Errors
    ///
    /// Returns [`IdGeneratorError::InvalidNodeId`] if `node_id` does not fit in 10 bits.
    pub fn new(node_id: i64) -> Result<Self, IdGeneratorError> {
        Self::with_epoch(node_id, DEFAULT_EPOCH_MS)
    }

    /// Create a generator with a custom epoch (Unix milliseconds).
    ///
    /// # Errors
    ///
    /// Returns [`IdGeneratorError::InvalidNodeId`] if `node_id` does not fit in 10 bits.
    pub fn with_epoch(node_id: i64, epoch_ms: i64) -> Result<Self, IdGeneratorError> {
        if !(0..=MAX_NODE_ID).contains(&node_id) {
            return Err(IdGeneratorError::InvalidNodeId(node_id));
        }

        Ok(Self {
            node_id,
            epoch_ms,
            state: Mutex::new(SnowflakeState {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    /// Node id embedded in every id.
    #[must_use]
    pub const fn node_id(&self) -> i64 {
        self.node_id
    }

    /// Split an id into `(ms since epoch, node, sequence)`.
    #[must_use]
    pub const fn decompose(id: OrderId) -> (i64, i64, i64) {
        let raw = id.0;
        (
            raw >> TIME_SHIFT,
            (raw >> NODE_SHIFT) & MAX_NODE_ID,
            raw & SEQUENCE_MASK,
        )
    }

    #[allow(clippy::cast_possible_truncation)] // ms since 1970 fits in i64 for millions of years
    fn now_ms(&self) -> i64 {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as i64;
        unix_ms - self.epoch_ms
    }

    fn next_at(&self, now_ms: i64) -> OrderId {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut timestamp = now_ms.max(state.last_ms);
        if timestamp == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                timestamp += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = timestamp;

        OrderId((timestamp << TIME_SHIFT) | (self.node_id << NODE_SHIFT) | state.sequence)
    }
}

impl IdGenerator for SnowflakeGenerator {
    fn next_id(&self) -> OrderId {
        self.next_at(self.now_ms())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_nodes() {
        assert_eq!(
            SnowflakeGenerator::new(1024).unwrap_err(),
            IdGeneratorError::InvalidNodeId(1024)
        );
        assert!(SnowflakeGenerator::new(-1).is_err());
        assert!(SnowflakeGenerator::new(MAX_NODE_ID).is_ok());
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = SnowflakeGenerator::new(3).unwrap();
        let mut previous = generator.next_id();
        for _ in 0..10_000 {
            let next = generator.next_id();
            assert!(next > previous, "{next} should follow {previous}");
            previous = next;
        }
    }

    #[test]
    fn embeds_node_id() {
        let generator = SnowflakeGenerator::new(77).unwrap();
        let (_, node, _) = SnowflakeGenerator::decompose(generator.next_id());
        assert_eq!(node, 77);
    }

    #[test]
    fn clock_regression_keeps_ordering() {
        let generator = SnowflakeGenerator::new(1).unwrap();
        let first = generator.next_at(5_000);
        let second = generator.next_at(4_000);

        assert!(second > first);
        assert_eq!(SnowflakeGenerator::decompose(second).0, 5_000);
    }

    #[test]
    fn sequence_exhaustion_borrows_next_millisecond() {
        let generator = SnowflakeGenerator::new(1).unwrap();
        let mut last = generator.next_at(100);
        for _ in 0..SEQUENCE_MASK {
            last = generator.next_at(100);
        }
        assert_eq!(SnowflakeGenerator::decompose(last), (100, 1, SEQUENCE_MASK));

        let rolled = generator.next_at(100);
        assert_eq!(SnowflakeGenerator::decompose(rolled), (101, 1, 0));
        assert!(rolled > last);
    }
}
