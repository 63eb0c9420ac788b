// =============================================================================
// LAGRANGE RELAY — sample.rs
// =============================================================================
//
// Sample — атомарная единица потока.
//   SequenceId — integer for observed data, string tag for synthetic data
//   Sample     — id + origin timestamp + opaque payload
//   Position   — scalar telemetry payload (x, y)
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RelayError, Result};

/// Wall clock as float seconds since the epoch.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// -----------------------------------------------------------------------------
// SequenceId
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceId {
    Index(u64),
    Tag(String),
}

impl SequenceId {
    pub fn index(&self) -> Option<u64> {
        match self {
            SequenceId::Index(i) => Some(*i),
            SequenceId::Tag(_) => None,
        }
    }

    pub fn synthetic(counter: u64) -> Self {
        SequenceId::Tag(format!("synth_{}", counter))
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceId::Index(i) => write!(f, "{}", i),
            SequenceId::Tag(t) => write!(f, "{}", t),
        }
    }
}

impl From<u64> for SequenceId {
    fn from(i: u64) -> Self {
        SequenceId::Index(i)
    }
}

// -----------------------------------------------------------------------------
// Sample
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub sequence_id: SequenceId,
    pub timestamp: f64,
    pub payload: Vec<u8>,
    /// Declared length, bound into the real-sample signature.
    pub payload_size: usize,
}

impl Sample {
    pub fn new(sequence_id: impl Into<SequenceId>, timestamp: f64, payload: Vec<u8>) -> Self {
        let payload_size = payload.len();
        Sample { sequence_id: sequence_id.into(), timestamp, payload, payload_size }
    }

    pub fn size_consistent(&self) -> bool {
        self.payload_size == self.payload.len()
    }
}

// -----------------------------------------------------------------------------
// Position — telemetry payload
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Position { x, y }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn encode(&self) -> Vec<u8> {
        // two f64 fields cannot fail to serialize
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| RelayError::malformed(format!("telemetry payload: {}", e)))
    }
}
