// =============================================================================
// LAGRANGE RELAY — predictor.rs
// «Predictive Synthesizer — strategy contract»
// =============================================================================
//
// Две взаимозаменяемые стратегии, выбор при конструировании:
//
//   Interpolator<Raster>   — dense displacement-field interpolation
//   Interpolator<Position> — the same contract on scalar telemetry
//   DeadReckoner           — fixed-cadence extrapolation with soft correction
//
// observe() runs on each verified real sample, tick() on the output cadence.
// Every Synthesis names its bracketing real parents and carries a confidence
// and an optional quality report.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;

use crate::dead_reckoning::{DeadReckoner, DeadReckoningConfig};
use crate::error::{RelayError, Result};
use crate::quality::{self, QualityReport};
use crate::raster::Raster;
use crate::sample::{Position, Sample, SequenceId};

pub const MAX_BUFFER_SIZE: usize = 10;
pub const DEFAULT_INTERPOLATION_FRAMES: usize = 2;
/// Mean displacement at which interpolation confidence reaches zero before clamping.
pub const DISPLACEMENT_SCALE: f64 = 50.0;
pub const MIN_INTERP_CONFIDENCE: f64 = 0.5;
pub const MAX_INTERP_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub payload: Vec<u8>,
    pub parents: Vec<SequenceId>,
    pub confidence: f64,
    pub quality: Option<QualityReport>,
}

pub trait Predictor: Send {
    fn version(&self) -> &'static str;

    /// Output cadence for tick-driven strategies; `None` means per-sample only.
    fn cadence(&self) -> Option<Duration> {
        None
    }

    fn observe(&mut self, sample: &Sample, now: f64) -> Result<Vec<Synthesis>>;

    fn tick(&mut self, _now: f64) -> Option<Synthesis> {
        None
    }
}

// -----------------------------------------------------------------------------
// Strategy selection
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Dense,
    Linear,
    DeadReckoning,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dense" | "optical-flow" => Ok(StrategyKind::Dense),
            "linear" => Ok(StrategyKind::Linear),
            "dead-reckoning" | "reckon" => Ok(StrategyKind::DeadReckoning),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Dense => "dense",
            StrategyKind::Linear => "linear",
            StrategyKind::DeadReckoning => "dead-reckoning",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictorConfig {
    pub strategy: StrategyKind,
    pub interpolation_frames: usize,
    pub buffer_capacity: usize,
    pub dead_reckoning: DeadReckoningConfig,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        PredictorConfig {
            strategy: StrategyKind::Dense,
            interpolation_frames: DEFAULT_INTERPOLATION_FRAMES,
            buffer_capacity: MAX_BUFFER_SIZE,
            dead_reckoning: DeadReckoningConfig::default(),
        }
    }
}

pub fn build_predictor(config: &PredictorConfig) -> Box<dyn Predictor> {
    match config.strategy {
        StrategyKind::Dense => Box::new(Interpolator::<Raster>::new(
            config.interpolation_frames,
            config.buffer_capacity,
        )),
        StrategyKind::Linear => Box::new(Interpolator::<Position>::new(
            config.interpolation_frames,
            config.buffer_capacity,
        )),
        StrategyKind::DeadReckoning => Box::new(DeadReckoner::new(config.dead_reckoning.clone())),
    }
}

// -----------------------------------------------------------------------------
// Interpolation strategy
// -----------------------------------------------------------------------------

pub trait Interpolable: Sized + Send {
    const VERSION: &'static str;

    fn decode(bytes: &[u8]) -> Result<Self>;
    fn encode(&self) -> Vec<u8>;

    /// States at α = i/(slots+1), i = 1..=slots, plus the mean displacement magnitude.
    fn interpolate(from: &Self, to: &Self, slots: usize) -> Result<(Vec<Self>, f64)>;

    fn assess(synthesized: &Self, reference: &Self) -> Result<QualityReport>;
}

/// Lower confidence for high motion, bounded to [0.5, 0.95].
pub fn interpolation_confidence(mean_displacement: f64) -> f64 {
    (1.0 - mean_displacement / DISPLACEMENT_SCALE).clamp(MIN_INTERP_CONFIDENCE, MAX_INTERP_CONFIDENCE)
}

pub struct Interpolator<P: Interpolable> {
    slots: usize,
    capacity: usize,
    history: VecDeque<(SequenceId, P)>,
}

impl<P: Interpolable> Interpolator<P> {
    pub fn new(slots: usize, capacity: usize) -> Self {
        Interpolator { slots, capacity: capacity.max(2), history: VecDeque::new() }
    }

    pub fn buffered(&self) -> usize {
        self.history.len()
    }

    fn is_reordered(&self, seq: &SequenceId) -> bool {
        match (self.history.back().and_then(|(last, _)| last.index()), seq.index()) {
            (Some(last), Some(incoming)) => incoming <= last,
            _ => false,
        }
    }
}

impl<P: Interpolable> Predictor for Interpolator<P> {
    fn version(&self) -> &'static str {
        P::VERSION
    }

    fn observe(&mut self, sample: &Sample, _now: f64) -> Result<Vec<Synthesis>> {
        if self.is_reordered(&sample.sequence_id) {
            log::debug!("↩️  sample [{}] arrived out of order, not buffered", sample.sequence_id);
            return Ok(Vec::new());
        }
        let state = P::decode(&sample.payload)?;
        self.history.push_back((sample.sequence_id.clone(), state));
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
        if self.history.len() < 2 {
            return Ok(Vec::new());
        }

        let (prev_id, prev) = &self.history[self.history.len() - 2];
        let (curr_id, curr) = &self.history[self.history.len() - 1];
        let (states, mean_displacement) = P::interpolate(prev, curr, self.slots)?;
        let confidence = interpolation_confidence(mean_displacement);

        Ok(states
            .iter()
            .map(|state| Synthesis {
                payload: state.encode(),
                parents: vec![prev_id.clone(), curr_id.clone()],
                confidence,
                quality: P::assess(state, curr)
                    .map_err(|e| log::warn!("📐 quality assessment skipped: {}", e))
                    .ok(),
            })
            .collect())
    }
}

impl Interpolable for Position {
    const VERSION: &'static str = "linear_interp_v1";

    fn decode(bytes: &[u8]) -> Result<Self> {
        Position::decode(bytes)
    }

    fn encode(&self) -> Vec<u8> {
        Position::encode(self)
    }

    fn interpolate(from: &Self, to: &Self, slots: usize) -> Result<(Vec<Self>, f64)> {
        if !(from.x.is_finite() && from.y.is_finite() && to.x.is_finite() && to.y.is_finite()) {
            return Err(RelayError::malformed("non-finite position"));
        }
        let states = (1..=slots)
            .map(|i| {
                let alpha = i as f64 / (slots + 1) as f64;
                Position::new(from.x + (to.x - from.x) * alpha, from.y + (to.y - from.y) * alpha)
            })
            .collect();
        Ok((states, from.distance(to)))
    }

    fn assess(synthesized: &Self, reference: &Self) -> Result<QualityReport> {
        Ok(quality::assess_position(synthesized, reference))
    }
}
