// =============================================================================
// LAGRANGE RELAY — dead_reckoning.rs
// «Dead reckoning with soft correction»
// =============================================================================
//
// Две петли над одним состоянием:
//
//   observe()  — ingest: velocity from the last two real positions, project the
//                stale sample forward by its age, arm correction toward it
//   tick()     — output cadence: extrapolate when stale, ease 10% toward the
//                target, always emit
//
// The predicted position never jumps; a new real sample only moves the target.
// =============================================================================

use std::time::Duration;

use crate::error::Result;
use crate::predictor::{Predictor, Synthesis};
use crate::quality;
use crate::sample::{Position, Sample, SequenceId};

pub const VERSION: &str = "dead_reckoning_v1";

#[derive(Debug, Clone, PartialEq)]
pub struct DeadReckoningConfig {
    pub output_rate_hz: f64,
    /// Seconds without a real update before pure extrapolation starts.
    pub staleness_threshold: f64,
    /// Units per output tick.
    pub nominal_speed: f64,
    /// A per-axis delta larger than this is read as a direction reversal.
    pub wrap_threshold: f64,
    pub correction_gain: f64,
    pub epsilon: f64,
    /// Age in seconds at which confidence reaches the floor.
    pub confidence_horizon: f64,
    pub confidence_floor: f64,
}

impl Default for DeadReckoningConfig {
    fn default() -> Self {
        DeadReckoningConfig {
            output_rate_hz: 30.0,
            staleness_threshold: 0.1,
            nominal_speed: 2.0,
            wrap_threshold: 200.0,
            correction_gain: 0.1,
            epsilon: 0.5,
            confidence_horizon: 2.0,
            confidence_floor: 0.1,
        }
    }
}

impl DeadReckoningConfig {
    /// Sign of the step along one axis, reversed when the jump looks like a wrap.
    fn direction(&self, delta: f64) -> f64 {
        if delta == 0.0 || !delta.is_finite() {
            return 0.0;
        }
        let sign = delta.signum();
        if delta.abs() > self.wrap_threshold {
            -sign
        } else {
            sign
        }
    }

    pub fn confidence(&self, age: f64) -> f64 {
        let horizon = if self.confidence_horizon > 0.0 { self.confidence_horizon } else { 1.0 };
        (1.0 - age.max(0.0) / horizon).max(self.confidence_floor)
    }
}

#[derive(Debug, Clone)]
struct ReckonState {
    last_real: Position,
    last_id: SequenceId,
    prev_id: Option<SequenceId>,
    predicted: Position,
    velocity: Position,
    target: Position,
    correcting: bool,
    last_update: f64,
}

pub struct DeadReckoner {
    config: DeadReckoningConfig,
    state: Option<ReckonState>,
}

impl DeadReckoner {
    pub fn new(config: DeadReckoningConfig) -> Self {
        DeadReckoner { config, state: None }
    }

    pub fn predicted(&self) -> Option<Position> {
        self.state.as_ref().map(|s| s.predicted)
    }

    pub fn velocity(&self) -> Option<Position> {
        self.state.as_ref().map(|s| s.velocity)
    }

    pub fn is_correcting(&self) -> bool {
        self.state.as_ref().map(|s| s.correcting).unwrap_or(false)
    }
}

impl Predictor for DeadReckoner {
    fn version(&self) -> &'static str {
        VERSION
    }

    fn cadence(&self) -> Option<Duration> {
        let rate = self.config.output_rate_hz;
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 30.0 };
        Some(Duration::from_secs_f64(1.0 / rate))
    }

    fn observe(&mut self, sample: &Sample, now: f64) -> Result<Vec<Synthesis>> {
        let pos = Position::decode(&sample.payload)?;
        let cfg = &self.config;

        if let Some(state) = &self.state {
            if let (Some(last), Some(incoming)) = (state.last_id.index(), sample.sequence_id.index()) {
                if incoming <= last {
                    log::debug!("↩️  sample [{}] older than [{}], not used", incoming, last);
                    return Ok(Vec::new());
                }
            }
        }

        let velocity = match &self.state {
            Some(state) => Position::new(
                cfg.nominal_speed * cfg.direction(pos.x - state.last_real.x),
                cfg.nominal_speed * cfg.direction(pos.y - state.last_real.y),
            ),
            None => Position::default(),
        };
        // age in output ticks
        let ticks = (now - sample.timestamp).max(0.0) * cfg.output_rate_hz;
        let target = Position::new(pos.x + velocity.x * ticks, pos.y + velocity.y * ticks);

        let (predicted, prev_id) = match self.state.take() {
            Some(state) => (state.predicted, Some(state.last_id)),
            None => (pos, None),
        };
        self.state = Some(ReckonState {
            last_real: pos,
            last_id: sample.sequence_id.clone(),
            prev_id,
            predicted,
            velocity,
            target,
            correcting: true,
            last_update: now,
        });
        Ok(Vec::new())
    }

    fn tick(&mut self, now: f64) -> Option<Synthesis> {
        let cfg = &self.config;
        let state = self.state.as_mut()?;
        let age = (now - state.last_update).max(0.0);

        if age > cfg.staleness_threshold {
            state.predicted.x += state.velocity.x;
            state.predicted.y += state.velocity.y;
        }
        if state.correcting {
            state.predicted.x += cfg.correction_gain * (state.target.x - state.predicted.x);
            state.predicted.y += cfg.correction_gain * (state.target.y - state.predicted.y);
            if (state.target.x - state.predicted.x).abs() < cfg.epsilon
                && (state.target.y - state.predicted.y).abs() < cfg.epsilon
            {
                state.correcting = false;
            }
        }

        let parents = match &state.prev_id {
            Some(prev) => vec![prev.clone(), state.last_id.clone()],
            None => vec![state.last_id.clone()],
        };
        Some(Synthesis {
            payload: state.predicted.encode(),
            parents,
            confidence: cfg.confidence(age),
            quality: Some(quality::assess_position(&state.predicted, &state.target)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(seq: u64, ts: f64, x: f64, y: f64) -> Sample {
        Sample::new(seq, ts, Position::new(x, y).encode())
    }

    fn settle(r: &mut DeadReckoner, now: f64) -> usize {
        let mut ticks = 0;
        while r.is_correcting() {
            r.tick(now).unwrap();
            ticks += 1;
            assert!(ticks < 1000, "correction never disarmed");
        }
        ticks
    }

    #[test]
    fn test_no_output_before_first_sample() {
        let mut r = DeadReckoner::new(DeadReckoningConfig::default());
        assert!(r.tick(0.0).is_none());
        assert_eq!(r.cadence(), Some(Duration::from_secs_f64(1.0 / 30.0)));
    }

    #[test]
    fn test_pure_extrapolation_after_staleness() {
        let mut r = DeadReckoner::new(DeadReckoningConfig::default());
        r.observe(&reading(0, 10.0, 100.0, 50.0), 10.0).unwrap();
        r.observe(&reading(1, 10.0, 102.0, 50.0), 10.0).unwrap();
        assert_eq!(r.velocity(), Some(Position::new(2.0, 0.0)));

        // within the staleness window only correction runs
        settle(&mut r, 10.05);
        let start = r.predicted().unwrap();
        assert!((start.x - 102.0).abs() < 0.5);

        for k in 1..=20 {
            let out = r.tick(11.0).unwrap();
            let p = Position::decode(&out.payload).unwrap();
            assert!((p.x - (start.x + 2.0 * k as f64)).abs() < 1e-9);
            assert_eq!(p.y, 50.0);
        }
    }

    #[test]
    fn test_stale_sample_projected_by_age() {
        let mut r = DeadReckoner::new(DeadReckoningConfig::default());
        r.observe(&reading(0, 0.0, 0.0, 0.0), 0.0).unwrap();
        // sent at t=1, arrives 3 s later: 90 ticks at 2 units/tick
        r.observe(&reading(1, 1.0, 10.0, 0.0), 4.0).unwrap();
        let state = r.state.as_ref().unwrap();
        assert_eq!(state.target, Position::new(190.0, 0.0));
        assert!(state.correcting);

        // a clock running behind the source does not project backwards
        r.observe(&reading(2, 9.0, 12.0, 0.0), 5.0).unwrap();
        assert_eq!(r.state.as_ref().unwrap().target, Position::new(12.0, 0.0));
    }

    #[test]
    fn test_soft_correction_converges_without_overshoot() {
        let cfg = DeadReckoningConfig::default();
        let mut r = DeadReckoner::new(cfg.clone());
        r.observe(&reading(0, 0.0, 0.0, 0.0), 0.0).unwrap();
        r.state.as_mut().unwrap().target = Position::new(100.0, 0.0);

        let mut remaining = 100.0;
        let mut ticks = 0;
        while r.is_correcting() {
            r.tick(0.0).unwrap();
            ticks += 1;
            let p = r.predicted().unwrap();
            let d = 100.0 - p.x;
            assert!(d >= 0.0, "overshoot at tick {}", ticks);
            assert!(d < remaining);
            remaining = d;
        }
        assert!(remaining < cfg.epsilon);
        let bound = ((cfg.epsilon / 100.0).ln() / (1.0 - cfg.correction_gain).ln()).ceil() as usize + 1;
        assert!(ticks <= bound, "{} ticks > {}", ticks, bound);
    }

    #[test]
    fn test_confidence_decays_and_floors() {
        let mut r = DeadReckoner::new(DeadReckoningConfig::default());
        r.observe(&reading(0, 0.0, 5.0, 5.0), 0.0).unwrap();
        let mut last = f64::INFINITY;
        for step in 0..100 {
            let c = r.tick(step as f64 * 0.05).unwrap().confidence;
            assert!(c <= last);
            assert!(c >= 0.1);
            last = c;
        }
        assert_eq!(last, 0.1);
        assert_eq!(r.tick(0.0).unwrap().confidence, 1.0);
    }

    #[test]
    fn test_wrap_reads_as_reversal() {
        let mut r = DeadReckoner::new(DeadReckoningConfig::default());
        r.observe(&reading(0, 0.0, 398.0, 10.0), 0.0).unwrap();
        r.observe(&reading(1, 0.0, 0.0, 8.0), 0.0).unwrap();
        assert_eq!(r.velocity(), Some(Position::new(2.0, -2.0)));

        r.observe(&reading(2, 0.0, 0.0, 8.0), 0.0).unwrap();
        assert_eq!(r.velocity(), Some(Position::new(0.0, 0.0)));
    }

    #[test]
    fn test_lineage_and_reordering() {
        let mut r = DeadReckoner::new(DeadReckoningConfig::default());
        r.observe(&reading(4, 0.0, 0.0, 0.0), 0.0).unwrap();
        assert_eq!(r.tick(0.0).unwrap().parents, vec![SequenceId::Index(4)]);
        r.observe(&reading(5, 0.0, 2.0, 0.0), 0.0).unwrap();
        r.observe(&reading(3, 0.0, 300.0, 0.0), 0.0).unwrap();
        let out = r.tick(0.0).unwrap();
        assert_eq!(out.parents, vec![SequenceId::Index(4), SequenceId::Index(5)]);
        assert!(matches!(out.quality, Some(crate::quality::QualityReport::Approximate { .. })));
    }
}
