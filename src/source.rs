// =============================================================================
// LAGRANGE RELAY — source.rs
// «Signing source — the rover end of the link»
// =============================================================================
//
// Генерирует поток подписанных сэмплов с частотой 30 Гц:
//
//   raster    — synthetic camera frames: terrain gradient + moving rover block
//   telemetry — rover position only, x = 100 + (seq·2) mod 400
//
// Every 30th sample is a keyframe. Each sample is signed before it leaves.
// =============================================================================

use ndarray::Array3;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::attestation::SigningIdentity;
use crate::envelope::{Envelope, FrameEnvelope};
use crate::error::Result;
use crate::raster::Raster;
use crate::sample::{unix_now, Position, Sample};

pub const SOURCE_RATE_HZ: u64 = 30;
pub const KEYFRAME_INTERVAL: u64 = 30;
pub const FRAME_WIDTH: usize = 160;
pub const FRAME_HEIGHT: usize = 120;
const ROVER_SIZE: usize = 16;
const ROVER_Y: f64 = 240.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Raster,
    Telemetry,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Raster => "raster",
            SourceKind::Telemetry => "telemetry",
        }
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raster" | "video" => Ok(SourceKind::Raster),
            "telemetry" | "position" => Ok(SourceKind::Telemetry),
            other => Err(format!("unknown source kind '{}'", other)),
        }
    }
}

pub fn rover_position(seq: u64) -> Position {
    Position::new(100.0 + ((seq * 2) % 400) as f64, ROVER_Y)
}

/// Terrain gradient with a bright rover block drifting right and wrapping.
pub fn test_pattern(seq: u64) -> Raster {
    let span = (FRAME_WIDTH - ROVER_SIZE) as u64;
    let rover_x = ((seq * 2) % span) as usize;
    let rover_y = FRAME_HEIGHT / 2;
    Raster::from_pixels(Array3::from_shape_fn((FRAME_HEIGHT, FRAME_WIDTH, 3), |(y, x, c)| {
        let on_rover = (rover_x..rover_x + ROVER_SIZE).contains(&x) && (rover_y..rover_y + ROVER_SIZE / 2).contains(&y);
        if on_rover {
            [200u8, 200, 210][c]
        } else {
            let ground = (40 + y * 80 / FRAME_HEIGHT) as u8;
            [ground, ground / 2 + 20, ground / 3][c]
        }
    }))
}

pub struct SignedSource {
    identity: Arc<SigningIdentity>,
    kind: SourceKind,
    next_seq: u64,
}

impl SignedSource {
    pub fn new(identity: Arc<SigningIdentity>, kind: SourceKind) -> Self {
        SignedSource { identity, kind, next_seq: 0 }
    }

    pub fn next_sample(&mut self) -> (Sample, bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let payload = match self.kind {
            SourceKind::Raster => test_pattern(seq).encode(),
            SourceKind::Telemetry => rover_position(seq).encode(),
        };
        (Sample::new(seq, unix_now(), payload), seq % KEYFRAME_INTERVAL == 0)
    }

    pub fn next_envelope(&mut self) -> Result<String> {
        let (sample, is_keyframe) = self.next_sample();
        let attestation = self.identity.sign_real(&sample, is_keyframe);
        Envelope::Frame(FrameEnvelope::observed(&sample, &attestation, Some(self.kind.name()))).to_text()
    }

    /// Streams at the source rate until the receiver goes away or `cancel` fires.
    pub async fn stream(mut self, tx: mpsc::Sender<String>, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(1000 / SOURCE_RATE_HZ));
        log::info!("📷 [{}] streaming {} at {} Hz", self.identity.role(), self.kind.name(), SOURCE_RATE_HZ);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if tx.send(self.next_envelope()?).await.is_err() {
                break;
            }
            if self.next_seq % 300 == 0 {
                log::debug!("📷 {} samples sent", self.next_seq);
            }
        }
        log::info!("📷 stream ended after {} samples", self.next_seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::verify_frame;

    #[test]
    fn test_rover_track() {
        assert_eq!(rover_position(0), Position::new(100.0, 240.0));
        assert_eq!(rover_position(10).x, 120.0);
        assert_eq!(rover_position(200).x, 100.0);
    }

    #[test]
    fn test_pattern_moves() {
        let a = test_pattern(0);
        let b = test_pattern(3);
        assert_eq!((a.width(), a.height(), a.channels()), (FRAME_WIDTH, FRAME_HEIGHT, 3));
        assert_ne!(a, b);
        assert_eq!(a.pixels[[FRAME_HEIGHT / 2, 0, 0]], 200);
        assert_eq!(b.pixels[[FRAME_HEIGHT / 2, 6, 0]], 200);
    }

    #[test]
    fn test_keyframes_and_signatures() {
        let mut source = SignedSource::new(Arc::new(SigningIdentity::generate("sender")), SourceKind::Telemetry);
        for seq in 0..31u64 {
            let text = source.next_envelope().unwrap();
            let Envelope::Frame(frame) = Envelope::decode(&text).unwrap() else {
                panic!("expected frame");
            };
            assert_eq!(frame.metadata.is_keyframe, seq % KEYFRAME_INTERVAL == 0);
            assert_eq!(frame.metadata.source_type.as_deref(), Some("telemetry"));
            assert!(verify_frame(&frame));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_stops_when_receiver_drops() {
        let source = SignedSource::new(Arc::new(SigningIdentity::generate("sender")), SourceKind::Raster);
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(source.stream(tx, CancellationToken::new()));
        for _ in 0..3 {
            assert!(rx.recv().await.is_some());
        }
        drop(rx);
        assert!(task.await.unwrap().is_ok());
    }
}
