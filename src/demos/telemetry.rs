//! Dead-reckoning demo
//!
//! Telemetry crosses a 3 s ± 0.5 s link with loss. The edge predicts the rover
//! at 30 Hz and eases toward each stale sample once it lands.
//! Time is simulated, so the demo runs instantly.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dead_reckoning::{DeadReckoner, DeadReckoningConfig};
use crate::emulator::NetworkConfig;
use crate::predictor::Predictor;
use crate::sample::{Position, Sample};
use crate::source::rover_position;

/// Main entry point for `demo-reckon`
pub async fn demo_dead_reckoning(network: NetworkConfig) {
    println!("\n╔════════════════════════════════════════════╗");
    println!("║  DEAD RECKONING — dead_reckoning_v1        ║");
    println!("╚════════════════════════════════════════════╝\n");

    let cfg = DeadReckoningConfig::default();
    let rate = cfg.output_rate_hz;
    let mut reckoner = DeadReckoner::new(cfg);
    let mut rng = StdRng::seed_from_u64(2024);

    // (arrival time, sample) for everything the link lets through
    let mut in_flight: Vec<(f64, Sample)> = Vec::new();
    for seq in 0..300u64 {
        if rng.gen::<f64>() < network.packet_loss_rate {
            continue;
        }
        let sent = seq as f64 / rate;
        let jitter = network.jitter_ms as f64;
        let delay_ms = (network.base_delay_ms as f64 + rng.gen_range(-jitter..=jitter)).max(0.0);
        in_flight.push((sent + delay_ms / 1000.0, Sample::new(seq, sent, rover_position(seq).encode())));
    }
    in_flight.sort_by(|a, b| a.0.total_cmp(&b.0));

    println!("   {:>6} {:>10} {:>10} {:>8} {:>6}", "t, s", "true x", "pred x", "error", "conf");
    println!("   {}", "─".repeat(46));

    let mut next = 0;
    for tick in 0..(12.0 * rate) as u64 {
        let now = tick as f64 / rate;
        while next < in_flight.len() && in_flight[next].0 <= now {
            if let Err(e) = reckoner.observe(&in_flight[next].1, now) {
                println!("   ⚠️  {}", e);
            }
            next += 1;
        }
        let Some(out) = reckoner.tick(now) else { continue };
        if tick % 15 != 0 {
            continue;
        }
        let truth = rover_position((now * rate) as u64);
        let predicted = Position::decode(&out.payload).unwrap_or_default();
        println!(
            "   {:>6.2} {:>10.1} {:>10.1} {:>8.1} {:>6.2}",
            now,
            truth.x,
            predicted.x,
            (truth.x - predicted.x).abs(),
            out.confidence
        );
    }
    println!("\n✅ {} samples delivered, {} lost", in_flight.len(), 300 - in_flight.len());
}
