// =============================================================================
// LAGRANGE RELAY — emulator.rs
// «Network Emulator — interplanetary link»
// =============================================================================
//
// Симуляция канала Земля–Марс: задержка, джиттер, потери.
//
//   NetworkConfig   — live parameters, replaced atomically as a whole
//   EmulatorMetrics — counters behind one lock, EWMA of applied delay
//   NetworkEmulator — Bernoulli drop + uniform delay per sample
//   run_link()      — delay line for one upstream connection
//
// Each sample is scheduled at arrival + delay. The delay line releases
// samples by deadline, so jitter can let a later sample overtake an earlier
// one; equal deadlines keep arrival order.
// =============================================================================

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::sample::unix_now;

pub const DEFAULT_BASE_DELAY_MS: u64 = 3000;
pub const DEFAULT_JITTER_MS: u64 = 500;
pub const DEFAULT_LOSS_RATE: f64 = 0.02;
pub const EWMA_ALPHA: f64 = 0.1;

// -----------------------------------------------------------------------------
// NetworkConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
    pub packet_loss_rate: f64,
    pub bandwidth_limit_kbps: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            jitter_ms: DEFAULT_JITTER_MS,
            packet_loss_rate: DEFAULT_LOSS_RATE,
            bandwidth_limit_kbps: None,
        }
    }
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub base_delay_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub packet_loss_rate: Option<f64>,
    pub bandwidth_limit_kbps: Option<u64>,
}

impl NetworkConfig {
    pub fn apply(&self, update: &ConfigUpdate) -> NetworkConfig {
        NetworkConfig {
            base_delay_ms: update.base_delay_ms.unwrap_or(self.base_delay_ms),
            jitter_ms: update.jitter_ms.unwrap_or(self.jitter_ms),
            packet_loss_rate: update
                .packet_loss_rate
                .map(|p| if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) })
                .unwrap_or(self.packet_loss_rate),
            bandwidth_limit_kbps: update.bandwidth_limit_kbps.or(self.bandwidth_limit_kbps),
        }
    }

    /// Drawn-delay bounds: [max(0, base - jitter), base + jitter].
    pub fn delay_bounds_ms(&self) -> (f64, f64) {
        let base = self.base_delay_ms as f64;
        let jitter = self.jitter_ms as f64;
        ((base - jitter).max(0.0), base + jitter)
    }

    /// Serialisation time on a bandwidth-limited link.
    pub fn transmission_ms(&self, bytes: usize) -> f64 {
        match self.bandwidth_limit_kbps {
            Some(kbps) if kbps > 0 => (bytes as f64 * 8.0) / kbps as f64,
            _ => 0.0,
        }
    }
}

// -----------------------------------------------------------------------------
// Metrics
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulatorMetrics {
    #[serde(rename = "packets_forwarded")]
    pub forwarded: u64,
    #[serde(rename = "packets_dropped")]
    pub dropped: u64,
    #[serde(rename = "total_bytes")]
    pub bytes_total: u64,
    pub avg_delay_ms: f64,
    pub start_time: f64,
}

impl EmulatorMetrics {
    fn fresh() -> Self {
        EmulatorMetrics {
            forwarded: 0,
            dropped: 0,
            bytes_total: 0,
            avg_delay_ms: 0.0,
            start_time: unix_now(),
        }
    }

    fn record_forward(&mut self, bytes: usize, delay_ms: f64) {
        self.forwarded += 1;
        self.bytes_total += bytes as u64;
        self.avg_delay_ms = EWMA_ALPHA * delay_ms + (1.0 - EWMA_ALPHA) * self.avg_delay_ms;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub metrics: EmulatorMetrics,
    pub uptime_seconds: f64,
    pub loss_rate: f64,
}

// -----------------------------------------------------------------------------
// NetworkEmulator
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Drop,
    Deliver { delay_ms: f64 },
}

pub struct NetworkEmulator {
    config: RwLock<Arc<NetworkConfig>>,
    metrics: Mutex<EmulatorMetrics>,
    rng: Mutex<StdRng>,
}

impl NetworkEmulator {
    pub fn new(config: NetworkConfig) -> Arc<Self> {
        Self::build(config, StdRng::from_entropy())
    }

    pub fn with_seed(config: NetworkConfig, seed: u64) -> Arc<Self> {
        Self::build(config, StdRng::seed_from_u64(seed))
    }

    fn build(config: NetworkConfig, rng: StdRng) -> Arc<Self> {
        Arc::new(NetworkEmulator {
            config: RwLock::new(Arc::new(config)),
            metrics: Mutex::new(EmulatorMetrics::fresh()),
            rng: Mutex::new(rng),
        })
    }

    pub async fn config(&self) -> NetworkConfig {
        self.config.read().await.as_ref().clone()
    }

    async fn config_snapshot(&self) -> Arc<NetworkConfig> {
        Arc::clone(&*self.config.read().await)
    }

    pub async fn update_config(&self, update: &ConfigUpdate) -> NetworkConfig {
        let mut guard = self.config.write().await;
        let next = guard.apply(update);
        *guard = Arc::new(next.clone());
        log::info!(
            "🛰️  link reconfigured: delay={}±{}ms loss={:.3} bw={:?}kbps",
            next.base_delay_ms,
            next.jitter_ms,
            next.packet_loss_rate,
            next.bandwidth_limit_kbps
        );
        next
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        let metrics = self.metrics.lock().await.clone();
        let attempts = (metrics.forwarded + metrics.dropped).max(1);
        MetricsSnapshot {
            uptime_seconds: unix_now() - metrics.start_time,
            loss_rate: metrics.dropped as f64 / attempts as f64,
            metrics,
        }
    }

    pub async fn reset_metrics(&self) {
        *self.metrics.lock().await = EmulatorMetrics::fresh();
        log::info!("📊 emulator metrics reset");
    }

    /// Bernoulli drop, otherwise a delay uniform in base ± jitter clamped at zero.
    pub async fn decide(&self, config: &NetworkConfig) -> Verdict {
        let mut rng = self.rng.lock().await;
        if rng.gen::<f64>() < config.packet_loss_rate {
            return Verdict::Drop;
        }
        let jitter = config.jitter_ms as f64;
        let offset = if jitter > 0.0 { rng.gen_range(-jitter..=jitter) } else { 0.0 };
        Verdict::Deliver { delay_ms: (config.base_delay_ms as f64 + offset).max(0.0) }
    }

    async fn admit(&self, message: String, arrived: Instant, order: u64) -> Option<Scheduled> {
        let config = self.config_snapshot().await;
        match self.decide(&config).await {
            Verdict::Drop => {
                self.metrics.lock().await.dropped += 1;
                log::debug!("📉 packet {} dropped (simulated loss)", order);
                None
            }
            Verdict::Deliver { delay_ms } => {
                let delay_ms = delay_ms + config.transmission_ms(message.len());
                Some(Scheduled {
                    deliver_at: arrived + Duration::from_secs_f64(delay_ms / 1000.0),
                    order,
                    delay_ms,
                    message,
                    config,
                })
            }
        }
    }

    async fn deliver(&self, scheduled: Scheduled) -> String {
        let message = stamp_network_metadata(scheduled.message, scheduled.delay_ms, &scheduled.config);
        self.metrics.lock().await.record_forward(message.len(), scheduled.delay_ms);
        message
    }

    /// Delay line for one upstream connection. Returns once upstream closed
    /// and every admitted sample has been released, or on cancellation.
    pub async fn run_link(
        self: Arc<Self>,
        mut upstream: mpsc::Receiver<String>,
        downstream: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut pending: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
        let mut order = 0u64;
        let mut upstream_open = true;

        loop {
            let next_deadline = pending.peek().map(|Reverse(s)| s.deliver_at);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("🛑 link cancelled with {} samples in flight", pending.len());
                    return Ok(());
                }
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() =>
                {
                    if let Some(Reverse(scheduled)) = pending.pop() {
                        let message = self.deliver(scheduled).await;
                        if downstream.send(message).await.is_err() {
                            cancel.cancel();
                            return Err(RelayError::UnexpectedDisconnect("downstream closed".into()));
                        }
                    }
                }
                incoming = upstream.recv(), if upstream_open => match incoming {
                    Some(message) => {
                        if let Some(s) = self.admit(message, Instant::now(), order).await {
                            pending.push(Reverse(s));
                        }
                        order += 1;
                    }
                    None => {
                        log::info!("🔌 upstream closed, draining {} samples", pending.len());
                        upstream_open = false;
                    }
                },
            }
            if !upstream_open && pending.is_empty() {
                return Ok(());
            }
        }
    }
}

struct Scheduled {
    deliver_at: Instant,
    order: u64,
    delay_ms: f64,
    message: String,
    config: Arc<NetworkConfig>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deliver_at, self.order).cmp(&(other.deliver_at, other.order))
    }
}

/// Adds the advisory `network_metadata` block; non-JSON passes through untouched.
fn stamp_network_metadata(message: String, delay_ms: f64, config: &NetworkConfig) -> String {
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&message) else {
        return message;
    };
    let Some(object) = value.as_object_mut() else {
        return message;
    };
    object.insert(
        "network_metadata".into(),
        serde_json::json!({
            "simulated_delay_ms": delay_ms,
            "proxy_timestamp": unix_now(),
            "config": config,
        }),
    );
    serde_json::to_string(&value).unwrap_or(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: u64, jitter: u64, loss: f64) -> NetworkConfig {
        NetworkConfig { base_delay_ms: base, jitter_ms: jitter, packet_loss_rate: loss, bandwidth_limit_kbps: None }
    }

    #[tokio::test]
    async fn test_loss_rate_converges() {
        for p in [0.0, 0.02, 0.3, 0.75, 1.0] {
            let cfg = config(0, 0, p);
            let emu = NetworkEmulator::with_seed(cfg.clone(), 7);
            let trials = 20_000;
            let mut dropped = 0;
            for _ in 0..trials {
                if emu.decide(&cfg).await == Verdict::Drop {
                    dropped += 1;
                }
            }
            let observed = dropped as f64 / trials as f64;
            assert!((observed - p).abs() < 0.015, "p={} observed={}", p, observed);
        }
    }

    #[tokio::test]
    async fn test_delay_within_bounds() {
        for cfg in [config(3000, 500, 0.0), config(200, 800, 0.0), config(0, 0, 0.0)] {
            let emu = NetworkEmulator::with_seed(cfg.clone(), 11);
            let (lo, hi) = cfg.delay_bounds_ms();
            for _ in 0..5_000 {
                match emu.decide(&cfg).await {
                    Verdict::Deliver { delay_ms } => assert!(delay_ms >= lo && delay_ms <= hi),
                    Verdict::Drop => panic!("no loss configured"),
                }
            }
        }
    }

    #[test]
    fn test_update_clamps_loss_and_keeps_absent_fields() {
        let base = NetworkConfig::default();
        let next = base.apply(&ConfigUpdate { packet_loss_rate: Some(1.7), ..Default::default() });
        assert_eq!(next.packet_loss_rate, 1.0);
        assert_eq!(next.base_delay_ms, DEFAULT_BASE_DELAY_MS);
        let next = next.apply(&ConfigUpdate { packet_loss_rate: Some(-0.2), jitter_ms: Some(0), ..Default::default() });
        assert_eq!(next.packet_loss_rate, 0.0);
        assert_eq!(next.jitter_ms, 0);
    }

    #[test]
    fn test_bandwidth_term() {
        let mut cfg = config(0, 0, 0.0);
        assert_eq!(cfg.transmission_ms(1000), 0.0);
        cfg.bandwidth_limit_kbps = Some(8);
        // 1000 bytes = 8000 bits at 8 kbit/s
        assert!((cfg.transmission_ms(1000) - 1000.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_preserves_order_and_timing() {
        let emu = NetworkEmulator::with_seed(config(3000, 0, 0.0), 1);
        let (up_tx, up_rx) = mpsc::channel(64);
        let (down_tx, mut down_rx) = mpsc::channel(64);
        let link = tokio::spawn(Arc::clone(&emu).run_link(up_rx, down_tx, CancellationToken::new()));

        let start = Instant::now();
        let mut sent_at = Vec::new();
        for i in 0..5 {
            sent_at.push(Instant::now());
            up_tx.send(format!("{{\"seq\":{}}}", i)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        drop(up_tx);

        for i in 0..5 {
            let msg = down_rx.recv().await.unwrap();
            let elapsed = Instant::now() - sent_at[i];
            assert!(elapsed >= Duration::from_millis(3000) && elapsed < Duration::from_millis(3002));
            let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
            assert_eq!(v["seq"], i as u64);
            assert_eq!(v["network_metadata"]["simulated_delay_ms"], 3000.0);
            assert_eq!(v["network_metadata"]["config"]["base_delay_ms"], 3000);
        }
        link.await.unwrap().unwrap();
        assert!(Instant::now() - start >= Duration::from_millis(3400));

        let snapshot = emu.metrics().await;
        assert_eq!(snapshot.metrics.forwarded, 5);
        assert_eq!(snapshot.metrics.dropped, 0);
        assert!(snapshot.metrics.bytes_total > 0);
        // EWMA from zero towards 3000 with alpha 0.1
        let expected = 3000.0 * (1.0 - 0.9f64.powi(5));
        assert!((snapshot.metrics.avg_delay_ms - expected).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_allows_overtaking() {
        let emu = NetworkEmulator::with_seed(config(0, 0, 0.0), 1);
        let (up_tx, up_rx) = mpsc::channel(8);
        let (down_tx, mut down_rx) = mpsc::channel(8);
        let link = tokio::spawn(Arc::clone(&emu).run_link(up_rx, down_tx, CancellationToken::new()));

        emu.update_config(&ConfigUpdate { base_delay_ms: Some(2000), ..Default::default() }).await;
        up_tx.send("slow".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        emu.update_config(&ConfigUpdate { base_delay_ms: Some(100), ..Default::default() }).await;
        up_tx.send("fast".into()).await.unwrap();
        drop(up_tx);

        assert_eq!(down_rx.recv().await.unwrap(), "fast");
        assert_eq!(down_rx.recv().await.unwrap(), "slow");
        link.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_loss_and_reset() {
        let emu = NetworkEmulator::with_seed(config(10, 0, 1.0), 3);
        let (up_tx, up_rx) = mpsc::channel(8);
        let (down_tx, mut down_rx) = mpsc::channel(8);
        let link = tokio::spawn(Arc::clone(&emu).run_link(up_rx, down_tx, CancellationToken::new()));
        for i in 0..4 {
            up_tx.send(i.to_string()).await.unwrap();
        }
        drop(up_tx);
        link.await.unwrap().unwrap();
        assert!(down_rx.recv().await.is_none());

        let snapshot = emu.metrics().await;
        assert_eq!(snapshot.metrics.dropped, 4);
        assert_eq!(snapshot.loss_rate, 1.0);

        emu.reset_metrics().await;
        let snapshot = emu.metrics().await;
        assert_eq!(snapshot.metrics.dropped, 0);
        assert_eq!(snapshot.loss_rate, 0.0);
    }

    #[test]
    fn test_non_json_passes_through() {
        let cfg = NetworkConfig::default();
        assert_eq!(stamp_network_metadata("raw bytes".into(), 5.0, &cfg), "raw bytes");
        assert_eq!(stamp_network_metadata("[1,2]".into(), 5.0, &cfg), "[1,2]");
    }
}
