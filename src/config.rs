// =============================================================================
// LAGRANGE RELAY — config.rs
// =============================================================================
//
// Конфигурация узла: значения по умолчанию + переопределение из env.
//
//   LAGRANGE_KEY_DIR              каталог ключей          (./keys)
//   LAGRANGE_SOURCE_ADDR          поток источника         (127.0.0.1:8001)
//   LAGRANGE_NETSIM_ADDR          поток эмулятора         (127.0.0.1:8002)
//   LAGRANGE_EDGE_ADDR            поток edge-узла         (127.0.0.1:8003)
//   LAGRANGE_NETSIM_API           HTTP эмулятора          (127.0.0.1:8102)
//   LAGRANGE_EDGE_API             HTTP edge-узла          (127.0.0.1:8103)
//   LAGRANGE_STRATEGY             dense | linear | dead-reckoning
//   LAGRANGE_SOURCE_KIND          raster | telemetry
//   LAGRANGE_INTERPOLATION_FRAMES слотов между соседями   (2)
//   LAGRANGE_BASE_DELAY_MS / LAGRANGE_JITTER_MS / LAGRANGE_LOSS_RATE
//
// A value that does not parse is logged and ignored.
// =============================================================================

use std::path::PathBuf;
use std::str::FromStr;

use crate::emulator::NetworkConfig;
use crate::predictor::PredictorConfig;
use crate::source::SourceKind;

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub key_dir: PathBuf,
    pub source_addr: String,
    pub netsim_addr: String,
    pub edge_addr: String,
    pub netsim_api: String,
    pub edge_api: String,
    pub source_kind: SourceKind,
    pub network: NetworkConfig,
    pub predictor: PredictorConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            key_dir: PathBuf::from("./keys"),
            source_addr: "127.0.0.1:8001".to_string(),
            netsim_addr: "127.0.0.1:8002".to_string(),
            edge_addr: "127.0.0.1:8003".to_string(),
            netsim_api: "127.0.0.1:8102".to_string(),
            edge_api: "127.0.0.1:8103".to_string(),
            source_kind: SourceKind::Raster,
            network: NetworkConfig::default(),
            predictor: PredictorConfig::default(),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else { return };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => log::warn!("{} ignored (cannot parse '{}')", key, raw),
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = RelayConfig::default();

        if let Some(dir) = lookup("LAGRANGE_KEY_DIR") {
            cfg.key_dir = PathBuf::from(dir);
        }
        parsed(&lookup, "LAGRANGE_SOURCE_ADDR", &mut cfg.source_addr);
        parsed(&lookup, "LAGRANGE_NETSIM_ADDR", &mut cfg.netsim_addr);
        parsed(&lookup, "LAGRANGE_EDGE_ADDR", &mut cfg.edge_addr);
        parsed(&lookup, "LAGRANGE_NETSIM_API", &mut cfg.netsim_api);
        parsed(&lookup, "LAGRANGE_EDGE_API", &mut cfg.edge_api);
        parsed(&lookup, "LAGRANGE_STRATEGY", &mut cfg.predictor.strategy);
        parsed(&lookup, "LAGRANGE_SOURCE_KIND", &mut cfg.source_kind);
        parsed(&lookup, "LAGRANGE_INTERPOLATION_FRAMES", &mut cfg.predictor.interpolation_frames);
        parsed(&lookup, "LAGRANGE_BASE_DELAY_MS", &mut cfg.network.base_delay_ms);
        parsed(&lookup, "LAGRANGE_JITTER_MS", &mut cfg.network.jitter_ms);
        parsed(&lookup, "LAGRANGE_LOSS_RATE", &mut cfg.network.packet_loss_rate);

        let loss = cfg.network.packet_loss_rate;
        cfg.network.packet_loss_rate = if loss.is_nan() { 0.0 } else { loss.clamp(0.0, 1.0) };
        cfg
    }
}
