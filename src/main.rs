mod api;
mod attestation;
mod config;
mod dead_reckoning;
mod demos;
mod dense;
mod emulator;
mod envelope;
mod error;
mod predictor;
mod quality;
mod raster;
mod relay;
mod sample;
mod source;
mod wire;

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::attestation::SigningIdentity;
use crate::config::RelayConfig;
use crate::emulator::NetworkEmulator;
use crate::envelope::{verify_frame, Envelope};
use crate::error::{RelayError, Result};
use crate::relay::{relay_connection, EdgeSession, CHANNEL_DEPTH};
use crate::source::SignedSource;
use crate::wire::{FrameReader, FrameWriter};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("help");
    let cfg = RelayConfig::from_env();

    let result = match cmd {
        "source"      => run_source(cfg).await,
        "netsim"      => run_netsim(cfg).await,
        "edge"        => run_edge(cfg).await,
        "watch"       => run_watch(cfg).await,
        "configure"   => run_configure(cfg, &args[2..]).await,
        "keygen"      => run_keygen(cfg, args.get(2).map(String::as_str).unwrap_or("edge")),
        "demo-interp" => {
            demos::interpolation::demo_interpolation(cfg.predictor.interpolation_frames).await;
            Ok(())
        }
        "demo-reckon" => {
            demos::telemetry::demo_dead_reckoning(cfg.network).await;
            Ok(())
        }
        _ => {
            println!("Lagrange Relay — доступные команды:");
            println!("  source       — подписанный поток 30 Гц (LAGRANGE_SOURCE_KIND)");
            println!("  netsim       — эмулятор канала Земля–Марс + control API");
            println!("  edge         — предсказатель (LAGRANGE_STRATEGY) + /public-key");
            println!("  watch        — наблюдатель: проверка каждой подписи");
            println!("  configure    — key=value … → POST /config эмулятора");
            println!("  keygen       — [role] создать/показать ключ узла");
            println!("  demo-interp  — плотная интерполяция между кадрами");
            println!("  demo-reckon  — dead reckoning через задержку");
            Ok(())
        }
    };

    if let Err(e) = result {
        log::error!("❌ {}: {}", cmd, e);
        std::process::exit(1);
    }
}

fn session_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

fn load_identity(cfg: &RelayConfig, role: &str) -> Result<Arc<SigningIdentity>> {
    let identity = SigningIdentity::load_or_create(&cfg.key_dir, role)?;
    log::info!("🔑 [{}] public key {}", role, identity.public_key_b64());
    Ok(Arc::new(identity))
}

// =============================================================================
// SOURCE
// =============================================================================

async fn run_source(cfg: RelayConfig) -> Result<()> {
    let identity = load_identity(&cfg, "sender")?;
    let listener = TcpListener::bind(&cfg.source_addr).await?;
    log::info!("📷 source listening on {} ({})", cfg.source_addr, cfg.source_kind.name());

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        let identity = Arc::clone(&identity);
        let kind = cfg.source_kind;
        let session = session_id();
        log::info!("🔗 [{}] downstream {} connected", session, peer);

        tokio::spawn(async move {
            let (_read, write) = stream.into_split();
            let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
            let cancel = CancellationToken::new();
            let producer = tokio::spawn(SignedSource::new(identity, kind).stream(tx, cancel.clone()));
            if let Err(e) = wire::pump_out(FrameWriter::new(write), rx, cancel.clone()).await {
                log::info!("👋 [{}] {}", session, e);
            }
            cancel.cancel();
            let _ = producer.await;
        });
    }
}

// =============================================================================
// RELAY STAGES
// =============================================================================

fn log_session_end(session: &str, result: Result<()>) {
    match result {
        Ok(()) => log::info!("👋 [{}] session complete", session),
        Err(e) => log::warn!("⚠️  [{}] {}", session, e),
    }
}

async fn run_netsim(cfg: RelayConfig) -> Result<()> {
    let emulator = NetworkEmulator::new(cfg.network.clone());
    let router = api::emulator_router(Arc::clone(&emulator));
    let api_addr = cfg.netsim_api.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(router, &api_addr).await {
            log::error!("❌ control API stopped: {}", e);
        }
    });

    let listener = TcpListener::bind(&cfg.netsim_addr).await?;
    log::info!("🛰️  emulator listening on {} → source {}", cfg.netsim_addr, cfg.source_addr);

    loop {
        let (client, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        let emulator = Arc::clone(&emulator);
        let source_addr = cfg.source_addr.clone();
        let session = session_id();
        log::info!("🔗 [{}] downstream {} connected", session, peer);

        tokio::spawn(async move {
            let result = relay_connection(client, &source_addr, &session, |rx, tx, cancel| {
                emulator.run_link(rx, tx, cancel)
            })
            .await;
            log_session_end(&session, result);
        });
    }
}

async fn run_edge(cfg: RelayConfig) -> Result<()> {
    let identity = load_identity(&cfg, "edge")?;
    let info = Arc::new(api::EdgeInfo {
        strategy: cfg.predictor.strategy,
        public_key: identity.public_key_b64(),
    });
    let api_addr = cfg.edge_api.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(api::edge_router(info), &api_addr).await {
            log::error!("❌ control API stopped: {}", e);
        }
    });

    let listener = TcpListener::bind(&cfg.edge_addr).await?;
    log::info!(
        "🔮 edge listening on {} → emulator {} (strategy {})",
        cfg.edge_addr,
        cfg.netsim_addr,
        cfg.predictor.strategy.name()
    );

    loop {
        let (client, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        let edge = EdgeSession::new(Arc::clone(&identity), &cfg.predictor);
        let netsim_addr = cfg.netsim_addr.clone();
        log::info!("🔗 [{}] observer {} connected", edge.id(), peer);

        tokio::spawn(async move {
            let session = edge.id().to_string();
            let result = relay_connection(client, &netsim_addr, &session, |rx, tx, cancel| async move {
                edge.run(rx, tx, cancel).await
            })
            .await;
            log_session_end(&session, result);
        });
    }
}

// =============================================================================
// WATCH — downstream observer
// =============================================================================

async fn run_watch(cfg: RelayConfig) -> Result<()> {
    let stream = TcpStream::connect(&cfg.edge_addr)
        .await
        .map_err(|e| RelayError::UpstreamUnavailable(format!("{}: {}", cfg.edge_addr, e)))?;
    log::info!("👁️  watching {}", cfg.edge_addr);
    let mut reader = FrameReader::new(stream);

    let (mut real, mut synthetic, mut rejected) = (0u64, 0u64, 0u64);
    while let Some(text) = reader.next_text().await? {
        let frame = match Envelope::decode(&text) {
            Ok(Envelope::Frame(frame)) => frame,
            Ok(Envelope::Error { message }) => {
                log::error!("📡 upstream error: {}", message);
                continue;
            }
            Err(e) => {
                log::warn!("⏭️  {}", e);
                continue;
            }
        };

        let ok = verify_frame(&frame);
        let m = &frame.metadata;
        let id = m.frame_id.as_ref().map(|id| id.to_string()).unwrap_or_default();
        if !ok {
            rejected += 1;
            log::warn!("🔴 [{}] signature rejected", id);
        } else if m.is_synthesized {
            synthetic += 1;
            let parents: Vec<String> = m.parent_frame_ids.iter().map(|p| p.to_string()).collect();
            log::info!(
                "🔮 {} ← [{}] conf={:.2} psnr={:?} match={:?}",
                id,
                parents.join(","),
                m.confidence.unwrap_or(0.0),
                m.psnr,
                m.frame_match.or(m.approx_match)
            );
        } else {
            real += 1;
            let delay = frame.simulated_delay_ms().unwrap_or(0.0);
            log::info!(
                "🟢 [{}] {} bytes delay={:.0}ms origin_verified={:?}",
                id,
                m.frame_size,
                delay,
                m.origin_verified
            );
        }
        if ok && (real + synthetic) % 100 == 0 {
            log::info!("📊 real={} synthetic={} rejected={}", real, synthetic, rejected);
        }
    }
    log::info!("👋 stream closed: real={} synthetic={} rejected={}", real, synthetic, rejected);
    Ok(())
}

// =============================================================================
// CONTROL CLIENT
// =============================================================================

async fn run_configure(cfg: RelayConfig, pairs: &[String]) -> Result<()> {
    let query: Vec<(&str, &str)> = pairs.iter().filter_map(|p| p.split_once('=')).collect();
    let url = format!("http://{}/config", cfg.netsim_api);
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(4))
        .build()?;

    let response = if query.is_empty() {
        client.get(&url).send().await?
    } else {
        client.post(&url).query(&query).send().await?
    };
    let body: serde_json::Value = response.error_for_status()?.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn run_keygen(cfg: RelayConfig, role: &str) -> Result<()> {
    let identity = SigningIdentity::load_or_create(&cfg.key_dir, role)?;
    let (private_path, public_path) = SigningIdentity::key_paths(&cfg.key_dir, role);
    println!("role:        {}", identity.role());
    println!("public key:  {}", identity.public_key_b64());
    println!("private:     {}", private_path.display());
    println!("public:      {}", public_path.display());
    Ok(())
}
