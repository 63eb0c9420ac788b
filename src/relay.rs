// =============================================================================
// LAGRANGE RELAY — relay.rs
// «Relay Boundary — one edge session per downstream connection»
// =============================================================================
//
//   upstream (emulator) ──▶ ingest loop ──▶ downstream (observer)
//                              │  ▲
//                   observe()  ▼  │ synthetic frames
//                         SessionState ◀── output loop (tick cadence)
//
// Каждая сессия изолирована: свой предиктор, свой счётчик synth_N.
// Decode and verification failures skip one message; disconnects end the
// session and cancel its sibling loop.
//
// relay_connection() puts any stage (emulator link, edge session) between a
// client socket and its upstream socket.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::attestation::SigningIdentity;
use crate::envelope::{self, Envelope, FrameEnvelope};
use crate::error::{Disposition, RelayError, Result};
use crate::predictor::{build_predictor, Predictor, PredictorConfig, Synthesis};
use crate::sample::{unix_now, SequenceId};
use crate::wire::{self, FrameReader, FrameWriter};

pub const UPSTREAM_UNAVAILABLE_MESSAGE: &str = "Could not connect to sender";
pub const CHANNEL_DEPTH: usize = 256;

struct SessionState {
    predictor: Box<dyn Predictor>,
    synth_counter: u64,
}

pub struct EdgeSession {
    id: String,
    identity: Arc<SigningIdentity>,
    state: Mutex<SessionState>,
}

impl EdgeSession {
    pub fn new(identity: Arc<SigningIdentity>, config: &PredictorConfig) -> Self {
        Self::with_predictor(identity, build_predictor(config))
    }

    pub fn with_predictor(identity: Arc<SigningIdentity>, predictor: Box<dyn Predictor>) -> Self {
        EdgeSession {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            identity,
            state: Mutex::new(SessionState { predictor, synth_counter: 0 }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs until upstream or downstream goes away, or `cancel` fires.
    pub async fn run(
        &self,
        upstream: mpsc::Receiver<String>,
        downstream: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let version = self.state.lock().await.predictor.version();
        log::info!("🛰️  session {} started ({})", self.id, version);

        let (ingest, output) = tokio::join!(
            self.ingest_loop(upstream, downstream.clone(), cancel.clone()),
            self.output_loop(downstream, cancel.clone()),
        );
        let result = ingest.and(output);
        match &result {
            Ok(()) => log::info!("👋 session {} closed", self.id),
            Err(e) => log::warn!("⚠️  session {} ended: {}", self.id, e),
        }
        result
    }

    async fn ingest_loop(
        &self,
        mut upstream: mpsc::Receiver<String>,
        downstream: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let text = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                incoming = upstream.recv() => match incoming {
                    Some(text) => text,
                    None => {
                        cancel.cancel();
                        return Err(RelayError::UnexpectedDisconnect("upstream closed".into()));
                    }
                },
            };

            if let Err(e) = self.ingest(&text, &downstream).await {
                match e.disposition() {
                    Disposition::Skip => log::warn!("⏭️  session {} skipped message: {}", self.id, e),
                    Disposition::Terminate => {
                        cancel.cancel();
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn ingest(&self, text: &str, downstream: &mpsc::Sender<String>) -> Result<()> {
        let mut frame = match Envelope::decode(text)? {
            Envelope::Error { message } => {
                log::warn!("📡 upstream reported: {}", message);
                return send(downstream, text.to_string()).await;
            }
            Envelope::Frame(frame) => frame,
        };

        if frame.metadata.is_synthesized {
            log::debug!("🔁 passing through synthesized frame from upstream");
            return send(downstream, text.to_string()).await;
        }

        let verified = envelope::verify_frame(&frame);
        frame.metadata.origin_verified = Some(verified);
        let sample = if verified { Some(frame.sample()?) } else { None };
        send(downstream, Envelope::Frame(frame).to_text()?).await?;

        let Some(sample) = sample else {
            return Ok(());
        };
        let outgoing = {
            let mut state = self.state.lock().await;
            let syntheses = state.predictor.observe(&sample, unix_now())?;
            syntheses
                .into_iter()
                .map(|s| self.seal(&mut state, s))
                .collect::<Result<Vec<_>>>()?
        };
        if !outgoing.is_empty() {
            log::debug!("🔮 [{}] {} synthetic frames after [{}]", self.id, outgoing.len(), sample.sequence_id);
        }
        for text in outgoing {
            send(downstream, text).await?;
        }
        Ok(())
    }

    async fn output_loop(&self, downstream: mpsc::Sender<String>, cancel: CancellationToken) -> Result<()> {
        let Some(period) = self.state.lock().await.predictor.cadence() else {
            return Ok(());
        };
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }
            let outgoing = {
                let mut state = self.state.lock().await;
                match state.predictor.tick(unix_now()) {
                    Some(synthesis) => Some(self.seal(&mut state, synthesis)?),
                    None => None,
                }
            };
            if let Some(text) = outgoing {
                if let Err(e) = send(&downstream, text).await {
                    cancel.cancel();
                    return Err(e);
                }
            }
        }
    }

    /// Assigns the next synthetic id and signs the frame with the edge key.
    fn seal(&self, state: &mut SessionState, synthesis: Synthesis) -> Result<String> {
        state.synth_counter += 1;
        let attestation = self.identity.sign_synthetic(
            SequenceId::synthetic(state.synth_counter),
            unix_now(),
            synthesis.confidence,
            synthesis.parents,
            state.predictor.version(),
        );
        let frame = FrameEnvelope::synthesized(&synthesis.payload, &attestation, synthesis.quality.as_ref(), true);
        Envelope::Frame(frame).to_text()
    }
}

async fn send(downstream: &mpsc::Sender<String>, text: String) -> Result<()> {
    downstream
        .send(text)
        .await
        .map_err(|_| RelayError::UnexpectedDisconnect("downstream closed".into()))
}

/// Tells the downstream peer, once, that the previous stage is unreachable.
pub async fn report_upstream_unavailable(downstream: &mpsc::Sender<String>) -> Result<()> {
    send(downstream, Envelope::error(UPSTREAM_UNAVAILABLE_MESSAGE).to_text()?).await
}

// -----------------------------------------------------------------------------
// One downstream connection
// -----------------------------------------------------------------------------

/// Dials `upstream_addr` for one downstream client and runs `stage` between
/// them. An unreachable upstream gets exactly one error envelope.
///
/// The client going away (read EOF or a failed write) cancels the stage even
/// if the stage never writes. The stage ending on its own lets the writer
/// drain what is already queued.
pub async fn relay_connection<F, Fut>(client: TcpStream, upstream_addr: &str, session: &str, stage: F) -> Result<()>
where
    F: FnOnce(mpsc::Receiver<String>, mpsc::Sender<String>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let client_gone = CancellationToken::new();
    let (client_read, client_write) = client.into_split();
    let watcher = tokio::spawn(wire::cancel_on_close(client_read, client_gone.clone()));
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
    let writer = tokio::spawn(wire::pump_out(FrameWriter::new(client_write), out_rx, client_gone.clone()));

    let upstream = match TcpStream::connect(upstream_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("❌ [{}] upstream {} unreachable: {}", session, upstream_addr, e);
            let reported = report_upstream_unavailable(&out_tx).await;
            drop(out_tx);
            let _ = writer.await;
            client_gone.cancel();
            let _ = watcher.await;
            reported?;
            return Err(RelayError::UpstreamUnavailable(format!("{}: {}", upstream_addr, e)));
        }
    };

    let (up_read, _up_write) = upstream.into_split();
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);
    let cancel = client_gone.child_token();
    let reader = tokio::spawn(wire::pump_in(FrameReader::new(up_read), in_tx, cancel.clone()));

    let result = stage(in_rx, out_tx, cancel.clone()).await;
    cancel.cancel();
    let _ = reader.await;
    let _ = writer.await;
    client_gone.cancel();
    let _ = watcher.await;
    result
}
