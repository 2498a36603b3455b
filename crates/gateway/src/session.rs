//! SessionManager (C7, §4.9): owns every live `Session` for the lifetime of
//! its WebRTC peer connection. Grounded on the teacher's `SessionManager`
//! (display-pool allocation, heartbeat/stale-session reaping) adapted from
//! subprocess-agent supervision to in-process WebRTC + upstream-bridge
//! supervision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use base64::Engine;
use lumen_media::{AudioFramer, FaceDetector, FramePayload, MediaFrame, PrivacyShield, PrivacyVerdict, SequenceCounter, TrackKind, VideoDecoder};
use lumen_protocol::{GatewayConfig, UpstreamEvent};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::{self, BridgeInput};
use crate::collaborators::Collaborators;
use crate::fsm::{ConversationFsm, ConversationState, Trigger};
use crate::webrtc::{IceServerConfig, SessionPeer};

/// Negotiation failure modes distinguished at the HTTP boundary (§6): a
/// malformed client offer is the caller's fault (400); failure to allocate
/// the peer connection/media engine is an internal, typically transient,
/// condition (503).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed offer: {0}")]
    MalformedOffer(String),
    #[error("session allocation failed: {0}")]
    AllocationFailed(String),
}

/// Per-session handle kept by `SessionManager`. `peer`/`fsm` are behind locks
/// so the signaling WS handler and the media pump tasks can both reach them;
/// the pump tasks themselves own no lock for the hot path.
pub struct Session {
    pub id: Uuid,
    pub peer: Arc<SessionPeer>,
    pub fsm: Arc<RwLock<ConversationFsm>>,
    bridge_tx: mpsc::Sender<BridgeInput>,
    last_activity_secs: std::sync::atomic::AtomicU64,
    created_at: Instant,
    cancel: CancellationToken,
}

impl Session {
    pub fn conversation_state(&self) -> ConversationState {
        // Only ever contended briefly by a pump task; try_read avoids
        // blocking the signaling path on a slow media tick.
        self.fsm.try_read().map(|f| f.state()).unwrap_or(ConversationState::Idle)
    }

    pub fn transition_count(&self) -> usize {
        self.fsm.try_read().map(|f| f.history().len()).unwrap_or(0)
    }

    fn touch(&self) {
        let now = self.created_at.elapsed().as_secs();
        self.last_activity_secs.store(now, std::sync::atomic::Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity_secs.load(std::sync::atomic::Ordering::Relaxed);
        let now = self.created_at.elapsed().as_secs();
        Duration::from_secs(now.saturating_sub(last))
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    config: GatewayConfig,
    collaborators: Collaborators,
    detector: Arc<dyn FaceDetector>,
}

impl SessionManager {
    pub fn new(config: GatewayConfig, collaborators: Collaborators, detector: Arc<dyn FaceDetector>) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), config, collaborators, detector }
    }

    /// Negotiate a new session from a browser SDP offer (§4.4 `/webrtc`).
    /// Spins up the peer connection, the upstream bridge, and the media pump
    /// tasks, then returns the SDP answer and session id.
    pub async fn create_session(&self, offer_sdp: &str) -> Result<(Uuid, String), SessionError> {
        let ice_servers = self
            .config
            .ice
            .stun_urls
            .iter()
            .map(|url| IceServerConfig { urls: vec![url.clone()], username: None, credential: None })
            .chain(if self.config.ice.turn_urls.is_empty() {
                None
            } else {
                Some(IceServerConfig {
                    urls: self.config.ice.turn_urls.clone(),
                    username: self.config.ice.turn_username.clone(),
                    credential: self.config.ice.turn_credential.clone(),
                })
            })
            .collect();

        let (peer, video_rx, audio_rx) = SessionPeer::new(ice_servers)
            .await
            .map_err(|e| SessionError::AllocationFailed(e.to_string()))?;
        let answer_sdp = peer.handle_offer(offer_sdp).await.map_err(|e| SessionError::MalformedOffer(e.to_string()))?;
        let peer = Arc::new(peer);

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let fsm = Arc::new(RwLock::new(ConversationFsm::new(
            self.config.session.barge_in_energy_threshold,
            self.config.session.barge_in_ms,
        )));

        let (bridge_input_tx, bridge_input_rx) = mpsc::channel::<BridgeInput>(64);
        let (event_tx, event_rx) = mpsc::channel::<UpstreamEvent>(64);

        tokio::spawn(bridge::run(Arc::clone(&self.collaborators.upstream), bridge_input_rx, event_tx, cancel.clone()));

        let shield = Arc::new(PrivacyShield::new(
            Box::new(ProxyDetector(Arc::clone(&self.detector))),
            self.config.media.blur_radius_min,
            self.config.media.crowd_threshold,
        ));

        let session = Arc::new(Session {
            id,
            peer: Arc::clone(&peer),
            fsm: Arc::clone(&fsm),
            bridge_tx: bridge_input_tx.clone(),
            last_activity_secs: std::sync::atomic::AtomicU64::new(0),
            created_at: Instant::now(),
            cancel: cancel.clone(),
        });

        tokio::spawn(pump_video(
            video_rx,
            Arc::clone(&session),
            Arc::clone(&shield),
            bridge_input_tx.clone(),
            self.config.media.sample_interval_ms,
            self.config.media.jpeg_quality,
            self.config.media.max_image_dim,
            cancel.clone(),
        ));
        tokio::spawn(pump_audio(audio_rx, Arc::clone(&session), bridge_input_tx, cancel.clone()));
        tokio::spawn(pump_events(event_rx, Arc::clone(&fsm), Arc::clone(&peer), cancel.clone()));

        self.sessions.write().await.insert(id, session);
        Ok((id, answer_sdp))
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn heartbeat(&self, id: Uuid) -> bool {
        match self.sessions.read().await.get(&id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    pub async fn destroy_session(&self, id: Uuid) -> Result<()> {
        if let Some(session) = self.sessions.write().await.remove(&id) {
            session.fsm.write().await.apply(Trigger::SessionCancelled);
            session.cancel.cancel();
            session.peer.close().await?;
        }
        Ok(())
    }

    /// Client-initiated interrupt (distinct from audio-energy barge-in):
    /// ends the in-flight upstream turn immediately (§4.7).
    pub async fn interrupt(&self, id: Uuid) -> bool {
        let Some(session) = self.sessions.read().await.get(&id).cloned() else {
            return false;
        };
        session.fsm.write().await.apply(Trigger::ClientInterrupt);
        let _ = session.bridge_tx.send(BridgeInput::EndOfTurn).await;
        true
    }

    /// Reap sessions that have been idle past `session.idle_secs` (§4.9).
    /// Grounded on the teacher's `stale_sessions`/reaper loop.
    pub async fn reap_idle(&self) -> Vec<Uuid> {
        let idle_secs = self.config.session.idle_secs;
        let stale: Vec<Uuid> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| idle_secs > 0 && s.idle_for() >= Duration::from_secs(idle_secs))
                .map(|s| s.id)
                .collect()
        };
        for id in &stale {
            let _ = self.destroy_session(*id).await;
        }
        stale
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Graceful-shutdown drain: cancels every session's token immediately (so
    /// no new work is accepted) then bounded-waits for in-flight turns to
    /// leave `analyzing`/`speaking` before destroying each session. Grounded
    /// on the teacher's shutdown sequence in `main.rs` (persist-or-destroy
    /// every live session before exiting); here sessions aren't process-backed
    /// so there is nothing to persist, only to drain.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let ids: Vec<Uuid> = self.sessions.read().await.keys().copied().collect();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "cancelling {} session(s) for shutdown", ids.len());
        {
            let sessions = self.sessions.read().await;
            for id in &ids {
                if let Some(session) = sessions.get(id) {
                    session.cancel.cancel();
                }
            }
        }

        let deadline = Instant::now() + drain_timeout;
        loop {
            let still_busy = {
                let sessions = self.sessions.read().await;
                ids.iter()
                    .filter_map(|id| sessions.get(id))
                    .any(|s| matches!(s.conversation_state(), ConversationState::Analyzing | ConversationState::Speaking))
            };
            if !still_busy || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for id in &ids {
            if let Err(e) = self.destroy_session(*id).await {
                tracing::warn!(%id, "error destroying session during shutdown: {e}");
            }
        }
        tracing::info!("session drain complete");
    }
}

/// Adapts the shared `Arc<dyn FaceDetector>` to the `Box<dyn FaceDetector>`
/// `PrivacyShield::new` expects, without cloning the underlying collaborator.
struct ProxyDetector(Arc<dyn FaceDetector>);

#[async_trait::async_trait]
impl FaceDetector for ProxyDetector {
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<lumen_media::FaceRect>, lumen_media::DetectorError> {
        self.0.detect(jpeg).await
    }
}

/// Video ingress pump: decode H.264 access units, sample at most one still
/// per interval, run it through the privacy shield, and gate it into the
/// upstream bridge per the FSM's privacy hysteresis (§4.2, §4.7).
#[allow(clippy::too_many_arguments)]
async fn pump_video(
    mut video_rx: mpsc::Receiver<crate::webrtc::VideoAccessUnit>,
    session: Arc<Session>,
    shield: Arc<PrivacyShield>,
    bridge_tx: mpsc::Sender<BridgeInput>,
    sample_interval_ms: u64,
    jpeg_quality: u8,
    max_image_dim: u32,
    cancel: CancellationToken,
) {
    let mut decoder = match VideoDecoder::new() {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("video decoder init failed: {e}");
            return;
        }
    };
    let sampler = lumen_media::FrameSampler::new(Duration::from_millis(sample_interval_ms), jpeg_quality, max_image_dim);
    let seq = SequenceCounter::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = video_rx.recv() => {
                let Some(annex_b) = frame else { return };
                session.touch();

                let decoded = match decoder.decode(&annex_b) {
                    Ok(Some(image)) => image,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("video decode failed: {e}");
                        continue;
                    }
                };

                let media_frame = MediaFrame {
                    seq: seq.next(),
                    capture_timestamp_us: now_us(),
                    track: TrackKind::Video,
                    payload: FramePayload::Image { width: decoded.width, height: decoded.height, rgb: decoded.rgb },
                };

                let still = match sampler.sample(&media_frame) {
                    Ok(Some(still)) => still,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("jpeg encode failed: {e}");
                        continue;
                    }
                };

                let verdict = match shield.evaluate(&still.jpeg).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("privacy shield failed: {e}");
                        PrivacyVerdict::Blocked { face_count: 0, reason: "shield_error".into() }
                    }
                };

                let halted = session.fsm.write().await.observe_privacy_verdict(&verdict);
                if halted {
                    continue;
                }

                let jpeg = match &verdict {
                    PrivacyVerdict::Safe => still.jpeg.clone(),
                    PrivacyVerdict::Blurred { processed_jpeg, .. } => processed_jpeg.clone(),
                    PrivacyVerdict::Blocked { .. } => continue,
                };

                if bridge_tx.send(BridgeInput::Image { jpeg, verdict }).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Audio ingress pump: decode PCMA at its native 8kHz, upsample to the
/// pipeline's 16kHz, frame into 20ms chunks, and drive barge-in detection
/// off each chunk's RMS energy (§4.3, §4.7) before forwarding upstream.
async fn pump_audio(
    mut audio_rx: mpsc::Receiver<crate::webrtc::AudioFrame>,
    session: Arc<Session>,
    bridge_tx: mpsc::Sender<BridgeInput>,
    cancel: CancellationToken,
) {
    let mut framer = AudioFramer::new(20);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = audio_rx.recv() => {
                let Some(alaw) = frame else { return };
                session.touch();

                let pcm8k = lumen_media::alaw_decode(&alaw);
                let pcm16k = lumen_media::upsample_x2(&pcm8k);
                let chunks = framer.push(&pcm16k, now_us());

                for chunk in chunks {
                    let rms = rms_energy(&chunk.samples);
                    let (barged_in, halted) = {
                        let mut fsm = session.fsm.write().await;
                        fsm.apply(Trigger::UserAudioObserved);
                        let barged_in = fsm.observe_audio_energy(rms, Instant::now());
                        if barged_in {
                            let trigger = fsm.barge_in_or_turn_complete(Instant::now());
                            fsm.apply(trigger);
                        }
                        // Analyzing suspends forwarding until speaking begins
                        // or the analyze completes (§4.7), independent of the
                        // privacy-verdict hysteresis.
                        let analyzing = fsm.state() == ConversationState::Analyzing;
                        (barged_in, analyzing || fsm.audio_forwarding_halted())
                    };
                    if barged_in && bridge_tx.send(BridgeInput::EndOfTurn).await.is_err() {
                        return;
                    }
                    if halted {
                        continue;
                    }
                    if bridge_tx.send(BridgeInput::Audio(chunk.samples)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Upstream event relay: routes synthesized audio back onto the client's
/// egress track (re-encoded to 8kHz PCMA) and drives turn-completion
/// transitions on the FSM.
async fn pump_events(
    mut event_rx: mpsc::Receiver<UpstreamEvent>,
    fsm: Arc<RwLock<ConversationFsm>>,
    peer: Arc<SessionPeer>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = event_rx.recv() => {
                let Some(event) = event else { return };
                match event {
                    UpstreamEvent::AudioChunk { pcm16_base64 } => {
                        fsm.write().await.apply(Trigger::UpstreamAudioChunk);
                        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&pcm16_base64) else { continue };
                        let samples: Vec<i16> = bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
                        let pcm8k = lumen_media::decimate(&samples, 2);
                        let alaw = lumen_media::alaw_encode(&pcm8k);
                        let duration = Duration::from_millis((pcm8k.len() as u64 * 1000) / 8000);
                        if let Err(e) = peer.write_audio_sample(alaw, duration).await {
                            tracing::warn!("egress audio write failed: {e}");
                        }
                    }
                    UpstreamEvent::TextDelta { .. } => {
                        fsm.write().await.apply(Trigger::UpstreamResponseStarting);
                    }
                    UpstreamEvent::TurnComplete => {
                        let mut fsm = fsm.write().await;
                        let reason = fsm.turn_completion_reason(Trigger::TurnComplete);
                        fsm.apply(Trigger::TurnComplete);
                        tracing::debug!(?reason, "turn complete");
                    }
                    UpstreamEvent::Error { message } => {
                        tracing::warn!("upstream reported error: {message}");
                        fsm.write().await.apply(Trigger::UpstreamFatalError);
                        return;
                    }
                }
            }
        }
    }
}

fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64 / i16::MAX as f64).powi(2)).sum();
    ((sum_sq / samples.len() as f64).sqrt()) as f32
}

/// Monotonic microsecond clock for `capture_timestamp_us`. Only relative
/// deltas matter to `FrameSampler`/`AudioFramer`, so a process-wide epoch is
/// sufficient.
fn now_us() -> u64 {
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}
