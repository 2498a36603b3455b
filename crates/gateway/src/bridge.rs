//! UpstreamBridge (C4, §4.6): owns one `UpstreamSession` per client session,
//! forwards audio/image input, and relays upstream events back into the
//! session. Grounded on the teacher's `web.rs` agent-restart backoff shape
//! (`spawn_agent_monitor`'s capped `1 << restart_count` delay), adapted from
//! process supervision to a network reconnect loop.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use lumen_media::PrivacyVerdict;
use lumen_protocol::{UpstreamEvent, UpstreamRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{UpstreamLiveClient, UpstreamSession};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Ingress audio buffered during a reconnect window before drop-oldest kicks in (§4.6).
const AUDIO_BUFFER_DURING_RECONNECT: Duration = Duration::from_secs(2);

pub enum BridgeInput {
    Audio(Vec<i16>),
    Image { jpeg: Vec<u8>, verdict: PrivacyVerdict },
    EndOfTurn,
}

/// Runs the session's upstream half: pulls `BridgeInput` from `input_rx`,
/// forwards to the live upstream session per the cadence in §4.6, and pushes
/// received `UpstreamEvent`s onto `event_tx`. Reconnects with exponential
/// backoff on send/recv failure; gives up after `MAX_RECONNECT_ATTEMPTS`.
pub async fn run(
    client: Arc<dyn UpstreamLiveClient>,
    mut input_rx: mpsc::Receiver<BridgeInput>,
    event_tx: mpsc::Sender<UpstreamEvent>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;
    let mut session = loop {
        if cancel.is_cancelled() {
            return;
        }
        match client.connect().await {
            Ok(s) => break s,
            Err(e) => {
                attempt += 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    tracing::error!("upstream connect failed after {attempt} attempts: {e}");
                    let _ = event_tx.send(UpstreamEvent::Error { message: "upstream_unavailable".into() }).await;
                    return;
                }
                let delay = backoff_delay(attempt);
                tracing::warn!(attempt, ?delay, "upstream connect failed, retrying: {e}");
                tokio::time::sleep(delay).await;
            }
        }
    };
    attempt = 0;

    // Bounded backlog so a reconnect window drops the oldest audio once full
    // rather than unbounded-buffering caller memory (§4.6).
    let max_audio_backlog = (AUDIO_BUFFER_DURING_RECONNECT.as_millis() / 20) as usize;
    let mut audio_backlog: Vec<Vec<i16>> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                session.close().await;
                return;
            }
            maybe_input = input_rx.recv() => {
                let Some(input) = maybe_input else {
                    session.close().await;
                    return;
                };
                let req = match input {
                    BridgeInput::Audio(pcm16) => {
                        let bytes: Vec<u8> = pcm16.iter().flat_map(|s| s.to_le_bytes()).collect();
                        Some(UpstreamRequest::AudioChunk { pcm16_base64: base64::engine::general_purpose::STANDARD.encode(bytes) })
                    }
                    BridgeInput::Image { jpeg, verdict } => {
                        match verdict {
                            PrivacyVerdict::Blocked { .. } => None,
                            PrivacyVerdict::Safe | PrivacyVerdict::Blurred { .. } => {
                                Some(UpstreamRequest::Image { jpeg_base64: base64::engine::general_purpose::STANDARD.encode(jpeg) })
                            }
                        }
                    }
                    BridgeInput::EndOfTurn => Some(UpstreamRequest::EndOfTurn),
                };
                let Some(req) = req else { continue };

                if let Err(e) = session.send(req.clone()).await {
                    tracing::warn!("upstream send failed, attempting reconnect: {e}");
                    if let UpstreamRequest::AudioChunk { pcm16_base64 } = &req {
                        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(pcm16_base64) {
                            let samples: Vec<i16> = bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
                            audio_backlog.push(samples);
                            if audio_backlog.len() > max_audio_backlog {
                                audio_backlog.remove(0);
                            }
                        }
                    }
                    match reconnect(&client, &mut attempt, &cancel).await {
                        Some(new_session) => {
                            session = new_session;
                            for backlogged in audio_backlog.drain(..) {
                                let bytes: Vec<u8> = backlogged.iter().flat_map(|s| s.to_le_bytes()).collect();
                                let _ = session.send(UpstreamRequest::AudioChunk { pcm16_base64: base64::engine::general_purpose::STANDARD.encode(bytes) }).await;
                            }
                        }
                        None => {
                            let _ = event_tx.send(UpstreamEvent::Error { message: "upstream_unavailable".into() }).await;
                            return;
                        }
                    }
                }
            }
            recv_result = session.recv() => {
                match recv_result {
                    Ok(Some(event)) => {
                        if event_tx.send(event).await.is_err() {
                            session.close().await;
                            return;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("upstream closed the session");
                        match reconnect(&client, &mut attempt, &cancel).await {
                            Some(new_session) => session = new_session,
                            None => return,
                        }
                    }
                    Err(e) => {
                        tracing::warn!("upstream recv failed, attempting reconnect: {e}");
                        match reconnect(&client, &mut attempt, &cancel).await {
                            Some(new_session) => session = new_session,
                            None => {
                                let _ = event_tx.send(UpstreamEvent::Error { message: "upstream_unavailable".into() }).await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn reconnect(
    client: &Arc<dyn UpstreamLiveClient>,
    attempt: &mut u32,
    cancel: &CancellationToken,
) -> Option<Box<dyn UpstreamSession>> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        *attempt += 1;
        if *attempt > MAX_RECONNECT_ATTEMPTS {
            tracing::error!("giving up reconnecting to upstream after {attempt} attempts");
            return None;
        }
        match client.connect().await {
            Ok(session) => return Some(session),
            Err(e) => {
                let delay = backoff_delay(*attempt);
                tracing::warn!(attempt = *attempt, ?delay, "reconnect attempt failed: {e}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let scaled = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(8));
    scaled.min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2000));
        assert!(backoff_delay(10) <= BACKOFF_CAP);
    }

    #[tokio::test]
    async fn bridge_relays_events_until_closed() {
        let client: Arc<dyn UpstreamLiveClient> = Arc::new(crate::collaborators::fakes::FakeUpstreamClient);
        let (input_tx, input_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(run(client, input_rx, event_tx, cancel2));
        input_tx.send(BridgeInput::Audio(vec![0i16; 320])).await.unwrap();
        drop(input_tx);
        handle.await.unwrap();
        assert!(event_rx.recv().await.is_none());
        let _ = cancel;
    }
}
