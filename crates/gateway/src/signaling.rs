//! SignalingGateway (C6, §4.4): SDP negotiation over HTTP plus a WebSocket
//! for trickled ICE candidates. Grounded on the teacher's `signaling.rs`
//! ping/pong keepalive, simplified since the gateway itself terminates
//! WebRTC (no separate agent-side relay to fan out to).

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use lumen_protocol::SignalingMessage;
use tokio::time::{Instant, interval};
use uuid::Uuid;

use crate::session::SessionManager;

const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Drives one browser's ICE-trickle WebSocket for `session_id`. Registers the
/// gateway's own trickled candidates onto the outgoing side and applies
/// incoming ones to the peer connection. Closes the session on pong timeout.
pub async fn handle_ice_ws(mut socket: WebSocket, session_id: Uuid, sessions: &SessionManager) {
    let Some(session) = sessions.get(session_id).await else {
        let msg = SignalingMessage::Error { message: "session_not_found".to_string() };
        if let Ok(json) = serde_json::to_string(&msg) {
            let _ = socket.send(Message::Text(json.into())).await;
        }
        return;
    };

    let (local_tx, mut local_rx) = tokio::sync::mpsc::unbounded_channel::<SignalingMessage>();
    session.peer.on_ice_candidate(move |candidate, sdp_mid, sdp_mline_index| {
        let _ = local_tx.send(SignalingMessage::Candidate {
            candidate: lumen_protocol::IceCandidateInit { candidate, sdp_mid, sdp_mline_index },
        });
    });

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::warn!(%session_id, "ICE websocket pong timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            outgoing = local_rx.recv() => {
                let Some(msg) = outgoing else { break };
                let Ok(json) = serde_json::to_string(&msg) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(SignalingMessage::Candidate { candidate }) => {
                                if let Err(e) = session
                                    .peer
                                    .add_ice_candidate(&candidate.candidate, candidate.sdp_mid.as_deref(), candidate.sdp_mline_index)
                                    .await
                                {
                                    tracing::warn!(%session_id, "failed to add ice candidate: {e}");
                                }
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(%session_id, "invalid signaling message: {e}"),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(%session_id, "ICE websocket error: {e}");
                        break;
                    }
                }
            }
        }
    }
}
