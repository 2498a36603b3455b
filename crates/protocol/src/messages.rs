use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// WebRTC signaling exchanged over `POST /webrtc` and `WS /ws` (§4.1, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// SDP offer from the browser.
    Offer { sdp: String },
    /// SDP answer from the gateway.
    Answer { sdp: String },
    /// Trickled ICE candidate, either direction.
    Candidate { candidate: IceCandidateInit },
    /// Error surfaced to the client on the signal channel.
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiateRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiateResponse {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: Uuid,
}

/// `POST /process-frame` request (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessFrameRequest {
    pub image_data: String,
    pub frame_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Safe,
    Blurred,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessFrameResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_image: Option<String>,
    pub blur_applied: bool,
    pub face_count: u32,
    pub verdict: VerdictKind,
}

/// `POST /spatial` request (§6). `session_id` is optional on the wire (a
/// caller without a live session can still use the analyzer directly) but,
/// when present, drives the owning session's conversation state machine into
/// `analyzing` for the duration of the call (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialRequest {
    pub image: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialResponse {
    pub surface: SurfaceAttributes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceAttributes {
    #[serde(rename = "type")]
    pub kind: String,
    pub material: String,
    pub color: String,
    /// `[ymin, xmin, ymax, xmax]` normalized to 0..1000.
    pub bounding_box: [u32; 4],
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub response_time_ms: u64,
}
