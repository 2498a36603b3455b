//! Wire types for the `UpstreamLiveClient` collaborator (C4, §4.6). The
//! gateway treats the upstream generative service as an opaque websocket
//! peer; these are the event shapes it promises to emit/accept.

use serde::{Deserialize, Serialize};

/// One client→upstream message on the live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamRequest {
    /// 16kHz mono PCM16 audio chunk, base64-encoded.
    AudioChunk { pcm16_base64: String },
    /// One JPEG still, base64-encoded.
    Image { jpeg_base64: String },
    /// Explicit end-of-turn signal (no further input for this turn).
    EndOfTurn,
}

/// One upstream→client event, delivered in source order (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamEvent {
    /// Synthesized audio to route to egress. 16kHz mono PCM16, base64-encoded.
    AudioChunk { pcm16_base64: String },
    /// Token-stream text, for observability only.
    TextDelta { text: String },
    /// The model has finished emitting this turn's response.
    TurnComplete,
    /// Upstream reported an error for the current turn.
    Error { message: String },
}

/// Why an `UpstreamTurn` ended (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnCompletionReason {
    Finished,
    Interrupted,
    Timeout,
    Error,
}
