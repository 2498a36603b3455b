use std::sync::atomic::{AtomicU64, Ordering};

/// Which ingress track a `MediaFrame` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// Decoded payload carried by a `MediaFrame`.
#[derive(Debug, Clone)]
pub enum FramePayload {
    /// Raw RGB8 image, row-major, `width * height * 3` bytes.
    Image { width: u32, height: u32, rgb: Vec<u8> },
    /// PCM16 mono samples at the track's native sample rate.
    Pcm { sample_rate: u32, samples: Vec<i16> },
}

/// Immutable value produced by `MediaCodec`, consumed by `FrameSampler` (§3).
///
/// `seq` is monotonic per `(session, track)` — MediaCodec is the sole
/// producer for a given track so no synchronization is needed to assign it.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub seq: u64,
    pub capture_timestamp_us: u64,
    pub track: TrackKind,
    pub payload: FramePayload,
}

/// Per-track monotonic sequence counter. One instance per (session, track).
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Returns the next sequence id, starting at 0.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// A video `MediaFrame` selected by `FrameSampler`; JPEG-encoded (§3).
/// Invariant: at most one `StillFrame` per session per sampling interval.
#[derive(Debug, Clone)]
pub struct StillFrame {
    pub seq: u64,
    pub capture_timestamp_us: u64,
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// PCM16 mono, 16kHz, 20ms framing (320 samples) (§3).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub seq: u64,
    pub capture_timestamp_us: u64,
    pub samples: Vec<i16>,
}

pub const AUDIO_SAMPLE_RATE_HZ: u32 = 16_000;
pub const AUDIO_FRAME_MS: u32 = 20;
pub const AUDIO_FRAME_SAMPLES: usize = (AUDIO_SAMPLE_RATE_HZ / 1000 * AUDIO_FRAME_MS) as usize;
