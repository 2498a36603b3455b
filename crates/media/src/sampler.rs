//! FrameSampler (C2, §4.1): rate-limits video to one still per sampling
//! interval per session/track; audio passes through untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use image::{ImageBuffer, Rgb};

use crate::frame::{FramePayload, MediaFrame, SequenceCounter, StillFrame, TrackKind};
use crate::video::{clamp_long_side, encode_jpeg, VideoCodecError};

/// Samples decoded video `MediaFrame`s down to at most one `StillFrame` per
/// `interval`. Newest-wins: a frame arriving mid-interval replaces whatever
/// was buffered, and the drop is counted rather than surfaced as an error.
pub struct FrameSampler {
    interval: Duration,
    last_emit_us: AtomicU64,
    dropped: AtomicU64,
    still_seq: SequenceCounter,
    jpeg_quality: u8,
    max_image_dim: u32,
}

impl FrameSampler {
    pub fn new(interval: Duration, jpeg_quality: u8, max_image_dim: u32) -> Self {
        Self {
            interval,
            last_emit_us: AtomicU64::new(u64::MAX),
            dropped: AtomicU64::new(0),
            still_seq: SequenceCounter::new(),
            jpeg_quality,
            max_image_dim,
        }
    }

    /// Feed one decoded video frame. Returns `Some(StillFrame)` if this
    /// frame falls on or after the next sampling boundary, encoding it to
    /// JPEG in the process; otherwise counts it as dropped and returns
    /// `None`. Non-video frames are rejected with an error — callers should
    /// route audio around the sampler entirely (§4.1).
    pub fn sample(&self, frame: &MediaFrame) -> Result<Option<StillFrame>, VideoCodecError> {
        debug_assert!(matches!(frame.track, TrackKind::Video));
        let FramePayload::Image { width, height, rgb } = &frame.payload else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let last = self.last_emit_us.load(Ordering::Relaxed);
        let due = last == u64::MAX
            || frame.capture_timestamp_us.saturating_sub(last) >= self.interval.as_micros() as u64;
        if !due {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.last_emit_us.store(frame.capture_timestamp_us, Ordering::Relaxed);

        // Clamp to the wire format's long-side limit (§6) before encoding —
        // the browser's camera resolution routinely exceeds it.
        let buf = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(*width, *height, rgb.clone())
            .ok_or_else(|| VideoCodecError::Jpeg("decoded frame dimensions do not match buffer length".into()))?;
        let clamped = clamp_long_side(&buf, self.max_image_dim);
        let (out_width, out_height) = clamped.dimensions();

        let jpeg = encode_jpeg(out_width, out_height, clamped.as_raw(), self.jpeg_quality)?;
        Ok(Some(StillFrame {
            seq: self.still_seq.next(),
            capture_timestamp_us: frame.capture_timestamp_us,
            jpeg,
            width: out_width,
            height: out_height,
        }))
    }

    /// Count of video frames dropped for arriving inside the current
    /// sampling interval. Exposed for the observability surface (C10).
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_frame(seq: u64, ts_us: u64) -> MediaFrame {
        MediaFrame {
            seq,
            capture_timestamp_us: ts_us,
            track: TrackKind::Video,
            payload: FramePayload::Image { width: 4, height: 4, rgb: vec![0u8; 4 * 4 * 3] },
        }
    }

    #[test]
    fn first_frame_is_always_emitted() {
        let sampler = FrameSampler::new(Duration::from_millis(1000), 80, 768);
        let still = sampler.sample(&video_frame(0, 0)).unwrap();
        assert!(still.is_some());
    }

    #[test]
    fn frame_inside_interval_is_dropped() {
        let sampler = FrameSampler::new(Duration::from_millis(1000), 80, 768);
        sampler.sample(&video_frame(0, 0)).unwrap();
        let still = sampler.sample(&video_frame(1, 500_000)).unwrap();
        assert!(still.is_none());
        assert_eq!(sampler.dropped_count(), 1);
    }

    #[test]
    fn frame_at_next_boundary_is_emitted() {
        let sampler = FrameSampler::new(Duration::from_millis(1000), 80, 768);
        sampler.sample(&video_frame(0, 0)).unwrap();
        let still = sampler.sample(&video_frame(1, 1_000_000)).unwrap();
        assert!(still.is_some());
        assert_eq!(still.unwrap().seq, 1);
    }

    #[test]
    fn at_most_one_still_per_interval() {
        let sampler = FrameSampler::new(Duration::from_millis(1000), 80, 768);
        let emitted: Vec<_> = (0..5)
            .map(|i| sampler.sample(&video_frame(i, i * 300_000)).unwrap())
            .collect();
        assert_eq!(emitted.iter().filter(|s| s.is_some()).count(), 2);
    }

    #[test]
    fn oversized_frame_is_clamped_before_encoding() {
        let sampler = FrameSampler::new(Duration::from_millis(1000), 80, 768);
        let frame = MediaFrame {
            seq: 0,
            capture_timestamp_us: 0,
            track: TrackKind::Video,
            payload: FramePayload::Image { width: 1600, height: 800, rgb: vec![0u8; 1600 * 800 * 3] },
        };
        let still = sampler.sample(&frame).unwrap().unwrap();
        assert_eq!((still.width, still.height), (768, 384));
    }
}
