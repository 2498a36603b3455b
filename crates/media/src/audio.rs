//! Ingress/egress audio handling (C1, §4.3).
//!
//! The gateway negotiates PCMA (G.711 A-law, RFC 3551) on the browser-facing
//! tracks. A-law is a pure bit-for-bit codec with no native library
//! dependency, which keeps the gateway free of an external codec SDK while
//! still being a real, RTP-payload-type-7 codec a browser can be made to
//! offer. See DESIGN.md for the tradeoff against Opus.

use crate::frame::{AUDIO_SAMPLE_RATE_HZ, AudioChunk, SequenceCounter};

/// Decode A-law bytes to linear PCM16.
pub fn alaw_decode(input: &[u8]) -> Vec<i16> {
    input.iter().map(|&b| alaw_decode_sample(b)).collect()
}

/// Encode linear PCM16 to A-law bytes.
pub fn alaw_encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| alaw_encode_sample(s)).collect()
}

fn alaw_decode_sample(a_val: u8) -> i16 {
    let mut a_val = a_val ^ 0x55;
    let sign = a_val & 0x80;
    a_val &= 0x7F;
    let exponent = (a_val >> 4) as u32;
    let mantissa = (a_val & 0x0F) as i16;
    let mut sample = if exponent == 0 {
        (mantissa << 4) | 0x08
    } else {
        ((mantissa | 0x10) << (exponent + 3)) as i16
    };
    if sign == 0 {
        sample = -sample;
    }
    sample
}

fn alaw_encode_sample(pcm: i16) -> u8 {
    let sign: u8 = if pcm < 0 { 0x00 } else { 0x80 };
    let mut sample = if pcm < 0 { -(pcm as i32) } else { pcm as i32 };
    sample = sample.min(0x7FFF);

    let exponent = if sample >= 256 {
        let mut exp = 7u8;
        let mut mask = 0x4000;
        while exp > 0 && (sample as u32 & mask) == 0 {
            exp -= 1;
            mask >>= 1;
        }
        exp
    } else {
        0
    };

    let mantissa = if exponent == 0 {
        (sample >> 4) as u8 & 0x0F
    } else {
        (sample >> (exponent + 3)) as u8 & 0x0F
    };

    let byte = sign | (exponent << 4) | mantissa;
    byte ^ 0x55
}

/// Linear-interpolation upsample by 2x (e.g. G.711's native 8kHz -> the
/// pipeline's 16kHz). Inserts one interpolated sample between each pair.
pub fn upsample_x2(samples: &[i16]) -> Vec<i16> {
    if samples.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(samples.len() * 2);
    for window in samples.windows(2) {
        out.push(window[0]);
        let mid = (window[0] as i32 + window[1] as i32) / 2;
        out.push(mid as i16);
    }
    out.push(*samples.last().unwrap());
    out.push(*samples.last().unwrap());
    out
}

/// Downsample linear PCM16 by an integer decimation factor (e.g. 48kHz -> 16kHz is /3).
/// Simple box-filter decimation; adequate for speech-band voice traffic.
pub fn decimate(samples: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(factor)
        .map(|chunk| {
            let sum: i32 = chunk.iter().map(|&s| s as i32).sum();
            (sum / chunk.len() as i32) as i16
        })
        .collect()
}

/// Splits a stream of PCM16 samples at `AUDIO_SAMPLE_RATE_HZ` into 20ms
/// `AudioChunk`s, tagging each with the next sequence id.
pub struct AudioFramer {
    seq: SequenceCounter,
    carry: Vec<i16>,
    frame_samples: usize,
}

impl AudioFramer {
    pub fn new(frame_ms: u32) -> Self {
        Self {
            seq: SequenceCounter::new(),
            carry: Vec::new(),
            frame_samples: (AUDIO_SAMPLE_RATE_HZ / 1000 * frame_ms) as usize,
        }
    }

    /// Push decoded PCM16 samples (already at 16kHz mono). Returns zero or
    /// more complete frames; any remainder is buffered for the next push.
    pub fn push(&mut self, samples: &[i16], capture_timestamp_us: u64) -> Vec<AudioChunk> {
        self.carry.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.carry.len() >= self.frame_samples {
            let frame: Vec<i16> = self.carry.drain(..self.frame_samples).collect();
            out.push(AudioChunk {
                seq: self.seq.next(),
                capture_timestamp_us,
                samples: frame,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alaw_roundtrip_is_lossy_but_bounded() {
        for sample in [-20000i16, -1000, -1, 0, 1, 1000, 20000, i16::MAX, i16::MIN + 1] {
            let encoded = alaw_encode_sample(sample);
            let decoded = alaw_decode_sample(encoded);
            let error = (sample as i32 - decoded as i32).abs();
            assert!(error < 1200, "sample={sample} decoded={decoded} error={error}");
        }
    }

    #[test]
    fn alaw_buffer_roundtrip_preserves_length() {
        let samples: Vec<i16> = (0..320).map(|i| (i * 37) as i16).collect();
        let encoded = alaw_encode(&samples);
        assert_eq!(encoded.len(), samples.len());
        let decoded = alaw_decode(&encoded);
        assert_eq!(decoded.len(), samples.len());
    }

    #[test]
    fn decimate_by_three_thirds_the_length() {
        let samples: Vec<i16> = (0..300).collect();
        let out = decimate(&samples, 3);
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn decimate_by_one_is_identity() {
        let samples = vec![1i16, 2, 3];
        assert_eq!(decimate(&samples, 1), samples);
    }

    #[test]
    fn upsample_x2_doubles_length_and_interpolates() {
        let samples = vec![0i16, 100, 200, 300];
        let out = upsample_x2(&samples);
        assert_eq!(out.len(), samples.len() * 2);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 50);
        assert_eq!(out[2], 100);
        assert_eq!(out[3], 150);
        assert_eq!(out[4], 200);
        assert_eq!(out[5], 250);
        assert_eq!(out[6], 300);
        assert_eq!(out[7], 300);
    }

    #[test]
    fn upsample_x2_empty_stays_empty() {
        assert!(upsample_x2(&[]).is_empty());
    }

    #[test]
    fn framer_emits_exact_20ms_chunks() {
        let mut framer = AudioFramer::new(20);
        let samples = vec![0i16; 320 * 3 + 50];
        let chunks = framer.push(&samples, 0);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.samples.len() == 320));
        assert_eq!(chunks[0].seq, 0);
        assert_eq!(chunks[2].seq, 2);
    }

    #[test]
    fn framer_carries_remainder_across_pushes() {
        let mut framer = AudioFramer::new(20);
        let first = framer.push(&[0i16; 100], 0);
        assert!(first.is_empty());
        let second = framer.push(&vec![0i16; 220], 0);
        assert_eq!(second.len(), 1);
    }
}
