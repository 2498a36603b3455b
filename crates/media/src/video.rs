//! H.264 Annex B ingress decode and JPEG re-encode (C1, §4.3).
//!
//! The gateway never sends video back to the browser (only audio egress),
//! so there is no encoder here — only the decode+JPEG path the sampler and
//! privacy shield need.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageBuffer, Rgb};
use openh264::decoder::Decoder as H264Decoder;
use openh264::formats::YUVSource;
use openh264::nal_units;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VideoCodecError {
    #[error("h264 decoder init failed: {0}")]
    Init(String),
    #[error("h264 decode failed: {0}")]
    Decode(String),
    #[error("jpeg encode failed: {0}")]
    Jpeg(String),
}

/// Decodes an ingress H.264 Annex B video track into raw RGB8 frames.
pub struct VideoDecoder {
    inner: H264Decoder,
}

pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl VideoDecoder {
    pub fn new() -> Result<Self, VideoCodecError> {
        let inner = H264Decoder::new().map_err(|e| VideoCodecError::Init(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Feed one Annex-B access unit (as produced by the `webrtc` crate's
    /// RTP depacketizer) and return a decoded RGB8 frame if one completed.
    pub fn decode(&mut self, annex_b: &[u8]) -> Result<Option<DecodedImage>, VideoCodecError> {
        let mut last = None;
        for packet in nal_units(annex_b) {
            match self.inner.decode(packet) {
                Ok(Some(yuv)) => last = Some(yuv_to_rgb(&yuv)),
                Ok(None) => {}
                Err(e) => return Err(VideoCodecError::Decode(e.to_string())),
            }
        }
        Ok(last)
    }
}

fn yuv_to_rgb(yuv: &openh264::decoder::DecodedYUV) -> DecodedImage {
    let (width, height) = YUVSource::dimensions(yuv);
    let mut rgb = vec![0u8; yuv.estimate_rgb_u8_size()];
    yuv.write_rgb8(&mut rgb);
    DecodedImage { width: width as u32, height: height as u32, rgb }
}

/// JPEG-encode an RGB8 image at the given quality (70-85 per §6).
pub fn encode_jpeg(width: u32, height: u32, rgb: &[u8], quality: u8) -> Result<Vec<u8>, VideoCodecError> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| VideoCodecError::Jpeg(e.to_string()))?;
    Ok(out)
}

/// Decode a JPEG buffer back to an RGB8 `ImageBuffer` for blur compositing.
pub fn decode_jpeg(jpeg: &[u8]) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>, VideoCodecError> {
    let img = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| VideoCodecError::Jpeg(e.to_string()))?;
    Ok(img.to_rgb8())
}

/// Scale so the long side is at most `max_dim`, preserving aspect ratio.
/// No-op if the image already fits.
pub fn clamp_long_side(img: &ImageBuffer<Rgb<u8>, Vec<u8>>, max_dim: u32) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    let (w, h) = img.dimensions();
    let long_side = w.max(h);
    if long_side <= max_dim {
        return img.clone();
    }
    let scale = max_dim as f64 / long_side as f64;
    let new_w = ((w as f64) * scale).round().max(1.0) as u32;
    let new_h = ((h as f64) * scale).round().max(1.0) as u32;
    image::imageops::resize(img, new_w, new_h, image::imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_roundtrip_preserves_dimensions() {
        let width = 16u32;
        let height = 16u32;
        let rgb = vec![128u8; (width * height * 3) as usize];
        let jpeg = encode_jpeg(width, height, &rgb, 80).unwrap();
        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (width, height));
    }

    #[test]
    fn clamp_long_side_scales_down() {
        let img = ImageBuffer::from_pixel(1600, 800, Rgb([10, 20, 30]));
        let clamped = clamp_long_side(&img, 768);
        assert_eq!(clamped.width(), 768);
        assert_eq!(clamped.height(), 384);
    }

    #[test]
    fn clamp_long_side_is_noop_when_already_small() {
        let img = ImageBuffer::from_pixel(100, 50, Rgb([1, 2, 3]));
        let clamped = clamp_long_side(&img, 768);
        assert_eq!(clamped.dimensions(), (100, 50));
    }
}
