//! PrivacyShield (C3, §4.2): blurs or blocks faces in outgoing still frames
//! before they ever leave the gateway.

use async_trait::async_trait;
use image::{ImageBuffer, Rgb};
use thiserror::Error;

use crate::video::{clamp_long_side, decode_jpeg, encode_jpeg, VideoCodecError};

/// Normalized face bounding box in pixel coordinates of the image it was
/// detected against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("face detector timed out")]
    Timeout,
    #[error("face detector unavailable: {0}")]
    Unavailable(String),
}

/// Abstraction over the remote face-detection collaborator (opaque, out of
/// scope). Production code talks to it over HTTP; tests substitute a fake.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<FaceRect>, DetectorError>;
}

/// Outcome of running a still frame through the shield (§4.2).
#[derive(Debug, Clone)]
pub enum PrivacyVerdict {
    Safe,
    Blurred { processed_jpeg: Vec<u8>, face_count: u32 },
    Blocked { face_count: u32, reason: String },
}

#[derive(Debug, Error)]
pub enum ShieldError {
    #[error(transparent)]
    Codec(#[from] VideoCodecError),
}

pub struct PrivacyShield {
    detector: Box<dyn FaceDetector>,
    blur_radius_min: u32,
    crowd_threshold: u32,
}

impl PrivacyShield {
    pub fn new(detector: Box<dyn FaceDetector>, blur_radius_min: u32, crowd_threshold: u32) -> Self {
        Self { detector, blur_radius_min, crowd_threshold }
    }

    /// Run the shield against an already-JPEG-encoded still frame.
    /// Fails closed: any detector error yields `Blocked` with zero faces
    /// reported, never `Safe`.
    pub async fn evaluate(&self, jpeg: &[u8]) -> Result<PrivacyVerdict, ShieldError> {
        let faces = match self.detector.detect(jpeg).await {
            Ok(faces) => faces,
            Err(_) => {
                return Ok(PrivacyVerdict::Blocked {
                    face_count: 0,
                    reason: "detector_unavailable".to_string(),
                });
            }
        };

        if faces.is_empty() {
            return Ok(PrivacyVerdict::Safe);
        }

        if faces.len() as u32 > self.crowd_threshold {
            return Ok(PrivacyVerdict::Blocked {
                face_count: faces.len() as u32,
                reason: "crowd_threshold_exceeded".to_string(),
            });
        }

        let image = decode_jpeg(jpeg)?;
        let (width, height) = image.dimensions();
        let blurred = blur_faces(&image, &faces, self.blur_radius_min);
        let processed_jpeg = encode_jpeg(width, height, &blurred, 80)?;
        Ok(PrivacyVerdict::Blurred { processed_jpeg, face_count: faces.len() as u32 })
    }
}

/// Apply a Gaussian blur restricted to each face rectangle, compositing the
/// blurred patches back onto the original image. Radius scales with image
/// size so faces stay unrecognizable regardless of resolution.
fn blur_faces(image: &ImageBuffer<Rgb<u8>, Vec<u8>>, faces: &[FaceRect], blur_radius_min: u32) -> Vec<u8> {
    let (width, height) = image.dimensions();
    let short_side = width.min(height);
    let radius = blur_radius_min.max(short_side / 6) as f32;

    let blurred_whole = image::imageops::blur(image, radius);
    let mut out = image.clone();
    for face in faces {
        let x0 = face.x.min(width);
        let y0 = face.y.min(height);
        let x1 = (face.x + face.width).min(width);
        let y1 = (face.y + face.height).min(height);
        for y in y0..y1 {
            for x in x0..x1 {
                out.put_pixel(x, y, *blurred_whole.get_pixel(x, y));
            }
        }
    }
    out.into_raw()
}

/// Convenience for the `/snapshot` path: decode, clamp to `max_dim`, re-encode.
pub fn prepare_snapshot(jpeg: &[u8], max_dim: u32, quality: u8) -> Result<Vec<u8>, VideoCodecError> {
    let image = decode_jpeg(jpeg)?;
    let clamped = clamp_long_side(&image, max_dim);
    encode_jpeg(clamped.width(), clamped.height(), &clamped, quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encode_jpeg;

    struct FakeDetector(Vec<FaceRect>);

    #[async_trait]
    impl FaceDetector for FakeDetector {
        async fn detect(&self, _jpeg: &[u8]) -> Result<Vec<FaceRect>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    #[async_trait]
    impl FaceDetector for FailingDetector {
        async fn detect(&self, _jpeg: &[u8]) -> Result<Vec<FaceRect>, DetectorError> {
            Err(DetectorError::Timeout)
        }
    }

    fn sample_jpeg() -> Vec<u8> {
        let rgb = vec![120u8; 64 * 64 * 3];
        encode_jpeg(64, 64, &rgb, 80).unwrap()
    }

    #[tokio::test]
    async fn no_faces_is_safe() {
        let shield = PrivacyShield::new(Box::new(FakeDetector(vec![])), 15, 3);
        let verdict = shield.evaluate(&sample_jpeg()).await.unwrap();
        assert!(matches!(verdict, PrivacyVerdict::Safe));
    }

    #[tokio::test]
    async fn faces_under_crowd_threshold_are_blurred() {
        let faces = vec![FaceRect { x: 4, y: 4, width: 20, height: 20 }];
        let shield = PrivacyShield::new(Box::new(FakeDetector(faces)), 15, 3);
        let verdict = shield.evaluate(&sample_jpeg()).await.unwrap();
        match verdict {
            PrivacyVerdict::Blurred { face_count, .. } => assert_eq!(face_count, 1),
            other => panic!("expected Blurred, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn faces_over_crowd_threshold_are_blocked() {
        let faces = vec![
            FaceRect { x: 0, y: 0, width: 5, height: 5 },
            FaceRect { x: 10, y: 10, width: 5, height: 5 },
            FaceRect { x: 20, y: 20, width: 5, height: 5 },
            FaceRect { x: 30, y: 30, width: 5, height: 5 },
        ];
        let shield = PrivacyShield::new(Box::new(FakeDetector(faces)), 15, 3);
        let verdict = shield.evaluate(&sample_jpeg()).await.unwrap();
        match verdict {
            PrivacyVerdict::Blocked { face_count, reason } => {
                assert_eq!(face_count, 4);
                assert_eq!(reason, "crowd_threshold_exceeded");
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn detector_failure_fails_closed() {
        let shield = PrivacyShield::new(Box::new(FailingDetector), 15, 3);
        let verdict = shield.evaluate(&sample_jpeg()).await.unwrap();
        match verdict {
            PrivacyVerdict::Blocked { face_count, reason } => {
                assert_eq!(face_count, 0);
                assert_eq!(reason, "detector_unavailable");
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
    }
}
