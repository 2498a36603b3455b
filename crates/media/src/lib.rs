pub mod audio;
pub mod frame;
pub mod privacy;
pub mod sampler;
pub mod video;

pub use audio::{AudioFramer, alaw_decode, alaw_encode, decimate, upsample_x2};
pub use frame::{
    AUDIO_FRAME_MS, AUDIO_FRAME_SAMPLES, AUDIO_SAMPLE_RATE_HZ, AudioChunk, FramePayload,
    MediaFrame, SequenceCounter, StillFrame, TrackKind,
};
pub use privacy::{DetectorError, FaceDetector, FaceRect, PrivacyShield, PrivacyVerdict, ShieldError, prepare_snapshot};
pub use sampler::FrameSampler;
pub use video::{DecodedImage, VideoCodecError, VideoDecoder, clamp_long_side, decode_jpeg, encode_jpeg};
