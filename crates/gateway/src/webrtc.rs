//! In-process WebRTC termination (C6 part of SignalingGateway + MediaCodec
//! ingress/egress plumbing). Grounded on the teacher's peer connection setup,
//! adapted from a subprocess agent sending one H.264+Opus stream to a server
//! terminating H.264 ingress + PCMA ingress/egress directly in-process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use rtp::codecs::h264::H264Packet;
use rtp::packetizer::Depacketizer;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_PCMA, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// A complete ingress video access unit (Annex-B NAL units, one marker-bit
/// boundary) ready for `lumen_media::VideoDecoder`.
pub type VideoAccessUnit = Vec<u8>;

/// One 20ms PCMA (A-law) frame received from the browser's audio track.
pub type AudioFrame = Vec<u8>;

pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Owns the in-process `RTCPeerConnection` for one session: negotiates SDP,
/// trickles ICE, demuxes ingress H.264/PCMA tracks into plain byte channels,
/// and exposes a PCMA egress track for `UpstreamBridge` output audio.
pub struct SessionPeer {
    peer_connection: Arc<RTCPeerConnection>,
    egress_audio: Arc<TrackLocalStaticSample>,
}

impl SessionPeer {
    pub async fn new(ice_servers: Vec<IceServerConfig>) -> Result<(Self, mpsc::Receiver<VideoAccessUnit>, mpsc::Receiver<AudioFrame>)> {
        let mut media_engine = MediaEngine::default();

        let h264_feedback = vec![
            RTCPFeedback { typ: "goog-remb".into(), parameter: "".into() },
            RTCPFeedback { typ: "ccm".into(), parameter: "fir".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "pli".into() },
        ];
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_string(),
                    rtcp_feedback: h264_feedback,
                },
                payload_type: 102,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_PCMA.to_string(),
                    clock_rate: 8000,
                    channels: 1,
                    sdp_fmtp_line: "".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 8,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new().with_media_engine(media_engine).with_interceptor_registry(registry).build();

        let rtc_ice_servers: Vec<RTCIceServer> = if ice_servers.is_empty() {
            vec![RTCIceServer { urls: vec!["stun:stun.l.google.com:19302".to_string()], ..Default::default() }]
        } else {
            ice_servers
                .into_iter()
                .map(|s| RTCIceServer { urls: s.urls, username: s.username.unwrap_or_default(), credential: s.credential.unwrap_or_default() })
                .collect()
        };

        let config = RTCConfiguration { ice_servers: rtc_ice_servers, ..Default::default() };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let egress_audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability { mime_type: MIME_TYPE_PCMA.to_string(), clock_rate: 8000, channels: 1, ..Default::default() },
            "audio".to_string(),
            "lumen".to_string(),
        ));
        peer_connection
            .add_transceiver_from_track(Arc::clone(&egress_audio) as Arc<dyn TrackLocal + Send + Sync>, None)
            .await
            .context("failed to add egress audio track")?;

        // Recvonly video transceiver: the gateway ingests camera frames but
        // never sends video back (§1, out of scope: client rendering logic).
        peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(webrtc::rtp_transceiver::RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .context("failed to add video transceiver")?;

        let (video_tx, video_rx) = mpsc::channel::<VideoAccessUnit>(4);
        let (audio_tx, audio_rx) = mpsc::channel::<AudioFrame>(64);

        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let video_tx = video_tx.clone();
            let audio_tx = audio_tx.clone();
            Box::pin(async move {
                match track.kind() {
                    RTPCodecType::Video => {
                        tokio::spawn(read_video_track(track, video_tx));
                    }
                    RTPCodecType::Audio => {
                        tokio::spawn(read_audio_track(track, audio_tx));
                    }
                    RTPCodecType::Unspecified => {}
                }
            })
        }));

        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => tracing::warn!("peer connection failed"),
                RTCPeerConnectionState::Disconnected => tracing::warn!("peer connection disconnected"),
                _ => tracing::debug!(?state, "peer connection state changed"),
            }
            Box::pin(async {})
        }));

        Ok((Self { peer_connection, egress_audio }, video_rx, audio_rx))
    }

    pub async fn handle_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string()).context("invalid SDP offer")?;
        self.peer_connection.set_remote_description(offer).await.context("set_remote_description failed")?;
        let answer = self.peer_connection.create_answer(None).await.context("create_answer failed")?;
        self.peer_connection.set_local_description(answer.clone()).await.context("set_local_description failed")?;
        Ok(answer.sdp)
    }

    pub async fn add_ice_candidate(&self, candidate: &str, sdp_mid: Option<&str>, sdp_mline_index: Option<u16>) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.map(|s| s.to_string()),
            sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection.add_ice_candidate(init).await.context("add_ice_candidate failed")?;
        Ok(())
    }

    pub fn on_ice_candidate(&self, callback: impl Fn(String, Option<String>, Option<u16>) + Send + Sync + 'static) {
        let callback = Arc::new(callback);
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    let cb = Arc::clone(&callback);
                    cb(json.candidate, json.sdp_mid, json.sdp_mline_index);
                }
            }
            Box::pin(async {})
        }));
    }

    /// Write one PCMA sample onto the egress audio track (§4.6, UpstreamBridge output).
    pub async fn write_audio_sample(&self, data: Vec<u8>, duration: Duration) -> Result<()> {
        self.egress_audio
            .write_sample(&webrtc::media::Sample { data: Bytes::from(data), duration, ..Default::default() })
            .await
            .context("write_sample failed")?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.peer_connection.close().await.context("close failed")
    }
}

async fn read_video_track(track: Arc<webrtc::track::track_remote::TrackRemote>, tx: mpsc::Sender<VideoAccessUnit>) {
    let mut depacketizer = H264Packet::default();
    let mut access_unit = Vec::new();
    loop {
        let (packet, _attrs) = match track.read_rtp().await {
            Ok(v) => v,
            Err(_) => break,
        };
        match depacketizer.depacketize(&packet.payload) {
            Ok(nalu) if !nalu.is_empty() => access_unit.extend_from_slice(&nalu),
            _ => {}
        }
        if packet.header.marker {
            if !access_unit.is_empty() && tx.send(std::mem::take(&mut access_unit)).await.is_err() {
                break;
            }
        }
    }
}

async fn read_audio_track(track: Arc<webrtc::track::track_remote::TrackRemote>, tx: mpsc::Sender<AudioFrame>) {
    loop {
        let (packet, _attrs) = match track.read_rtp().await {
            Ok(v) => v,
            Err(_) => break,
        };
        if tx.send(packet.payload.to_vec()).await.is_err() {
            break;
        }
    }
}
