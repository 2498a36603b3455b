use serde::{Deserialize, Serialize};

/// Top-level configuration for the gateway.
///
/// Loaded from a TOML file and then overlaid with the recognized environment
/// variables (see `apply_env_overrides`). Unknown TOML keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub gallery: GalleryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub ice: IceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origins allowed to make cross-origin requests; empty disallows all.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

/// Credentials and addressing for the upstream generative "Live" service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Credential for the upstream Live service. Populated from `LIVE_API_KEY`.
    #[serde(default)]
    pub live_api_key: Option<String>,
    /// WebSocket endpoint for the Live service.
    #[serde(default = "default_live_endpoint")]
    pub live_endpoint: String,
    /// Model variant selection; the gateway never branches on this value.
    #[serde(default = "default_live_model")]
    pub live_model: String,
    /// Endpoint for the spatial/surface analyzer collaborator.
    #[serde(default = "default_analyzer_endpoint")]
    pub analyzer_endpoint: String,
    /// Endpoint for the face-detection collaborator.
    #[serde(default = "default_detector_endpoint")]
    pub detector_endpoint: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            live_api_key: None,
            live_endpoint: default_live_endpoint(),
            live_model: default_live_model(),
            analyzer_endpoint: default_analyzer_endpoint(),
            detector_endpoint: default_detector_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaConfig {
    /// Video sampling cadence in milliseconds. `SAMPLE_INTERVAL_MS`.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Face count above which a frame is blocked. `CROWD_THRESHOLD`.
    #[serde(default = "default_crowd_threshold")]
    pub crowd_threshold: u32,
    /// Minimum Gaussian blur radius in pixels. `BLUR_RADIUS_MIN`.
    #[serde(default = "default_blur_radius_min")]
    pub blur_radius_min: u32,
    /// JPEG quality used for stills sent upstream and for sampling (70-85).
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Maximum long-side pixel dimension for images sent upstream.
    #[serde(default = "default_max_image_dim")]
    pub max_image_dim: u32,
    /// Timeout for a single face-detection call, in milliseconds.
    #[serde(default = "default_detector_timeout_ms")]
    pub detector_timeout_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            crowd_threshold: default_crowd_threshold(),
            blur_radius_min: default_blur_radius_min(),
            jpeg_quality: default_jpeg_quality(),
            max_image_dim: default_max_image_dim(),
            detector_timeout_ms: default_detector_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Idle timeout in seconds (no ingress media). `SESSION_IDLE_SECS`.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    /// Hard per-session wall-clock cap in seconds.
    #[serde(default = "default_max_wall_clock_secs")]
    pub max_wall_clock_secs: u64,
    /// Consecutive above-threshold energy duration that triggers barge-in.
    #[serde(default = "default_barge_in_ms")]
    pub barge_in_ms: u64,
    /// RMS energy threshold (0.0-1.0 of full scale) above which audio counts
    /// as speech for barge-in purposes.
    #[serde(default = "default_barge_in_energy_threshold")]
    pub barge_in_energy_threshold: f32,
    /// Signaling negotiate timeout in seconds.
    #[serde(default = "default_negotiate_timeout_secs")]
    pub negotiate_timeout_secs: u64,
    /// Upstream connect timeout in seconds.
    #[serde(default = "default_upstream_connect_timeout_secs")]
    pub upstream_connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_idle_secs(),
            max_wall_clock_secs: default_max_wall_clock_secs(),
            barge_in_ms: default_barge_in_ms(),
            barge_in_energy_threshold: default_barge_in_energy_threshold(),
            negotiate_timeout_secs: default_negotiate_timeout_secs(),
            upstream_connect_timeout_secs: default_upstream_connect_timeout_secs(),
        }
    }
}

/// Addressing for the two opaque collaborator stores behind `GalleryStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GalleryConfig {
    /// Location of the blob store. `BLOB_BUCKET`.
    #[serde(default = "default_blob_bucket")]
    pub blob_bucket: String,
    /// Namespace/collection of the record store. `RECORD_NAMESPACE`.
    #[serde(default = "default_record_namespace")]
    pub record_namespace: String,
    /// Lifetime of minted download URLs, in seconds. `SIGNED_URL_TTL_SECS`.
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            blob_bucket: default_blob_bucket(),
            record_namespace: default_record_namespace(),
            signed_url_ttl_secs: default_signed_url_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Per-source requests/minute on `process-frame` and `spatial`. `RATE_LIMIT_RPM`.
    #[serde(default = "default_rate_limit_rpm")]
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_rate_limit_rpm(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_live_endpoint() -> String {
    "wss://live.example.invalid/v1/stream".to_string()
}
fn default_live_model() -> String {
    "live".to_string()
}
fn default_analyzer_endpoint() -> String {
    "https://analyzer.example.invalid/v1/spatial".to_string()
}
fn default_detector_endpoint() -> String {
    "https://detector.example.invalid/v1/faces".to_string()
}
fn default_sample_interval_ms() -> u64 {
    1000
}
fn default_crowd_threshold() -> u32 {
    3
}
fn default_blur_radius_min() -> u32 {
    15
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_max_image_dim() -> u32 {
    768
}
fn default_detector_timeout_ms() -> u64 {
    2000
}
fn default_idle_secs() -> u64 {
    300
}
fn default_max_wall_clock_secs() -> u64 {
    3600 * 4
}
fn default_barge_in_ms() -> u64 {
    200
}
fn default_barge_in_energy_threshold() -> f32 {
    0.02
}
fn default_negotiate_timeout_secs() -> u64 {
    15
}
fn default_upstream_connect_timeout_secs() -> u64 {
    10
}
fn default_blob_bucket() -> String {
    "lumen-snapshots".to_string()
}
fn default_record_namespace() -> String {
    "lumen-gallery".to_string()
}
fn default_signed_url_ttl_secs() -> u64 {
    900
}
fn default_rate_limit_rpm() -> u32 {
    10
}
fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

impl GatewayConfig {
    /// Overlay recognized environment variables (spec §6) onto a loaded config.
    /// Call this after TOML parsing so the file provides defaults and the
    /// environment can override them at deploy time.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LIVE_API_KEY") {
            self.upstream.live_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("BLOB_BUCKET") {
            self.gallery.blob_bucket = v;
        }
        if let Ok(v) = std::env::var("RECORD_NAMESPACE") {
            self.gallery.record_namespace = v;
        }
        if let Some(v) = parse_env("SAMPLE_INTERVAL_MS") {
            self.media.sample_interval_ms = v;
        }
        if let Some(v) = parse_env("CROWD_THRESHOLD") {
            self.media.crowd_threshold = v;
        }
        if let Some(v) = parse_env("BLUR_RADIUS_MIN") {
            self.media.blur_radius_min = v;
        }
        if let Some(v) = parse_env("SIGNED_URL_TTL_SECS") {
            self.gallery.signed_url_ttl_secs = v;
        }
        if let Some(v) = parse_env("RATE_LIMIT_RPM") {
            self.rate_limit.requests_per_minute = v;
        }
        if let Some(v) = parse_env("SESSION_IDLE_SECS") {
            self.session.idle_secs = v;
        }
        if let Ok(v) = std::env::var("CORS_ALLOWED_ORIGINS") {
            self.server.cors_allowed_origins =
                v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
    }

    /// Validate the configuration, returning `ERROR:`/`WARNING:`-prefixed
    /// issues. `ERROR:` issues mean the process should not start (exit code 2).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.upstream.live_api_key.is_none() {
            issues.push(
                "WARNING: no LIVE_API_KEY configured; the upstream bridge will fail to connect."
                    .to_string(),
            );
        }
        if self.media.jpeg_quality < 70 || self.media.jpeg_quality > 85 {
            issues.push(format!(
                "ERROR: media.jpeg_quality must be within 70..=85, got {}.",
                self.media.jpeg_quality
            ));
        }
        if self.media.max_image_dim == 0 || self.media.max_image_dim > 768 {
            issues.push(format!(
                "ERROR: media.max_image_dim must be within 1..=768, got {}.",
                self.media.max_image_dim
            ));
        }
        if self.media.sample_interval_ms == 0 {
            issues.push("ERROR: media.sample_interval_ms must be nonzero.".to_string());
        }
        if self.rate_limit.requests_per_minute == 0 {
            issues.push(
                "WARNING: rate_limit.requests_per_minute is 0; every request will be rejected."
                    .to_string(),
            );
        }
        if self.session.idle_secs == 0 {
            issues.push("WARNING: session.idle_secs is 0; idle sessions are never reaped.".to_string());
        }

        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        if has_errors { Err(issues) } else { Ok(()) }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_except_missing_key_warning() {
        let config = GatewayConfig::default_for_test();
        let result = config.validate();
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn port_zero_is_an_error() {
        let mut config = GatewayConfig::default_for_test();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn jpeg_quality_out_of_range_is_an_error() {
        let mut config = GatewayConfig::default_for_test();
        config.media.jpeg_quality = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        // SAFETY: test runs single-threaded w.r.t. this key; no other test reads it.
        unsafe {
            std::env::set_var("CROWD_THRESHOLD", "7");
        }
        let mut config = GatewayConfig::default_for_test();
        config.apply_env_overrides();
        assert_eq!(config.media.crowd_threshold, 7);
        unsafe {
            std::env::remove_var("CROWD_THRESHOLD");
        }
    }

    impl GatewayConfig {
        fn default_for_test() -> Self {
            GatewayConfig {
                server: ServerConfig::default(),
                upstream: UpstreamConfig::default(),
                media: MediaConfig::default(),
                session: SessionConfig::default(),
                gallery: GalleryConfig::default(),
                rate_limit: RateLimitConfig::default(),
                ice: IceConfig::default(),
            }
        }
    }
}
