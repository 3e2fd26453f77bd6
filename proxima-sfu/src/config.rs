//! SFU coordinator configuration
//!
//! The coordinator never loads this itself; the bootstrap layer deserializes
//! it and injects it at startup.

use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Codecs offered by every router
    pub media_codecs: Vec<CodecConfig>,
    /// Transport listen settings handed to the engine
    pub transport: TransportConfig,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Maximum accepted room id length
    pub max_room_id_len: usize,
    /// Pairing sessions older than this are dropped by the sweeper
    pub session_ttl_secs: u64,
    /// How often the session sweeper runs
    pub session_sweep_interval_secs: u64,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            media_codecs: CodecConfig::defaults(),
            transport: TransportConfig::default(),
            max_rooms: 0,
            max_peers_per_room: 0,
            max_room_id_len: 128,
            session_ttl_secs: 600,
            session_sweep_interval_secs: 60,
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    #[must_use]
    pub const fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs)
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must not be empty".to_string());
        }
        for codec in &self.media_codecs {
            if codec.clock_rate == 0 {
                errors.push(format!("codec {} has a zero clock rate", codec.mime_type));
            }
        }
        if self.transport.rtc_min_port > self.transport.rtc_max_port {
            errors.push(format!(
                "sfu.transport port range is inverted: {} > {}",
                self.transport.rtc_min_port, self.transport.rtc_max_port
            ));
        }
        if !self.transport.enable_udp && !self.transport.enable_tcp {
            errors.push("sfu.transport must enable at least one of UDP or TCP".to_string());
        }
        if self.max_room_id_len == 0 {
            errors.push("sfu.max_room_id_len must be positive".to_string());
        }
        if self.session_sweep_interval_secs == 0 {
            errors.push("sfu.session_sweep_interval_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// One RTP codec offered by routers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecConfig {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl CodecConfig {
    /// Opus, VP8 and H264 baseline
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        let mut vp8_params = serde_json::Map::new();
        vp8_params.insert("x-google-start-bitrate".to_string(), 1000.into());

        let mut h264_params = serde_json::Map::new();
        h264_params.insert("packetization-mode".to_string(), 1.into());

        vec![
            Self {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: Some(2),
                parameters: serde_json::Map::new(),
            },
            Self {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: vp8_params,
            },
            Self {
                kind: MediaKind::Video,
                mime_type: "video/H264".to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: h264_params,
            },
        ]
    }
}

/// WebRTC transport listen settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub listen_ip: String,
    /// Public address announced in ICE candidates
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}
