//! Relay configuration

use crate::rtp::{RtcpFeedback, RtpCodecCapability};
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// IP the engine listens on
    pub listen_ip: IpAddr,
    /// IP advertised in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    /// Lowest RTC port handed to transports
    pub rtc_min_port: u16,
    /// Highest RTC port handed to transports
    pub rtc_max_port: u16,
    /// Initial outgoing bitrate estimate per transport (bps)
    pub initial_available_outgoing_bitrate: u32,
    /// Codecs the relay supports; the capability set is built from these
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Capacity of each connection's server-push queue
    pub push_channel_capacity: usize,
    /// Interval of the statistics log task (0 = disabled)
    pub stats_interval_secs: u64,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: Some("127.0.0.1".to_string()),
            rtc_min_port: 10000,
            rtc_max_port: 10100,
            initial_available_outgoing_bitrate: 1_000_000,
            media_codecs: default_media_codecs(),
            push_channel_capacity: 64,
            stats_interval_secs: 30,
        }
    }
}

impl SfuConfig {
    /// Collect every configuration problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.rtc_min_port == 0 {
            errors.push("sfu.rtc_min_port must be non-zero".to_string());
        }
        if self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "sfu.rtc_min_port ({}) is greater than sfu.rtc_max_port ({})",
                self.rtc_min_port, self.rtc_max_port
            ));
        }
        if self.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must not be empty".to_string());
        }
        if let Some(ip) = &self.announced_ip {
            if ip.trim().is_empty() {
                errors.push("sfu.announced_ip must not be blank".to_string());
            }
        }
        if self.push_channel_capacity == 0 {
            errors.push("sfu.push_channel_capacity must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Opus audio and VP8 video
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let fb = |kind: &str, parameter: &str| RtcpFeedback {
        kind: kind.to_string(),
        parameter: parameter.to_string(),
    };

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![fb("transport-cc", "")],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::from([("x-google-start-bitrate".to_string(), json!(1000))]),
            rtcp_feedback: vec![
                fb("nack", ""),
                fb("nack", "pli"),
                fb("ccm", "fir"),
                fb("goog-remb", ""),
                fb("transport-cc", ""),
            ],
        },
    ]
}
