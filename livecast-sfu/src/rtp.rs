//! RTP capabilities, parameters and the process-wide capability set
//!
//! The capability set is built once from the configured media codecs and is
//! read-only afterwards. It is used to:
//! - validate the RTP parameters of incoming producers
//! - intersect a producer's parameters with a subscriber's declared
//!   capabilities to build consumer parameters

use crate::error::SfuError;
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// First dynamic RTP payload type
const DYNAMIC_PAYLOAD_TYPE_MIN: u8 = 96;
const DYNAMIC_PAYLOAD_TYPE_MAX: u8 = 127;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

/// A codec the relay (or a remote endpoint) is able to handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    pub kind: MediaKind,
    pub uri: String,
    pub preferred_id: u16,
    #[serde(default)]
    pub preferred_encrypt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u16,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    #[serde(default)]
    pub dtx: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default = "default_reduced_size")]
    pub reduced_size: bool,
}

const fn default_reduced_size() -> bool {
    true
}

/// RTP parameters of a producer (as sent by the publisher) or a consumer
/// (as computed by the relay)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

/// Retransmission, FEC and similar codecs that ride along with a media codec
fn is_feature_codec(mime_type: &str) -> bool {
    let subtype = mime_type
        .split_once('/')
        .map_or(mime_type, |(_, subtype)| subtype)
        .to_ascii_lowercase();
    matches!(subtype.as_str(), "rtx" | "red" | "ulpfec" | "flexfec")
}

fn parameter_u64(parameters: &BTreeMap<String, Value>, key: &str) -> Option<u64> {
    parameters.get(key).and_then(|v| match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

/// Codec identity used for matching: MIME type, clock rate, channel count and,
/// for H264, the packetization mode.
struct CodecKey<'a> {
    mime_type: &'a str,
    clock_rate: u32,
    channels: Option<u8>,
    parameters: &'a BTreeMap<String, Value>,
}

impl<'a> From<&'a RtpCodecCapability> for CodecKey<'a> {
    fn from(codec: &'a RtpCodecCapability) -> Self {
        Self {
            mime_type: &codec.mime_type,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: &codec.parameters,
        }
    }
}

impl<'a> From<&'a RtpCodecParameters> for CodecKey<'a> {
    fn from(codec: &'a RtpCodecParameters) -> Self {
        Self {
            mime_type: &codec.mime_type,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: &codec.parameters,
        }
    }
}

impl CodecKey<'_> {
    fn matches(&self, other: &CodecKey<'_>) -> bool {
        if !self.mime_type.eq_ignore_ascii_case(other.mime_type) || self.clock_rate != other.clock_rate {
            return false;
        }

        if self.mime_type.to_ascii_lowercase().starts_with("audio/")
            && self.channels.unwrap_or(1) != other.channels.unwrap_or(1)
        {
            return false;
        }

        if self.mime_type.eq_ignore_ascii_case("video/h264") {
            let mode = parameter_u64(self.parameters, "packetization-mode").unwrap_or(0);
            let other_mode = parameter_u64(other.parameters, "packetization-mode").unwrap_or(0);
            if mode != other_mode {
                return false;
            }
        }

        true
    }
}

fn default_header_extensions() -> Vec<RtpHeaderExtension> {
    let ext = |kind, uri: &str, preferred_id| RtpHeaderExtension {
        kind,
        uri: uri.to_string(),
        preferred_id,
        preferred_encrypt: false,
    };

    vec![
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(MediaKind::Video, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(
            MediaKind::Audio,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            4,
        ),
        ext(
            MediaKind::Video,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            4,
        ),
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:ssrc-audio-level", 10),
        ext(MediaKind::Video, "urn:3gpp:video-orientation", 11),
    ]
}

/// The single negotiated capability scope of the relay
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    capabilities: RtpCapabilities,
}

impl CapabilitySet {
    /// Build the capability set from the configured media codecs, assigning
    /// dynamic payload types to codecs that do not carry one.
    pub fn new(media_codecs: &[RtpCodecCapability]) -> Result<Self, SfuError> {
        if media_codecs.is_empty() {
            return Err(SfuError::InvalidCodecConfig(
                "at least one media codec is required".to_string(),
            ));
        }

        let mut used: BTreeSet<u8> = BTreeSet::new();
        for codec in media_codecs {
            if !codec
                .mime_type
                .to_ascii_lowercase()
                .starts_with(codec.kind.mime_prefix())
            {
                return Err(SfuError::InvalidCodecConfig(format!(
                    "{} is not a valid {} codec",
                    codec.mime_type, codec.kind
                )));
            }
            if codec.clock_rate == 0 {
                return Err(SfuError::InvalidCodecConfig(format!(
                    "{} has no clock rate",
                    codec.mime_type
                )));
            }
            if let Some(pt) = codec.preferred_payload_type {
                if !used.insert(pt) {
                    return Err(SfuError::InvalidCodecConfig(format!(
                        "duplicate payload type {pt}"
                    )));
                }
            }
        }

        let mut next = DYNAMIC_PAYLOAD_TYPE_MIN;
        let mut codecs = Vec::with_capacity(media_codecs.len());
        for codec in media_codecs {
            let mut codec = codec.clone();
            if codec.preferred_payload_type.is_none() {
                while used.contains(&next) {
                    next = next.checked_add(1).ok_or_else(|| {
                        SfuError::InvalidCodecConfig("out of dynamic payload types".to_string())
                    })?;
                }
                if next > DYNAMIC_PAYLOAD_TYPE_MAX {
                    return Err(SfuError::InvalidCodecConfig(
                        "out of dynamic payload types".to_string(),
                    ));
                }
                used.insert(next);
                codec.preferred_payload_type = Some(next);
            }
            codecs.push(codec);
        }

        Ok(Self {
            capabilities: RtpCapabilities {
                codecs,
                header_extensions: default_header_extensions(),
            },
        })
    }

    /// Capabilities announced to clients
    #[must_use]
    pub const fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    fn find_codec(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        let key = CodecKey::from(codec);
        self.capabilities
            .codecs
            .iter()
            .find(|cap| CodecKey::from(*cap).matches(&key))
    }

    /// Validate the RTP parameters a publisher wants to produce with
    pub fn validate_producer(&self, kind: MediaKind, params: &RtpParameters) -> Result<(), SfuError> {
        let mut media_codecs = 0;

        for codec in &params.codecs {
            if !codec.mime_type.to_ascii_lowercase().starts_with(kind.mime_prefix()) {
                return Err(SfuError::UnsupportedRtpParameters(format!(
                    "{} does not match kind {kind}",
                    codec.mime_type
                )));
            }
            if is_feature_codec(&codec.mime_type) {
                continue;
            }
            if self.find_codec(codec).is_none() {
                return Err(SfuError::UnsupportedRtpParameters(format!(
                    "unsupported codec {}/{}",
                    codec.mime_type, codec.clock_rate
                )));
            }
            media_codecs += 1;
        }

        if media_codecs == 0 {
            return Err(SfuError::UnsupportedRtpParameters(
                "no media codec".to_string(),
            ));
        }
        if params.encodings.is_empty() {
            return Err(SfuError::UnsupportedRtpParameters(
                "no encodings".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether a remote endpoint with `remote` capabilities can receive a
    /// producer sending with `producer` parameters
    #[must_use]
    pub fn can_consume(&self, producer: &RtpParameters, remote: &RtpCapabilities) -> bool {
        producer
            .codecs
            .iter()
            .filter(|c| !is_feature_codec(&c.mime_type))
            .any(|c| Self::remote_codec(c, remote).is_some())
    }

    fn remote_codec<'a>(
        codec: &RtpCodecParameters,
        remote: &'a RtpCapabilities,
    ) -> Option<&'a RtpCodecCapability> {
        let key = CodecKey::from(codec);
        remote
            .codecs
            .iter()
            .find(|cap| CodecKey::from(*cap).matches(&key))
    }

    /// Build the parameters a consumer will receive with.
    ///
    /// Keeps the producer's media codecs the remote side supports (mapped to
    /// the remote's preferred payload types and RTCP feedback), the header
    /// extensions the remote understands, and a single fresh encoding.
    pub fn consumer_parameters(
        &self,
        kind: MediaKind,
        producer: &RtpParameters,
        remote: &RtpCapabilities,
    ) -> Option<RtpParameters> {
        let codecs: Vec<RtpCodecParameters> = producer
            .codecs
            .iter()
            .filter(|c| !is_feature_codec(&c.mime_type))
            .filter_map(|codec| {
                let remote_cap = Self::remote_codec(codec, remote)?;
                let rtcp_feedback = codec
                    .rtcp_feedback
                    .iter()
                    .filter(|fb| remote_cap.rtcp_feedback.contains(fb))
                    .cloned()
                    .collect();
                Some(RtpCodecParameters {
                    payload_type: remote_cap.preferred_payload_type.unwrap_or(codec.payload_type),
                    rtcp_feedback,
                    ..codec.clone()
                })
            })
            .collect();

        if codecs.is_empty() {
            return None;
        }

        let header_extensions = producer
            .header_extensions
            .iter()
            .filter_map(|ext| {
                remote
                    .header_extensions
                    .iter()
                    .find(|r| r.kind == kind && r.uri == ext.uri)
                    .map(|r| RtpHeaderExtensionParameters {
                        id: r.preferred_id,
                        ..ext.clone()
                    })
            })
            .collect();

        let encoding = RtpEncodingParameters {
            ssrc: Some(random_ssrc()),
            max_bitrate: producer.encodings.first().and_then(|e| e.max_bitrate),
            ..Default::default()
        };

        Some(RtpParameters {
            mid: None,
            codecs,
            header_extensions,
            encodings: vec![encoding],
            rtcp: RtcpParameters {
                cname: producer.rtcp.cname.clone(),
                reduced_size: true,
            },
        })
    }
}

/// SSRC 0 is reserved
fn random_ssrc() -> u32 {
    rand::random::<u32>().max(1)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn opus() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![],
        }
    }

    pub(crate) fn vp8() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![RtcpFeedback {
                kind: "nack".to_string(),
                parameter: String::new(),
            }],
        }
    }

    pub(crate) fn audio_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: BTreeMap::new(),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![RtpHeaderExtensionParameters {
                uri: "urn:ietf:params:rtp-hdrext:sdes:mid".to_string(),
                id: 9,
                encrypt: false,
                parameters: BTreeMap::new(),
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                ..Default::default()
            }],
            rtcp: RtcpParameters {
                cname: Some("publisher".to_string()),
                reduced_size: true,
            },
        }
    }

    fn capability_set() -> CapabilitySet {
        CapabilitySet::new(&[opus(), vp8()]).unwrap()
    }

    #[test]
    fn test_payload_types_assigned() {
        let caps = capability_set();
        let codecs = &caps.rtp_capabilities().codecs;
        assert_eq!(codecs[0].preferred_payload_type, Some(96));
        assert_eq!(codecs[1].preferred_payload_type, Some(97));
    }

    #[test]
    fn test_preferred_payload_types_are_kept() {
        let mut explicit = vp8();
        explicit.preferred_payload_type = Some(96);
        let caps = CapabilitySet::new(&[opus(), explicit]).unwrap();
        let codecs = &caps.rtp_capabilities().codecs;
        assert_eq!(codecs[0].preferred_payload_type, Some(97));
        assert_eq!(codecs[1].preferred_payload_type, Some(96));
    }

    #[test]
    fn test_invalid_codec_config() {
        assert!(CapabilitySet::new(&[]).is_err());

        let mut wrong_kind = opus();
        wrong_kind.kind = MediaKind::Video;
        assert!(CapabilitySet::new(&[wrong_kind]).is_err());

        let mut a = opus();
        a.preferred_payload_type = Some(100);
        let mut b = vp8();
        b.preferred_payload_type = Some(100);
        assert!(CapabilitySet::new(&[a, b]).is_err());
    }

    #[test]
    fn test_validate_producer() {
        let caps = capability_set();
        assert!(caps.validate_producer(MediaKind::Audio, &audio_parameters()).is_ok());

        // Kind mismatch
        assert!(caps.validate_producer(MediaKind::Video, &audio_parameters()).is_err());

        // Unsupported clock rate
        let mut params = audio_parameters();
        params.codecs[0].clock_rate = 8000;
        assert!(caps.validate_producer(MediaKind::Audio, &params).is_err());

        // No encodings
        let mut params = audio_parameters();
        params.encodings.clear();
        assert!(caps.validate_producer(MediaKind::Audio, &params).is_err());
    }

    #[test]
    fn test_rtx_is_not_a_media_codec() {
        let caps = capability_set();
        let params = RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: "video/rtx".to_string(),
                payload_type: 97,
                clock_rate: 90000,
                channels: None,
                parameters: BTreeMap::from([("apt".to_string(), json!(96))]),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
            encodings: vec![RtpEncodingParameters::default()],
            rtcp: RtcpParameters::default(),
        };
        assert!(caps.validate_producer(MediaKind::Video, &params).is_err());
    }

    #[test]
    fn test_consumer_parameters_use_remote_payload_types() {
        let caps = capability_set();
        let remote = caps.rtp_capabilities().clone();
        let producer = audio_parameters();

        assert!(caps.can_consume(&producer, &remote));
        let consumer = caps
            .consumer_parameters(MediaKind::Audio, &producer, &remote)
            .unwrap();

        assert_eq!(consumer.codecs.len(), 1);
        assert_eq!(consumer.codecs[0].payload_type, 96);
        assert_eq!(consumer.header_extensions.len(), 1);
        assert_eq!(consumer.header_extensions[0].id, 1);
        assert_eq!(consumer.encodings.len(), 1);
        assert!(consumer.encodings[0].ssrc.is_some_and(|ssrc| ssrc != 0));
        assert_eq!(consumer.rtcp.cname.as_deref(), Some("publisher"));
    }

    #[test]
    fn test_random_ssrc_is_never_zero() {
        let ssrcs: BTreeSet<u32> = (0..64).map(|_| random_ssrc()).collect();
        assert!(!ssrcs.contains(&0));
        assert!(ssrcs.len() > 1);
    }

    #[test]
    fn test_incompatible_remote() {
        let caps = capability_set();
        let remote = RtpCapabilities {
            codecs: vec![vp8()],
            header_extensions: vec![],
        };
        let producer = audio_parameters();
        assert!(!caps.can_consume(&producer, &remote));
        assert!(caps
            .consumer_parameters(MediaKind::Audio, &producer, &remote)
            .is_none());
    }

    #[test]
    fn test_h264_packetization_mode_must_match() {
        let a = BTreeMap::from([("packetization-mode".to_string(), json!(1))]);
        let b = BTreeMap::from([("packetization-mode".to_string(), json!("1"))]);
        let none = BTreeMap::new();
        fn key<'a>(mime_type: &'a str, parameters: &'a BTreeMap<String, Value>) -> CodecKey<'a> {
            CodecKey {
                mime_type,
                clock_rate: 90000,
                channels: None,
                parameters,
            }
        }
        assert!(key("video/H264", &a).matches(&key("video/h264", &b)));
        assert!(!key("video/H264", &a).matches(&key("video/H264", &none)));
    }

    #[test]
    fn test_capabilities_wire_format() {
        let caps = capability_set();
        let value = serde_json::to_value(caps.rtp_capabilities()).unwrap();
        assert_eq!(value["codecs"][0]["mimeType"], "audio/opus");
        assert_eq!(value["codecs"][0]["preferredPayloadType"], 96);
        assert_eq!(value["headerExtensions"][0]["preferredId"], 1);
    }
}
