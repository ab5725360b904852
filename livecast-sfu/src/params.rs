//! ICE and DTLS parameters exchanged with the remote endpoint

use crate::error::SfuError;
use serde::{Deserialize, Serialize};

/// Hash algorithms accepted in DTLS fingerprints
const FINGERPRINT_ALGORITHMS: &[&str] = &["sha-1", "sha-224", "sha-256", "sha-384", "sha-512"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: IceProtocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

impl DtlsParameters {
    /// Check the remote parameters before they reach the engine.
    pub fn validate(&self) -> Result<(), SfuError> {
        if self.fingerprints.is_empty() {
            return Err(SfuError::InvalidDtlsParameters(
                "at least one fingerprint is required".to_string(),
            ));
        }

        for fingerprint in &self.fingerprints {
            let algorithm = fingerprint.algorithm.to_ascii_lowercase();
            if !FINGERPRINT_ALGORITHMS.contains(&algorithm.as_str()) {
                return Err(SfuError::InvalidDtlsParameters(format!(
                    "unsupported fingerprint algorithm: {}",
                    fingerprint.algorithm
                )));
            }

            if !is_colon_hex(&fingerprint.value) {
                return Err(SfuError::InvalidDtlsParameters(format!(
                    "malformed {algorithm} fingerprint"
                )));
            }
        }

        Ok(())
    }
}

/// `AB:CD:...` with two hex digits per group
fn is_colon_hex(value: &str) -> bool {
    !value.is_empty()
        && value
            .split(':')
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Format raw digest bytes as an uppercase colon-separated fingerprint
#[must_use]
pub fn format_fingerprint(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}
