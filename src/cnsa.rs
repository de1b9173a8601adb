//! NSA Commercial National Security Algorithm (CNSA) 2.0 Suite preset.
//!
//! This module does not gate what the crate supports — `backend::russh_transport`
//! resolves whatever [`crate::config::AlgorithmPreferences`] a caller supplies,
//! RSA included, and the transport's own default (an empty preference list)
//! already negotiates RSA host keys where the server offers them. What this
//! module provides is an opt-in, EC-only preset for callers that must restrict
//! themselves to the CNSA 2.0 suite — it is one possible value for
//! `ClientConfig::algorithms`, not the crate's default.
//!
//! ## CNSA 2.0 Requirements by Classification Level
//!
//! ### For **SECRET** and below (effective immediately):
//! - **Encryption**: AES-256 (GCM mode preferred)
//! - **Key Exchange**: ECDH with P-384
//! - **Digital Signatures**: ECDSA with P-384
//! - **Hashing**: SHA-384, SHA-512
//!
//! ### For **TOP SECRET** and above (transition timeline):
//! - **Encryption**: AES-256 (current), quantum-resistant algorithms (post-2030)
//! - **Key Exchange**: ECDH P-384 (current), quantum-resistant KEM (post-2030)
//! - **Digital Signatures**: ECDSA P-384 (current), quantum-resistant signatures (post-2030)
//!
//! ### For **non-classified** use:
//! - **Key Exchange**: X25519 (Curve25519)
//! - **Digital Signatures**: Ed25519
//!
//! RSA is deliberately absent from this preset: it is not CNSA 2.0 compliant
//! at any classification level. A caller that needs RSA support simply does
//! not opt into this preset.
//!
//! ## References
//! - CNSS Advisory Memorandum: Commercial National Security Algorithm Suite 2.0
//! - RFC 5656: Elliptic Curve Algorithm Integration in SSH
//! - RFC 8709: Ed25519 and Ed448 Public Key Algorithms for SSH

use crate::config::AlgorithmPreferences;

/// Classification level, used only to pick the right explanatory text —
/// the algorithm suite itself does not vary by level under the current
/// (pre-2030) transition timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationLevel {
    /// Unclassified information.
    Unclassified,
    /// Classified SECRET and below (P-384/AES-256).
    Secret,
    /// Classified TOP SECRET (P-384/AES-256, transitioning to PQC by 2030).
    TopSecret,
}

impl ClassificationLevel {
    /// Human-readable summary of what this level requires.
    #[must_use]
    pub fn required_algorithms(&self) -> &'static str {
        match self {
            ClassificationLevel::Unclassified => "ECDH-P384 or X25519, AES-256, ECDSA-P384 or Ed25519",
            ClassificationLevel::Secret => "ECDH-P384, AES-256, ECDSA-P384, SHA-384/512 (CNSA 2.0 baseline)",
            ClassificationLevel::TopSecret => {
                "ECDH-P384, AES-256, ECDSA-P384, SHA-384/512 (current baseline); \
                 transition to ML-KEM/ML-DSA required by 2030"
            }
        }
    }

    /// Whether this level requires post-quantum algorithms under the current
    /// transition timeline (they are not yet negotiable over SSH either way).
    #[must_use]
    pub fn requires_pqc(&self) -> bool {
        matches!(self, ClassificationLevel::TopSecret)
    }
}

/// Build the CNSA 2.0 preset: EC-only key exchange and host-key algorithms,
/// AES-256 ciphers, SHA-2 MACs, most-preferred first. Pass the result as
/// `ClientConfig::algorithms` to restrict a connection to this suite.
#[must_use]
pub fn preferences() -> AlgorithmPreferences {
    AlgorithmPreferences {
        kex: vec!["ecdh-sha2-nistp384".to_string(), "curve25519-sha256".to_string()],
        host_key: vec!["ecdsa-sha2-nistp384".to_string(), "ssh-ed25519".to_string()],
        cipher: vec!["aes256-gcm@openssh.com".to_string(), "aes256-ctr".to_string()],
        mac: vec!["hmac-sha2-512".to_string(), "hmac-sha2-256".to_string()],
        compress: Vec::new(),
    }
}

/// Human-readable description of the CNSA 2.0 preset, suitable for a log
/// line or a CLI `--help` expansion.
#[must_use]
pub fn compliance_info() -> &'static str {
    "CNSA 2.0 preset: ECDH-P384/X25519 key exchange, AES-256-GCM/CTR ciphers, \
     HMAC-SHA-512/256, ECDSA-P384/Ed25519 host keys. RSA and legacy ciphers \
     (DES, 3DES, RC4) are excluded by omission, not by crate feature."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_excludes_rsa() {
        let prefs = preferences();
        assert!(!prefs.host_key.iter().any(|name| name.contains("rsa")));
    }

    #[test]
    fn preset_prefers_p384_over_curve25519() {
        let prefs = preferences();
        assert_eq!(prefs.kex[0], "ecdh-sha2-nistp384");
        assert_eq!(prefs.host_key[0], "ecdsa-sha2-nistp384");
    }

    #[test]
    fn preset_prefers_gcm_and_stronger_mac() {
        let prefs = preferences();
        assert_eq!(prefs.cipher[0], "aes256-gcm@openssh.com");
        assert_eq!(prefs.mac[0], "hmac-sha2-512");
    }

    #[test]
    fn classification_levels_report_pqc_requirement() {
        assert!(!ClassificationLevel::Unclassified.requires_pqc());
        assert!(!ClassificationLevel::Secret.requires_pqc());
        assert!(ClassificationLevel::TopSecret.requires_pqc());
    }
}
