// =============================================================================
// LAGRANGE RELAY — attestation.rs
// «Attestation Authority»
// =============================================================================
//
// Каждый сэмпл, наблюдаемый или синтезированный, подписан Ed25519.
//
//   SigningIdentity — keypair of one node, loaded or generated once
//   Attestation     — signature + signer key + kind + lineage
//   verify()        — fail closed, never raise
//
// Canonical messages:
//   real        "{seq}:{ts:.6}:{payload_size}"
//   synthesized "synth:{seq}:{ts:.6}:{confidence:.4}:[{p1},{p2}]"
// =============================================================================

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RelayError, Result};
use crate::sample::{Sample, SequenceId};

pub const KEY_LEN: usize = 32;

// -----------------------------------------------------------------------------
// Attestation
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub sequence_id: SequenceId,
    pub timestamp: f64,
    /// base64 Ed25519 signature
    pub signature: String,
    /// base64 verifying key of the signer
    pub signer_public_key: String,
    pub is_keyframe: bool,
    pub is_synthesized: bool,
    pub parent_sequence_ids: Vec<SequenceId>,
    pub confidence: f64,
    pub predictor_version: Option<String>,
}

impl Attestation {
    /// Exactly one of real / synthesized, and synthesized always has lineage.
    pub fn kind_consistent(&self) -> bool {
        if self.is_synthesized {
            !self.parent_sequence_ids.is_empty() && self.parent_sequence_ids.len() <= 2
        } else {
            self.parent_sequence_ids.is_empty()
        }
    }

    pub fn canonical_message(&self, declared_payload_size: usize) -> String {
        if self.is_synthesized {
            synthetic_message(
                &self.sequence_id,
                self.timestamp,
                self.confidence,
                &self.parent_sequence_ids,
            )
        } else {
            real_message(&self.sequence_id, self.timestamp, declared_payload_size)
        }
    }
}

const TIMESTAMP_PLACES: i32 = 6;
const CONFIDENCE_PLACES: i32 = 4;

/// Snaps a value to the precision the canonical message carries.
fn quantize(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

fn real_message(seq: &SequenceId, timestamp: f64, size: usize) -> String {
    format!("{}:{:.6}:{}", seq, timestamp, size)
}

fn synthetic_message(seq: &SequenceId, timestamp: f64, confidence: f64, parents: &[SequenceId]) -> String {
    let parents: Vec<String> = parents.iter().map(|p| p.to_string()).collect();
    format!("synth:{}:{:.6}:{:.4}:[{}]", seq, timestamp, confidence, parents.join(","))
}

// -----------------------------------------------------------------------------
// SigningIdentity
// -----------------------------------------------------------------------------

pub struct SigningIdentity {
    role: String,
    signing_key: SigningKey,
}

impl SigningIdentity {
    pub fn generate(role: &str) -> Self {
        SigningIdentity {
            role: role.to_string(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn key_paths(dir: &Path, role: &str) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("{}_private_key.bin", role)),
            dir.join(format!("{}_public_key.bin", role)),
        )
    }

    /// Load `<role>_private_key.bin` from `dir`, or generate and persist both halves.
    pub fn load_or_create(dir: &Path, role: &str) -> Result<Self> {
        let (private_path, public_path) = Self::key_paths(dir, role);
        match std::fs::read(&private_path) {
            Ok(bytes) => {
                let secret: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
                    RelayError::Identity(format!(
                        "{} holds {} bytes, expected {}",
                        private_path.display(),
                        bytes.len(),
                        KEY_LEN
                    ))
                })?;
                log::info!("🔑 [{}] identity loaded from {}", role, private_path.display());
                Ok(SigningIdentity {
                    role: role.to_string(),
                    signing_key: SigningKey::from_bytes(&secret),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate(role);
                std::fs::create_dir_all(dir)?;
                std::fs::write(&private_path, identity.signing_key.to_bytes())?;
                std::fs::write(&public_path, identity.signing_key.verifying_key().to_bytes())?;
                log::info!("🔑 [{}] new identity persisted to {}", role, private_path.display());
                Ok(identity)
            }
            Err(e) => Err(RelayError::Identity(format!(
                "cannot read {}: {}",
                private_path.display(),
                e
            ))),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn public_key_b64(&self) -> String {
        B64.encode(self.signing_key.verifying_key().to_bytes())
    }

    fn sign_message(&self, message: &str) -> String {
        B64.encode(self.signing_key.sign(message.as_bytes()).to_bytes())
    }

    /// Attest an observed sample; the signature binds id, origin time and size.
    /// The carried timestamp is the signed one, at microsecond precision.
    pub fn sign_real(&self, sample: &Sample, is_keyframe: bool) -> Attestation {
        let timestamp = quantize(sample.timestamp, TIMESTAMP_PLACES);
        let message = real_message(&sample.sequence_id, timestamp, sample.payload_size);
        Attestation {
            sequence_id: sample.sequence_id.clone(),
            timestamp,
            signature: self.sign_message(&message),
            signer_public_key: self.public_key_b64(),
            is_keyframe,
            is_synthesized: false,
            parent_sequence_ids: Vec::new(),
            confidence: 1.0,
            predictor_version: None,
        }
    }

    pub fn sign_synthetic(
        &self,
        sequence_id: SequenceId,
        timestamp: f64,
        confidence: f64,
        parents: Vec<SequenceId>,
        predictor_version: &str,
    ) -> Attestation {
        let timestamp = quantize(timestamp, TIMESTAMP_PLACES);
        let confidence = quantize(confidence.clamp(0.0, 1.0), CONFIDENCE_PLACES);
        let message = synthetic_message(&sequence_id, timestamp, confidence, &parents);
        Attestation {
            sequence_id,
            timestamp,
            signature: self.sign_message(&message),
            signer_public_key: self.public_key_b64(),
            is_keyframe: false,
            is_synthesized: true,
            parent_sequence_ids: parents,
            confidence,
            predictor_version: Some(predictor_version.to_string()),
        }
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("role", &self.role)
            .field("public_key", &self.public_key_b64())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Verification
// -----------------------------------------------------------------------------

fn check(attestation: &Attestation, declared_payload_size: usize) -> Result<()> {
    if !attestation.kind_consistent() {
        return Err(RelayError::VerificationFailure("inconsistent kind/lineage".into()));
    }
    let unsigned_digits = attestation.timestamp != quantize(attestation.timestamp, TIMESTAMP_PLACES)
        || (attestation.is_synthesized
            && attestation.confidence != quantize(attestation.confidence, CONFIDENCE_PLACES));
    if unsigned_digits {
        return Err(RelayError::VerificationFailure("carries more precision than was signed".into()));
    }
    let key_bytes = B64
        .decode(&attestation.signer_public_key)
        .map_err(|e| RelayError::VerificationFailure(format!("public key encoding: {}", e)))?;
    let key_bytes: [u8; KEY_LEN] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| RelayError::VerificationFailure("public key length".into()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| RelayError::VerificationFailure(format!("public key: {}", e)))?;
    let sig_bytes = B64
        .decode(&attestation.signature)
        .map_err(|e| RelayError::VerificationFailure(format!("signature encoding: {}", e)))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| RelayError::VerificationFailure(format!("signature: {}", e)))?;
    let message = attestation.canonical_message(declared_payload_size);
    key.verify(message.as_bytes(), &signature)
        .map_err(|e| RelayError::VerificationFailure(e.to_string()))
}

/// Never fails loudly: any problem is logged and reported as `false`.
pub fn verify(attestation: &Attestation, declared_payload_size: usize) -> bool {
    match check(attestation, declared_payload_size) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("🔏 attestation for [{}] rejected: {}", attestation.sequence_id, e);
            false
        }
    }
}

/// Declared size must match the payload actually carried.
pub fn verify_sample(sample: &Sample, attestation: &Attestation) -> bool {
    if !sample.size_consistent() {
        log::warn!(
            "🔏 sample [{}] declares {} bytes but carries {}",
            sample.sequence_id,
            sample.payload_size,
            sample.payload.len()
        );
        return false;
    }
    if attestation.sequence_id != sample.sequence_id {
        log::warn!("🔏 attestation id does not match sample [{}]", sample.sequence_id);
        return false;
    }
    verify(attestation, sample.payload_size)
}
