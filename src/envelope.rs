// =============================================================================
// LAGRANGE RELAY — envelope.rs
// =============================================================================
//
// Self-describing envelope that crosses every component boundary:
//
//   { "type": "frame" | "error",
//     "metadata": { frame_id, timestamp, is_keyframe, frame_size, signature,
//                   public_key, is_synthesized, parent_frame_ids, confidence,
//                   predictor_version, edge_signature, edge_public_key,
//                   origin_verified, psnr, ssim, frame_match, ... },
//     "data": "<base64 payload>",
//     "network_metadata": { simulated_delay_ms, proxy_timestamp, config } }
//
// network_metadata is advisory telemetry added by the emulator, never signed,
// so it is carried as opaque JSON. Unknown metadata keys survive a relay hop.
// =============================================================================

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::attestation::{self, Attestation};
use crate::error::{RelayError, Result};
use crate::quality::QualityReport;
use crate::sample::{Sample, SequenceId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Frame(FrameEnvelope),
    Error { message: String },
}

impl Envelope {
    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error { message: message.into() }
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| RelayError::malformed(e.to_string()))
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    pub metadata: FrameMetadata,
    pub data: String,
    /// Whatever the emulator stamped; carried through as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameMetadata {
    #[serde(alias = "sequence_id")]
    pub frame_id: Option<SequenceId>,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub is_keyframe: bool,
    #[serde(default)]
    pub frame_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,

    #[serde(default)]
    pub is_synthesized: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_frame_ids: Vec<SequenceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictor_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_verified: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psnr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssim: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_match: Option<f64>,
    /// Scalar payloads only; heuristic, not a signal-fidelity metric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approx_deviation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approx_match: Option<f64>,

    /// Keys this node does not know about, forwarded untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FrameEnvelope {
    pub fn observed(sample: &Sample, att: &Attestation, source_type: Option<&str>) -> Self {
        FrameEnvelope {
            metadata: FrameMetadata {
                frame_id: Some(sample.sequence_id.clone()),
                timestamp: att.timestamp,
                is_keyframe: att.is_keyframe,
                frame_size: sample.payload_size,
                signature: Some(att.signature.clone()),
                public_key: Some(att.signer_public_key.clone()),
                source_type: source_type.map(str::to_string),
                ..FrameMetadata::default()
            },
            data: B64.encode(&sample.payload),
            network_metadata: None,
        }
    }

    pub fn synthesized(
        payload: &[u8],
        att: &Attestation,
        quality: Option<&QualityReport>,
        origin_verified: bool,
    ) -> Self {
        let mut metadata = FrameMetadata {
            frame_id: Some(att.sequence_id.clone()),
            timestamp: att.timestamp,
            frame_size: payload.len(),
            is_synthesized: true,
            parent_frame_ids: att.parent_sequence_ids.clone(),
            confidence: Some(att.confidence),
            predictor_version: att.predictor_version.clone(),
            edge_signature: Some(att.signature.clone()),
            edge_public_key: Some(att.signer_public_key.clone()),
            origin_verified: Some(origin_verified),
            ..FrameMetadata::default()
        };
        if let Some(report) = quality {
            report.annotate(&mut metadata);
        }
        FrameEnvelope { metadata, data: B64.encode(payload), network_metadata: None }
    }

    pub fn sequence_id(&self) -> Result<SequenceId> {
        self.metadata
            .frame_id
            .clone()
            .ok_or_else(|| RelayError::malformed("frame_id missing"))
    }

    /// Payload with the declared (not measured) size.
    pub fn sample(&self) -> Result<Sample> {
        let payload = B64
            .decode(&self.data)
            .map_err(|e| RelayError::malformed(format!("payload encoding: {}", e)))?;
        Ok(Sample {
            sequence_id: self.sequence_id()?,
            timestamp: self.metadata.timestamp,
            payload,
            payload_size: self.metadata.frame_size,
        })
    }

    pub fn attestation(&self) -> Result<Attestation> {
        let m = &self.metadata;
        let (signature, key) = if m.is_synthesized {
            (&m.edge_signature, &m.edge_public_key)
        } else {
            (&m.signature, &m.public_key)
        };
        let missing = || RelayError::VerificationFailure("signature or key missing".into());
        Ok(Attestation {
            sequence_id: self.sequence_id()?,
            timestamp: m.timestamp,
            signature: signature.clone().ok_or_else(missing)?,
            signer_public_key: key.clone().ok_or_else(missing)?,
            is_keyframe: m.is_keyframe,
            is_synthesized: m.is_synthesized,
            parent_sequence_ids: m.parent_frame_ids.clone(),
            confidence: m.confidence.unwrap_or(1.0),
            predictor_version: m.predictor_version.clone(),
        })
    }

    pub fn simulated_delay_ms(&self) -> Option<f64> {
        self.network_metadata
            .as_ref()?
            .get("simulated_delay_ms")
            .and_then(Value::as_f64)
    }
}

/// Independent check a downstream consumer can run on any single frame.
pub fn verify_frame(frame: &FrameEnvelope) -> bool {
    let checked = frame.sample().and_then(|s| frame.attestation().map(|a| (s, a)));
    match checked {
        Ok((sample, att)) => attestation::verify_sample(&sample, &att),
        Err(e) => {
            log::warn!("🔏 frame rejected before signature check: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::SigningIdentity;

    fn observed_frame(id: &SigningIdentity) -> FrameEnvelope {
        let sample = Sample::new(12, 1_700_000_123.25, b"pixels".to_vec());
        let att = id.sign_real(&sample, true);
        FrameEnvelope::observed(&sample, &att, Some("test"))
    }

    #[test]
    fn test_wire_shape() {
        let id = SigningIdentity::generate("sender");
        let text = Envelope::Frame(observed_frame(&id)).to_text().unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "frame");
        assert_eq!(v["metadata"]["frame_id"], 12);
        assert_eq!(v["metadata"]["frame_size"], 6);
        assert_eq!(v["metadata"]["is_keyframe"], true);
        assert!(v["metadata"].get("edge_signature").is_none());
        assert!(v.get("network_metadata").is_none());

        let err = Envelope::error("Could not connect to sender").to_text().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&err).unwrap(),
            serde_json::json!({"type": "error", "message": "Could not connect to sender"})
        );
    }

    #[test]
    fn test_observed_frame_verifies_after_transport() {
        let id = SigningIdentity::generate("sender");
        let text = Envelope::Frame(observed_frame(&id)).to_text().unwrap();
        match Envelope::decode(&text).unwrap() {
            Envelope::Frame(frame) => assert!(verify_frame(&frame)),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_tampered_payload_fails() {
        let id = SigningIdentity::generate("sender");
        let mut frame = observed_frame(&id);
        frame.data = B64.encode(b"pixelz!");
        assert!(!verify_frame(&frame));

        let mut unsigned = observed_frame(&id);
        unsigned.metadata.signature = None;
        assert!(!verify_frame(&unsigned));

        let mut garbled = observed_frame(&id);
        garbled.data = "***".into();
        assert!(!verify_frame(&garbled));
    }

    #[test]
    fn test_synthesized_frame_carries_edge_attestation() {
        let edge = SigningIdentity::generate("edge");
        let att = edge.sign_synthetic(
            SequenceId::synthetic(1),
            50.0,
            0.7,
            vec![SequenceId::Index(1), SequenceId::Index(2)],
            "optical_flow_v1",
        );
        let report = QualityReport::Dense { psnr: 31.2, ssim: 0.91, frame_match: 97.5 };
        let frame = FrameEnvelope::synthesized(b"abc", &att, Some(&report), true);
        assert!(verify_frame(&frame));
        assert_eq!(frame.metadata.psnr, Some(31.2));
        assert_eq!(frame.metadata.parent_frame_ids.len(), 2);
        assert!(frame.metadata.signature.is_none());
    }

    #[test]
    fn test_unknown_fields_survive_and_telemetry_is_advisory() {
        let id = SigningIdentity::generate("sender");
        let mut v = serde_json::to_value(Envelope::Frame(observed_frame(&id))).unwrap();
        v["metadata"]["camera"] = serde_json::json!({"exposure_ms": 8});
        v["network_metadata"] = serde_json::json!({"simulated_delay_ms": 3000, "proxy_timestamp": 1});

        let Envelope::Frame(frame) = Envelope::decode(&v.to_string()).unwrap() else {
            panic!("expected frame");
        };
        assert!(verify_frame(&frame));
        assert_eq!(frame.simulated_delay_ms(), Some(3000.0));
        assert_eq!(frame.metadata.extra["camera"]["exposure_ms"], 8);

        let again: serde_json::Value = serde_json::from_str(&Envelope::Frame(frame).to_text().unwrap()).unwrap();
        assert_eq!(again["metadata"]["camera"], v["metadata"]["camera"]);
        assert_eq!(again["network_metadata"], v["network_metadata"]);

        v["network_metadata"] = serde_json::json!("stale");
        let Envelope::Frame(odd) = Envelope::decode(&v.to_string()).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(odd.simulated_delay_ms(), None);
    }

    #[test]
    fn test_accepts_sequence_id_alias_and_rejects_unknown_type() {
        let text = r#"{"type":"frame","metadata":{"sequence_id":3,"timestamp":1.0},"data":""}"#;
        match Envelope::decode(text).unwrap() {
            Envelope::Frame(f) => assert_eq!(f.sequence_id().unwrap(), SequenceId::Index(3)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            Envelope::decode(r#"{"type":"heartbeat"}"#),
            Err(RelayError::MalformedEnvelope(_))
        ));
        assert!(Envelope::decode("not json").is_err());
    }
}
