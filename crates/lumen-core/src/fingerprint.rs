//! Generation-parameter fingerprints and content hashes.
//!
//! Two named policies exist because grouping use cases disagree on whether
//! resolution is part of an image's identity:
//!
//! | Policy | Fields | Used by |
//! |--------|--------|---------|
//! | [`StrictFingerprint`] | all nine generation parameters | representative election, embedding propagation |
//! | [`ResolutionAgnosticFingerprint`] | all but width/height | draft/upscale parameter grouping |
//!
//! Each field is length-prefixed before hashing so a separator appearing
//! inside a prompt cannot make two different parameter sets collide.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{GenerationParams, GroupMember};

/// A named, stable hash over generation parameters.
pub trait FingerprintPolicy: Send + Sync {
    /// Short policy name, recorded in logs.
    fn name(&self) -> &'static str;

    /// Ordered field values fed into the digest.
    fn fields(&self, params: &GenerationParams) -> Vec<String>;

    /// Hex-encoded SHA-256 over the encoded fields.
    fn fingerprint(&self, params: &GenerationParams) -> String {
        let mut hasher = Sha256::new();
        for field in self.fields(params) {
            hasher.update(field.len().to_string().as_bytes());
            hasher.update(b":");
            hasher.update(field.as_bytes());
            hasher.update(b"\x1f");
        }
        hex::encode(hasher.finalize())
    }
}

/// Fingerprint over every generation parameter, including resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictFingerprint;

/// Fingerprint that ignores width and height, so a draft and its upscale collide.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolutionAgnosticFingerprint;

fn text(value: &Option<String>) -> String {
    value.as_deref().map(str::trim).unwrap_or_default().to_string()
}

fn number<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn common_fields(params: &GenerationParams) -> Vec<String> {
    vec![
        text(&params.prompt),
        text(&params.negative_prompt),
        text(&params.model),
        number(params.seed),
        number(params.steps),
        text(&params.sampler),
        // Fixed precision keeps 7 and 7.0 identical.
        params
            .cfg_scale
            .map(|c| format!("{c:.3}"))
            .unwrap_or_default(),
    ]
}

impl FingerprintPolicy for StrictFingerprint {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn fields(&self, params: &GenerationParams) -> Vec<String> {
        let mut fields = common_fields(params);
        fields.push(number(params.width));
        fields.push(number(params.height));
        fields
    }
}

impl FingerprintPolicy for ResolutionAgnosticFingerprint {
    fn name(&self) -> &'static str {
        "resolution_agnostic"
    }

    fn fields(&self, params: &GenerationParams) -> Vec<String> {
        common_fields(params)
    }
}

/// Pick the representative of a fingerprint group: largest file, then lowest id.
pub fn elect_representative(members: &[GroupMember]) -> Option<Uuid> {
    members
        .iter()
        .max_by(|x, y| {
            x.file_size
                .cmp(&y.file_size)
                .then_with(|| y.id.cmp(&x.id))
        })
        .map(|m| m.id)
}

/// BLAKE3 hex digest of a content payload (text bytes or decoded pixels).
pub fn compute_content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
