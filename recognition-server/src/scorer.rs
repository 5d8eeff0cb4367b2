// 识别打分（模拟版本）
//
// The real matcher is out of scope; frames are scored by hashing their bytes
// so the same image always gets the same verdict.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use common::SubjectRecord;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error("Invalid image data: {0}")]
    InvalidData(String),

    #[error("Processing failed: {0}")]
    Processing(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub confidence: f64,
    /// Best candidate, whether or not it cleared the threshold
    pub subject: SubjectRecord,
}

pub trait Scorer: Send + Sync {
    fn score(&self, image: &[u8], provider: &str) -> Result<Verdict, ScoreError>;
}

/// Splits a `data:<mime>;base64,<payload>` URL and decodes the payload.
pub fn decode_data_url(url: &str) -> Result<(String, Vec<u8>), ScoreError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| ScoreError::InvalidData("not a data url".to_string()))?;
    let (mime, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| ScoreError::InvalidData("data url is not base64".to_string()))?;

    if !mime.starts_with("image/") {
        return Err(ScoreError::InvalidData(format!("unexpected media type {}", mime)));
    }

    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| ScoreError::InvalidData(e.to_string()))?;
    if bytes.is_empty() {
        return Err(ScoreError::InvalidData("empty image".to_string()));
    }

    Ok((mime.to_string(), bytes))
}

pub struct SimulatedScorer {
    roster: Vec<SubjectRecord>,
}

impl SimulatedScorer {
    pub fn new() -> Self {
        let roster = [
            (1, "Ana Torres", "Torre A - 101", "Propietario"),
            (2, "Luis Gómez", "Torre A - 204", "Arrendatario"),
            (3, "María Pérez", "Torre B - 302", "Propietario"),
            (4, "Jorge Ramírez", "Torre C - 110", "Copropietario"),
        ]
        .into_iter()
        .map(|(id, name, residence, resident_type)| SubjectRecord {
            id,
            name: name.to_string(),
            residence: Some(residence.to_string()),
            resident_type: Some(resident_type.to_string()),
            document: None,
        })
        .collect();

        Self { roster }
    }
}

impl Default for SimulatedScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl Scorer for SimulatedScorer {
    fn score(&self, image: &[u8], provider: &str) -> Result<Verdict, ScoreError> {
        if self.roster.is_empty() {
            return Err(ScoreError::Processing("no enrolled subjects".to_string()));
        }

        let mut hasher = DefaultHasher::new();
        provider.hash(&mut hasher);
        image.hash(&mut hasher);
        let digest = hasher.finish();

        let confidence = (digest % 10_000) as f64 / 10_000.0;
        let subject = self.roster[(digest >> 32) as usize % self.roster.len()].clone();

        Ok(Verdict {
            confidence,
            subject,
        })
    }
}
