use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Width of every stored embedding (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

pub const MIN_IMPACT_SCORE: u8 = 1;
pub const MAX_IMPACT_SCORE: u8 = 10;

/// LLM-assigned significance rating, always within 1..=10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ImpactScore(u8);

impl ImpactScore {
    pub fn new(value: i64) -> Result<Self> {
        if (MIN_IMPACT_SCORE as i64..=MAX_IMPACT_SCORE as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(AppError::InvalidInput(format!(
                "impact score {} outside {}..={}",
                value, MIN_IMPACT_SCORE, MAX_IMPACT_SCORE
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ImpactScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, MAX_IMPACT_SCORE)
    }
}

/// Fixed-width semantic vector for a paper or a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.len() != EMBEDDING_DIM {
            return Err(AppError::EmbeddingDimension {
                expected: EMBEDDING_DIM,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(AppError::InvalidInput(
                "embedding contains non-finite values".to_string(),
            ));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Little-endian f32 encoding used for the BLOB column.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(AppError::InvalidInput(format!(
                "embedding blob of {} bytes is not a multiple of 4",
                bytes.len()
            )));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(values)
    }

    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

/// Closed tag vocabulary the LLM is asked to choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tag {
    #[serde(rename = "CV")]
    Cv,
    #[serde(rename = "NLP")]
    Nlp,
    #[serde(rename = "LLM")]
    Llm,
    Transformers,
    Diffusion,
    #[serde(rename = "RL")]
    Rl,
    Robotics,
    #[serde(rename = "ML")]
    Ml,
    Theory,
    Systems,
    Security,
    Other,
}

impl Tag {
    pub const ALL: [Tag; 12] = [
        Tag::Cv,
        Tag::Nlp,
        Tag::Llm,
        Tag::Transformers,
        Tag::Diffusion,
        Tag::Rl,
        Tag::Robotics,
        Tag::Ml,
        Tag::Theory,
        Tag::Systems,
        Tag::Security,
        Tag::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Cv => "CV",
            Tag::Nlp => "NLP",
            Tag::Llm => "LLM",
            Tag::Transformers => "Transformers",
            Tag::Diffusion => "Diffusion",
            Tag::Rl => "RL",
            Tag::Robotics => "Robotics",
            Tag::Ml => "ML",
            Tag::Theory => "Theory",
            Tag::Systems => "Systems",
            Tag::Security => "Security",
            Tag::Other => "Other",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tag {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Tag::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| AppError::InvalidInput(format!("unknown tag: {}", wanted)))
    }
}

/// A paper as returned by the arXiv API, before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPaper {
    pub arxiv_id: String,
    pub title: String,
    pub abstract_text: String,
    pub authors: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub url: String,
    pub categories: Vec<String>,
}

impl RawPaper {
    /// Text sent to the embedding endpoint.
    pub fn embedding_text(&self) -> String {
        format!("{}. {}", self.title, self.abstract_text)
    }
}

/// Structured output of the scoring call.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub score: ImpactScore,
    pub summary: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone)]
pub struct EnrichedPaper {
    pub raw: RawPaper,
    pub enrichment: Enrichment,
    pub embedding: Embedding,
}

#[derive(Debug, Clone)]
pub struct Paper {
    pub id: i64,
    pub arxiv_id: String,
    pub title: String,
    pub abstract_text: String,
    pub authors: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub url: String,
    pub impact_score: ImpactScore,
    pub summary: String,
    pub tags: Vec<Tag>,
    pub embedding: Embedding,
    pub posted: bool,
    pub last_posted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Semantic,
    FullText,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub paper: Paper,
    /// Cosine similarity for semantic hits, negated bm25 for full-text hits.
    pub score: f32,
    pub kind: MatchKind,
}

/// One row of the append-only post log.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct PostRecord {
    pub arxiv_id: String,
    pub channel_id: u64,
    pub message_id: String,
    pub posted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub total: u64,
    pub posted: u64,
    pub unposted: u64,
    pub pending_above_threshold: u64,
    pub average_score: Option<f64>,
    pub newest_published: Option<DateTime<Utc>>,
    pub top_tags: Vec<(Tag, u64)>,
}
