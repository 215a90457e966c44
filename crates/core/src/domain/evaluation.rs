use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scoring dimensions understood by the rubric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Effectiveness,
    Experience,
    Safety,
}

impl Dimension {
    pub const ALL: [Dimension; 3] =
        [Dimension::Effectiveness, Dimension::Experience, Dimension::Safety];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Effectiveness => "effectiveness",
            Self::Experience => "experience",
            Self::Safety => "safety",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "effectiveness" => Some(Self::Effectiveness),
            "experience" => Some(Self::Experience),
            "safety" => Some(Self::Safety),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    /// 0..=10
    pub score: f64,
    pub reasoning: String,
    /// 0..=1
    pub confidence: f64,
}

/// How a result was obtained from the judge response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOutcome {
    /// Response parsed and validated as structured JSON.
    Structured,
    /// Scores salvaged from an otherwise malformed response.
    Salvaged,
    /// Judge call or parsing failed; scores are placeholders.
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub dimensions: BTreeMap<Dimension, DimensionScore>,
    /// Always derived from `dimensions` and the rubric weights.
    pub overall_score: f64,
    pub overall_confidence: f64,
    pub summary: String,
    pub flagged: bool,
    pub flag_reason: Option<String>,
    pub outcome: EvaluationOutcome,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn score(&self, dimension: Dimension) -> Option<f64> {
        self.dimensions.get(&dimension).map(|value| value.score)
    }

    pub fn needs_review(&self) -> bool {
        self.flagged || self.outcome == EvaluationOutcome::Failed
    }
}
