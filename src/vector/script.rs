//! `vector_script` score scripts.
//!
//! Params are a JSON object `{"field": ..., "query_vector": [...],
//! "metric": "COSINE" | "L2"}`. The metric defaults to cosine. Scripts are
//! only offered in the score context.

use serde::Deserialize;
use serde_json::Value;

use crate::error::SegmentResult;
use crate::vector::scoring::{Metric, VectorScorer};
use crate::vector::segment::SegmentVectorReader;
use crate::vector::types::VectorError;

/// Script language name.
pub const SCRIPT_TYPE: &str = "vector_script";

/// The only context scripts can be compiled for.
pub const SCORE_CONTEXT: &str = "score";

#[derive(Debug, Deserialize)]
struct RawParams {
    field: Option<String>,
    query_vector: Option<Vec<f32>>,
    metric: Option<String>,
}

/// A compiled vector score script.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorScript {
    field: String,
    metric: Metric,
    query_vector: Vec<f32>,
}

fn missing(name: &str) -> VectorError {
    VectorError::InvalidParameter {
        name: name.to_string(),
        reason: format!("Missing parameter [{name}]"),
    }
}

impl VectorScript {
    /// Compiles a script for `context`.
    pub fn compile(context: &str, params: &Value) -> SegmentResult<Self> {
        if context != SCORE_CONTEXT {
            return Err(VectorError::InvalidParameter {
                name: "context".to_string(),
                reason: format!("{SCRIPT_TYPE} scripts cannot be used for context [{context}]"),
            }
            .into());
        }
        Self::from_params(params)
    }

    /// Parses params given as a JSON string.
    pub fn parse(params: &str) -> SegmentResult<Self> {
        let value: Value = serde_json::from_str(params).map_err(|e| VectorError::InvalidParameter {
            name: "params".to_string(),
            reason: e.to_string(),
        })?;
        Self::from_params(&value)
    }

    pub fn from_params(params: &Value) -> SegmentResult<Self> {
        let raw = RawParams::deserialize(params).map_err(|e| VectorError::InvalidParameter {
            name: "params".to_string(),
            reason: e.to_string(),
        })?;
        let field = raw.field.ok_or_else(|| missing("field"))?;
        let query_vector = raw.query_vector.ok_or_else(|| missing("query_vector"))?;
        let metric = match raw.metric {
            Some(metric) => metric.parse()?,
            None => Metric::Cosine,
        };
        Ok(Self {
            field,
            metric,
            query_vector,
        })
    }

    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    #[must_use]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    #[must_use]
    pub fn query_vector(&self) -> &[f32] {
        &self.query_vector
    }

    /// Per-segment scorer. Scores do not depend on a query score.
    pub fn scorer(&self, segment: &SegmentVectorReader) -> SegmentResult<VectorScorer> {
        segment.similarity_scorer(&self.field, self.metric, &self.query_vector, false)
    }
}
