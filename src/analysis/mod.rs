//! External document-analysis service boundary.
//!
//! Defines the [`DocumentAnalyzer`] trait and the result types shared by the
//! extraction and signature passes, so the HTTP backend can be swapped out
//! (tests use an in-process stub).

pub mod azure;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::routing::ModelRoute;

/// Result of one completed analysis operation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzeResult {
    #[serde(default)]
    pub documents: Vec<AnalyzedDocument>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedDocument {
    /// Fields in the order the service returned them.
    #[serde(default, deserialize_with = "ordered_fields")]
    pub fields: Vec<(String, DocumentField)>,
}

/// One extracted field. The service fills at most one typed `value*` slot.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentField {
    pub value_string: Option<String>,
    pub value_date: Option<String>,
    pub value_time: Option<String>,
    pub value_phone_number: Option<String>,
    pub value_number: Option<f64>,
    pub value_integer: Option<i64>,
    pub value_selection_mark: Option<String>,
    pub value_signature: Option<String>,
    pub value_country_region: Option<String>,
    pub value_boolean: Option<bool>,
    pub content: Option<String>,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub bounding_regions: Vec<BoundingRegion>,
}

impl DocumentField {
    /// The structured value when it is present and non-empty, otherwise the raw text.
    pub fn resolved_value(&self) -> Value {
        self.structured_value()
            .or_else(|| self.content.clone().map(Value::String))
            .unwrap_or(Value::Null)
    }

    fn structured_value(&self) -> Option<Value> {
        let text = [
            &self.value_string,
            &self.value_date,
            &self.value_time,
            &self.value_phone_number,
            &self.value_selection_mark,
            &self.value_signature,
            &self.value_country_region,
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty())
        .map(|s| Value::String(s.clone()));

        text.or_else(|| {
            self.value_number
                .filter(|n| *n != 0.0)
                .and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))
        })
        .or_else(|| {
            self.value_integer
                .filter(|n| *n != 0)
                .map(|n| Value::Number(n.into()))
        })
        .or_else(|| self.value_boolean.filter(|b| *b).map(Value::Bool))
    }
}

/// A polygon on one page, as a flat `[x1, y1, x2, y2, ...]` list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingRegion {
    pub page_number: u32,
    #[serde(default)]
    pub polygon: Vec<f64>,
}

impl BoundingRegion {
    /// Polygon vertices as `(x, y)` pairs. A trailing odd value is ignored.
    pub fn points(&self) -> Vec<(f64, f64)> {
        self.polygon
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
            .collect()
    }
}

fn ordered_fields<'de, D>(deserializer: D) -> Result<Vec<(String, DocumentField)>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Map::<String, Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(name, value)| {
            serde_json::from_value(value)
                .map(|field| (name, field))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

/// Async trait implemented by each analysis backend.
#[async_trait::async_trait]
pub trait DocumentAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    /// Submit a document to `route.model_id` and wait for the completed result.
    async fn analyze(
        &self,
        route: &ModelRoute,
        filename: &str,
        data: &[u8],
    ) -> anyhow::Result<AnalyzeResult>;
}
