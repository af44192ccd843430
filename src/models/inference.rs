use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Auxiliary response keys passed through to the result untouched.
const AUXILIARY_KEYS: &[&str] = &["features", "similar_cases"];

/// A single best-label diagnosis produced by aggregation downstream of the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FusedDiagnosis {
    pub label: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

/// Structurally validated response from the inference service.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    pub findings: BTreeMap<String, f64>,
    pub fused: Option<FusedDiagnosis>,
    pub model_version: Option<String>,
    pub inference_id: Option<String>,
    pub inference_ms: Option<f64>,
    pub warnings: Vec<String>,
    pub auxiliary: Value,
    pub raw: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrimarySource {
    Fused,
    Model,
}

/// The prediction surfaced to the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrimaryFinding {
    pub label: String,
    pub confidence: f64,
    pub source: PrimarySource,
}

/// Result payload of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub findings: BTreeMap<String, f64>,
    pub primary: Option<PrimaryFinding>,
    pub model_version: String,
    pub inference_id: Option<String>,
    pub inference_ms: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub auxiliary: Value,
    pub raw_response: Value,
}

/// Non-numeric scores become 0; numeric ones are clamped into [0, 1].
pub fn coerce_score(value: &Value) -> f64 {
    match value.as_f64() {
        Some(score) if score.is_finite() => score.clamp(0.0, 1.0),
        _ => 0.0,
    }
}

impl InferenceOutput {
    /// Validate and normalize a raw response body.
    ///
    /// The only hard requirement is a `predictions` (or `findings`) object.
    pub fn from_raw(raw: Value) -> Result<Self, String> {
        let body = raw
            .as_object()
            .ok_or_else(|| "response body is not a JSON object".to_string())?;

        let findings_map = body
            .get("predictions")
            .or_else(|| body.get("findings"))
            .and_then(Value::as_object)
            .ok_or_else(|| "response has no findings map".to_string())?;

        let findings: BTreeMap<String, f64> = findings_map
            .iter()
            .map(|(label, score)| (label.clone(), coerce_score(score)))
            .collect();

        let mut warnings: Vec<String> = body
            .get("warnings")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|w| w.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let coerced = findings_map.values().filter(|v| !v.is_number()).count();
        if coerced > 0 {
            warnings.push(format!("{coerced} non-numeric finding score(s) coerced to 0"));
        }

        let fused = match body.get("fusion") {
            None | Some(Value::Null) => None,
            Some(value) => {
                let parsed = parse_fused(value);
                if parsed.is_none() {
                    warnings.push("Ignored malformed fused diagnosis".to_string());
                }
                parsed
            }
        };

        let auxiliary: Map<String, Value> = AUXILIARY_KEYS
            .iter()
            .filter_map(|key| body.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect();

        Ok(Self {
            findings,
            fused,
            model_version: body
                .get("model_version")
                .and_then(Value::as_str)
                .map(str::to_string),
            inference_id: body
                .get("inference_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            inference_ms: body.get("inference_time_ms").and_then(Value::as_f64),
            warnings,
            auxiliary: Value::Object(auxiliary),
            raw,
        })
    }
}

fn parse_fused(value: &Value) -> Option<FusedDiagnosis> {
    let label = value.get("final_diagnosis")?.as_str()?.trim();
    if label.is_empty() {
        return None;
    }
    let confidence = value.get("confidence_score")?.as_f64()?;
    if !confidence.is_finite() {
        return None;
    }

    Some(FusedDiagnosis {
        label: label.to_string(),
        confidence: confidence.clamp(0.0, 1.0),
        summary: value
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string),
        flags: value
            .get("flags")
            .and_then(Value::as_array)
            .map(|f| f.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
    })
}
