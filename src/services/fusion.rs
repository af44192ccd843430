use std::time::Duration;

use crate::models::inference::{
    AnalysisResult, InferenceOutput, PrimaryFinding, PrimarySource,
};

const UNKNOWN_MODEL_VERSION: &str = "unknown";

/// Build the persisted result from a validated inference response.
///
/// A fused diagnosis, when present, becomes the primary prediction; the
/// model's full label map is always retained. Otherwise the highest-scoring
/// finding is primary. Ties resolve to the alphabetically first label.
pub fn fuse(output: InferenceOutput, measured: Duration) -> AnalysisResult {
    let primary = match &output.fused {
        Some(fused) => Some(PrimaryFinding {
            label: fused.label.clone(),
            confidence: fused.confidence,
            source: PrimarySource::Fused,
        }),
        None => top_finding(&output),
    };

    let mut warnings = output.warnings;
    if let Some(fused) = &output.fused {
        warnings.extend(fused.flags.iter().cloned());
    }

    let mut auxiliary = output.auxiliary;
    if let (Some(fused), Some(aux)) = (&output.fused, auxiliary.as_object_mut()) {
        if let Ok(value) = serde_json::to_value(fused) {
            aux.insert("fusion".to_string(), value);
        }
    }

    AnalysisResult {
        findings: output.findings,
        primary,
        model_version: output
            .model_version
            .unwrap_or_else(|| UNKNOWN_MODEL_VERSION.to_string()),
        inference_id: output.inference_id,
        inference_ms: output
            .inference_ms
            .unwrap_or_else(|| measured.as_secs_f64() * 1000.0),
        warnings,
        auxiliary,
        raw_response: output.raw,
    }
}

fn top_finding(output: &InferenceOutput) -> Option<PrimaryFinding> {
    output
        .findings
        .iter()
        .fold(None::<(&String, f64)>, |best, (label, &score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((label, score)),
        })
        .map(|(label, confidence)| PrimaryFinding {
            label: label.clone(),
            confidence,
            source: PrimarySource::Model,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(raw: serde_json::Value) -> InferenceOutput {
        InferenceOutput::from_raw(raw).unwrap()
    }

    #[test]
    fn test_top_finding_without_fusion() {
        let result = fuse(
            output(json!({"predictions": {"pneumonia": 0.82, "normal": 0.18}, "model_version": "v2"})),
            Duration::from_millis(120),
        );
        let primary = result.primary.unwrap();
        assert_eq!(primary.label, "pneumonia");
        assert_eq!(primary.confidence, 0.82);
        assert_eq!(primary.source, PrimarySource::Model);
        assert_eq!(result.model_version, "v2");
        assert_eq!(result.inference_ms, 120.0);
        assert_eq!(result.findings.len(), 2);
    }

    #[test]
    fn test_fused_diagnosis_is_primary_and_raw_map_kept() {
        let result = fuse(
            output(json!({
                "predictions": {"Effusion": 0.7, "Pneumonia": 0.4},
                "inference_time_ms": 33.0,
                "fusion": {"final_diagnosis": "Pneumonia", "confidence_score": 0.88, "flags": ["Consensus Mismatch"]}
            })),
            Duration::from_secs(2),
        );
        let primary = result.primary.unwrap();
        assert_eq!(primary.label, "Pneumonia");
        assert_eq!(primary.confidence, 0.88);
        assert_eq!(primary.source, PrimarySource::Fused);
        assert_eq!(result.findings["Effusion"], 0.7);
        assert_eq!(result.inference_ms, 33.0);
        assert_eq!(result.model_version, "unknown");
        assert!(result.warnings.contains(&"Consensus Mismatch".to_string()));
        assert_eq!(result.auxiliary["fusion"]["label"], "Pneumonia");
    }

    #[test]
    fn test_empty_findings_have_no_primary() {
        let result = fuse(output(json!({"predictions": {}})), Duration::ZERO);
        assert!(result.primary.is_none());
    }

    #[test]
    fn test_tie_prefers_first_label() {
        let result = fuse(
            output(json!({"predictions": {"b": 0.5, "a": 0.5}})),
            Duration::ZERO,
        );
        assert_eq!(result.primary.unwrap().label, "a");
    }
}
