//! Field extraction pass: analyse with the form's neural model and reshape
//! the returned fields into the form's output document.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::analysis::{AnalyzeResult, DocumentAnalyzer};
use crate::forms::{FormDefinition, PATH_DELIMITER, TEMPLATE_ROOT};
use crate::routing::ModelRoute;

/// Run the extraction model once and shape its result for `form`.
pub async fn extract_fields(
    analyzer: &dyn DocumentAnalyzer,
    route: &ModelRoute,
    form: &FormDefinition,
    filename: &str,
    data: &[u8],
) -> Result<Value> {
    info!(
        "Starting extraction for: {} with {} ({}) via {}",
        filename,
        form.form_id,
        route.model_id,
        analyzer.name()
    );

    let result = analyzer.analyze(route, filename, data).await?;
    let output = shape_output(form, &result);

    let missing = missing_fields(form, &result);
    if !missing.is_empty() {
        debug!(
            "{} template field(s) not returned for {}: {:?}",
            missing.len(),
            form.form_id,
            missing
        );
    }

    info!(
        "Extraction complete: {} field(s) from {} document(s)",
        result.documents.iter().map(|d| d.fields.len()).sum::<usize>(),
        result.documents.len()
    );
    Ok(output)
}

/// Start from the form template, add each field as `name -> [value, confidence]`
/// at the top level, then re-nest `|`-delimited names.
pub fn shape_output(form: &FormDefinition, result: &AnalyzeResult) -> Value {
    let mut flat = form.initial_output();

    for document in &result.documents {
        for (name, field) in &document.fields {
            let confidence = field
                .confidence
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null);
            debug!("{} = {} [{}]", name, field.resolved_value(), confidence);
            flat.insert(name.clone(), json!([field.resolved_value(), confidence]));
        }
    }

    Value::Object(nest_keys(flat))
}

/// Template leaves the service returned no field for, either by bare path
/// or under the `Root|` prefix.
pub fn missing_fields(form: &FormDefinition, result: &AnalyzeResult) -> Vec<String> {
    let returned: HashSet<&str> = result
        .documents
        .iter()
        .flat_map(|d| d.fields.iter().map(|(name, _)| name.as_str()))
        .collect();
    let root_prefix = format!("{}{}", TEMPLATE_ROOT, PATH_DELIMITER);

    form.field_names()
        .into_iter()
        .filter(|name| {
            !returned.contains(name.as_str())
                && !returned.contains(format!("{}{}", root_prefix, name).as_str())
        })
        .collect()
}

/// Split keys on `|` and rebuild them as nested objects. Path segments merge
/// into existing objects; a non-object in the way is replaced.
pub fn nest_keys(flat: Map<String, Value>) -> Map<String, Value> {
    let mut nested = Map::new();

    for (key, value) in flat {
        let mut segments: Vec<&str> = key.split(PATH_DELIMITER).collect();
        let leaf = segments.pop().unwrap_or_default();

        let mut cursor = &mut nested;
        for segment in segments {
            let slot = cursor
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            cursor = match slot {
                Value::Object(map) => map,
                _ => unreachable!("slot was just made an object"),
            };
        }
        cursor.insert(leaf.to_string(), value);
    }

    nested
}

/// JSON text indented by four spaces, as returned to clients.
pub fn to_pretty_json(value: &Value) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut ser)
        .context("Failed to serialize extraction output")?;
    String::from_utf8(buf).context("Extraction output is not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalyzedDocument, DocumentField};
    use crate::forms::{FormId, FormRegistry};
    use async_trait::async_trait;

    fn field(value: &str, confidence: f64) -> DocumentField {
        DocumentField {
            value_string: Some(value.to_string()),
            confidence: Some(confidence),
            ..Default::default()
        }
    }

    fn result_with(fields: Vec<(&str, DocumentField)>) -> AnalyzeResult {
        AnalyzeResult {
            documents: vec![AnalyzedDocument {
                fields: fields
                    .into_iter()
                    .map(|(n, f)| (n.to_string(), f))
                    .collect(),
            }],
        }
    }

    #[test]
    fn test_fields_land_next_to_template() {
        let registry = FormRegistry::builtin().unwrap();
        let form = registry.get(FormId::AccountOpening);
        let result = result_with(vec![
            ("Name", field("JUAN DELA CRUZ", 0.97)),
            ("Branch", field("Makati", 0.5)),
        ]);

        let out = shape_output(form, &result);
        assert_eq!(out["Name"], json!(["JUAN DELA CRUZ", 0.97]));
        assert_eq!(out["Branch"], json!(["Makati", 0.5]));
        // template stays untouched under Root
        assert_eq!(out["Root"]["Name"], json!([]));

        let keys: Vec<&String> = out.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["Root", "Name", "Branch"]);
    }

    #[test]
    fn test_delimited_names_merge_into_template() {
        let registry = FormRegistry::builtin().unwrap();
        let form = registry.get(FormId::AccountOpening);
        let result = result_with(vec![("Root|Gender|Male", field("selected", 0.88))]);

        let out = shape_output(form, &result);
        assert_eq!(out["Root"]["Gender"]["Male"], json!(["selected", 0.88]));
        assert_eq!(out["Root"]["Gender"]["Female"], json!([]));
        assert!(out.get("Root|Gender|Male").is_none());
    }

    #[test]
    fn test_nest_keys_replaces_leaf_in_the_way() {
        let mut flat = Map::new();
        flat.insert("A".to_string(), json!([]));
        flat.insert("A|B".to_string(), json!(1));
        flat.insert("C".to_string(), json!(2));

        let nested = nest_keys(flat);
        assert_eq!(Value::Object(nested), json!({"A": {"B": 1}, "C": 2}));
    }

    #[test]
    fn test_later_documents_overwrite() {
        let registry = FormRegistry::builtin().unwrap();
        let form = registry.get(FormId::VoterRoster);
        let mut result = result_with(vec![("Name", field("first", 0.1))]);
        result.documents.push(AnalyzedDocument {
            fields: vec![("Name".to_string(), field("second", 0.2))],
        });

        let out = shape_output(form, &result);
        assert_eq!(out["Name"], json!(["second", 0.2]));
    }

    #[test]
    fn test_missing_confidence_is_null() {
        let registry = FormRegistry::builtin().unwrap();
        let form = registry.get(FormId::ChannelRequest);
        let result = result_with(vec![(
            "Remarks",
            DocumentField {
                content: Some("n/a".to_string()),
                ..Default::default()
            },
        )]);

        let out = shape_output(form, &result);
        assert_eq!(out["Remarks"], json!(["n/a", null]));
    }

    struct FailingAnalyzer;

    #[async_trait]
    impl DocumentAnalyzer for FailingAnalyzer {
        fn name(&self) -> &str {
            "failing"
        }

        async fn analyze(&self, _: &ModelRoute, _: &str, _: &[u8]) -> Result<AnalyzeResult> {
            anyhow::bail!("invalid subscription key")
        }
    }

    #[tokio::test]
    async fn test_analyzer_errors_propagate() {
        let registry = FormRegistry::builtin().unwrap();
        let route = ModelRoute {
            endpoint: "https://x".to_string(),
            api_key: "k".to_string(),
            model_id: "Form1_Neural".to_string(),
        };
        let err = extract_fields(
            &FailingAnalyzer,
            &route,
            registry.get(FormId::ChannelRequest),
            "scan.pdf",
            b"%PDF",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("invalid subscription key"));
    }

    #[test]
    fn test_pretty_json_is_indented() {
        let text = to_pretty_json(&json!({"a": [1, 0.5]})).unwrap();
        assert_eq!(text, "{\n    \"a\": [\n        1,\n        0.5\n    ]\n}");
    }

    #[test]
    fn test_missing_fields_accepts_root_prefix() {
        let registry = FormRegistry::builtin().unwrap();
        let form = registry.get(FormId::AccountOpening);
        let all = form.field_names();
        assert!(all.iter().any(|n| n == "Name"));
        assert!(all.iter().any(|n| n == "Gender|Male"));

        let result = result_with(vec![
            ("Name", field("JUAN", 0.9)),
            ("Root|Gender|Male", field("selected", 0.8)),
        ]);
        let missing = missing_fields(form, &result);
        assert_eq!(missing.len(), all.len() - 2);
        assert!(!missing.iter().any(|n| n == "Name" || n == "Gender|Male"));
    }
}
