use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::models::{is_valid_record_id, Document, SectionKind, SectionPatch};
use super::schema::{is_supported_version, section_fields, FieldSpec, FieldType};

/// One validation failure, addressed by a JSON path like `experience[0].title`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathedError {
    pub path: String,
    pub message: String,
}

impl PathedError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<PathedError>,
}

impl ValidationResult {
    fn from_errors(mut errors: Vec<PathedError>) -> Self {
        errors.sort();
        errors.dedup();
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Checks documents and patches against a versioned schema.
///
/// Implementations are pure and collect every error instead of stopping at
/// the first one.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, document: &Document, schema_version: &str) -> ValidationResult;

    /// Validates only what `patch` touches once applied to `existing`, so
    /// unrelated sections may still be incomplete.
    fn validate_patch(
        &self,
        existing: &Document,
        patch: &SectionPatch,
        schema_version: &str,
    ) -> ValidationResult;
}

/// Words that mark a note as describing provenance or storage mechanics
/// rather than career content.
fn notes_policy() -> &'static Regex {
    static NOTES_POLICY: OnceLock<Regex> = OnceLock::new();
    NOTES_POLICY.get_or_init(|| {
        Regex::new(
            r"(?i)\b(source|uploaded?|onboarding|current chat|from chat|manual import|persisted|committed|branch|commit|sha|blob|tree|ref)\b",
        )
        .expect("valid notes policy regex")
    })
}

#[derive(Debug, Clone, Default)]
pub struct CorpusSchemaValidator;

impl CorpusSchemaValidator {
    pub fn new() -> Self {
        Self
    }
}

impl SchemaValidator for CorpusSchemaValidator {
    fn validate(&self, document: &Document, schema_version: &str) -> ValidationResult {
        let mut errors = Vec::new();
        check_version(document, schema_version, &mut errors);

        for kind in SectionKind::ALL {
            match document.section(kind) {
                Some(value) => validate_section(kind, value, &mut errors),
                None => errors.push(PathedError::new(kind.as_str(), "required section is missing")),
            }
        }

        for key in document.as_map().keys() {
            let known = key == "schema_version" || SectionKind::ALL.iter().any(|k| k.as_str() == key);
            if !known {
                errors.push(PathedError::new(key.as_str(), "unknown top-level field"));
            }
        }

        ValidationResult::from_errors(errors)
    }

    fn validate_patch(
        &self,
        existing: &Document,
        patch: &SectionPatch,
        schema_version: &str,
    ) -> ValidationResult {
        let mut errors = Vec::new();
        if !is_supported_version(schema_version) {
            errors.push(PathedError::new(
                "schema_version",
                format!("unsupported schema version '{schema_version}'"),
            ));
        }

        let mut candidate = existing.clone();
        if let Err(e) = candidate.apply(patch) {
            errors.push(PathedError::new(patch.section.to_string(), e.to_string()));
            return ValidationResult::from_errors(errors);
        }
        candidate.normalize();

        let kind = patch.section.kind();
        match patch.section.record_id() {
            None => match candidate.section(kind) {
                Some(value) => validate_section(kind, value, &mut errors),
                None => errors.push(PathedError::new(kind.as_str(), "required section is missing")),
            },
            Some(_) if patch.content.is_null() => {}
            Some(id) => {
                let records = candidate.records(kind);
                if let Some((idx, record)) = records
                    .iter()
                    .enumerate()
                    .find(|(_, r)| r.get("id").and_then(Value::as_str) == Some(id))
                {
                    validate_record(kind, record, &format!("{}[{}]", kind, idx), &mut errors);
                }
            }
        }

        ValidationResult::from_errors(errors)
    }
}

fn check_version(document: &Document, expected: &str, errors: &mut Vec<PathedError>) {
    if !is_supported_version(expected) {
        errors.push(PathedError::new(
            "schema_version",
            format!("unsupported schema version '{expected}'"),
        ));
        return;
    }
    match document.as_map().get("schema_version") {
        None => errors.push(PathedError::new("schema_version", "is required")),
        Some(Value::String(v)) if v == expected => {}
        Some(Value::String(v)) => errors.push(PathedError::new(
            "schema_version",
            format!("expected '{expected}', found '{v}'"),
        )),
        Some(_) => errors.push(PathedError::new("schema_version", "must be a string")),
    }
}

fn validate_section(kind: SectionKind, value: &Value, errors: &mut Vec<PathedError>) {
    let path = kind.as_str();
    if !kind.is_list() {
        validate_record(kind, value, path, errors);
        return;
    }

    let Some(records) = value.as_array() else {
        errors.push(PathedError::new(path, "must be a list"));
        return;
    };
    let mut seen = HashSet::new();
    for (idx, record) in records.iter().enumerate() {
        let record_path = format!("{path}[{idx}]");
        validate_record(kind, record, &record_path, errors);
        if let Some(id) = record.get("id").and_then(Value::as_str) {
            if !seen.insert(id) {
                errors.push(PathedError::new(
                    format!("{record_path}.id"),
                    format!("duplicate id '{id}'"),
                ));
            }
        }
    }
}

fn validate_record(kind: SectionKind, value: &Value, path: &str, errors: &mut Vec<PathedError>) {
    match value.as_object() {
        Some(fields) => validate_fields(section_fields(kind), fields, path, errors),
        None => errors.push(PathedError::new(path, "must be an object")),
    }
}

fn validate_fields(
    specs: &[FieldSpec],
    fields: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<PathedError>,
) {
    for spec in specs {
        let field_path = format!("{path}.{}", spec.name);
        match fields.get(spec.name) {
            None if spec.required => errors.push(PathedError::new(field_path, "is required")),
            None => {}
            Some(Value::Null) if spec.nullable => {}
            Some(Value::Null) => errors.push(PathedError::new(field_path, "must not be null")),
            Some(value) => {
                check_type(spec, value, &field_path, errors);
                if spec.name == "notes" {
                    check_notes(value, &field_path, errors);
                }
            }
        }
    }

    for key in fields.keys() {
        if !specs.iter().any(|s| s.name == key) {
            errors.push(PathedError::new(format!("{path}.{key}"), "unknown field"));
        }
    }
}

fn check_type(spec: &FieldSpec, value: &Value, path: &str, errors: &mut Vec<PathedError>) {
    let mismatch = || PathedError::new(path, format!("must be {}", spec.ty.describe()));
    match spec.ty {
        FieldType::String => match value.as_str() {
            Some(s) if spec.required && s.trim().is_empty() => {
                errors.push(PathedError::new(path, "must not be empty"))
            }
            Some(_) => {}
            None => errors.push(mismatch()),
        },
        FieldType::Date => {
            if !value.as_str().is_some_and(is_valid_date) {
                errors.push(mismatch());
            }
        }
        FieldType::Identifier => {
            if !value.as_str().is_some_and(is_valid_record_id) {
                errors.push(mismatch());
            }
        }
        FieldType::Integer => {
            if !(value.is_i64() || value.is_u64()) {
                errors.push(mismatch());
            }
        }
        FieldType::Bool => {
            if !value.is_boolean() {
                errors.push(mismatch());
            }
        }
        FieldType::StringList => match value.as_array() {
            Some(items) => {
                for (idx, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        errors.push(PathedError::new(format!("{path}[{idx}]"), "must be a string"));
                    }
                }
            }
            None => errors.push(mismatch()),
        },
        FieldType::LinkList => match value.as_array() {
            Some(items) => {
                for (idx, item) in items.iter().enumerate() {
                    check_link(item, &format!("{path}[{idx}]"), errors);
                }
            }
            None => errors.push(mismatch()),
        },
        FieldType::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => {}
            _ => errors.push(PathedError::new(
                path,
                format!("must be one of: {}", allowed.join(", ")),
            )),
        },
    }
}

fn check_link(item: &Value, path: &str, errors: &mut Vec<PathedError>) {
    let Some(link) = item.as_object() else {
        errors.push(PathedError::new(path, "must be an object with name and url"));
        return;
    };
    for key in ["name", "url"] {
        match link.get(key).and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => {}
            _ => errors.push(PathedError::new(
                format!("{path}.{key}"),
                "must be a non-empty string",
            )),
        }
    }
    for key in link.keys() {
        if key != "name" && key != "url" {
            errors.push(PathedError::new(format!("{path}.{key}"), "unknown field"));
        }
    }
}

fn check_notes(value: &Value, path: &str, errors: &mut Vec<PathedError>) {
    let Some(notes) = value.as_str() else {
        return;
    };
    if let Some(found) = notes_policy().find(notes) {
        errors.push(PathedError::new(
            path,
            format!(
                "notes must describe career content only (found '{}')",
                found.as_str()
            ),
        ));
    }
}

/// `YYYY-MM` or `YYYY-MM-DD`, checked against the calendar.
pub fn is_valid_date(value: &str) -> bool {
    match value.len() {
        7 => NaiveDate::parse_from_str(&format!("{value}-01"), "%Y-%m-%d").is_ok(),
        10 => NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::fixtures::valid_document;
    use crate::corpus::models::Provenance;
    use serde_json::json;

    fn paths(result: &ValidationResult) -> Vec<&str> {
        result.errors.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_valid_document_passes() {
        let result = CorpusSchemaValidator::new().validate(&valid_document(), "1.0.0");
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_collects_every_error() {
        let mut doc = valid_document();
        doc.set_section(
            SectionKind::Experience,
            json!([{"id": "exp_1", "employer": 7, "start_date": "January", "extra": true}]),
        );
        doc.set_section(
            SectionKind::Certifications,
            json!([{"id": "cert_1", "name": "A", "issuer": "B", "status": "lapsed"}]),
        );
        let mut map = doc.as_map().clone();
        map.remove("skills");
        let doc = Document::from_value(Value::Object(map)).unwrap();

        let result = CorpusSchemaValidator::new().validate(&doc, "1.0.0");
        assert!(!result.valid);
        assert_eq!(
            paths(&result),
            vec![
                "certifications[0].status",
                "experience[0].employer",
                "experience[0].extra",
                "experience[0].start_date",
                "experience[0].title",
                "skills",
            ]
        );
    }

    #[test]
    fn test_missing_sections_reported() {
        let doc = Document::from_value(json!({"schema_version": "1.0.0"})).unwrap();
        let result = CorpusSchemaValidator::new().validate(&doc, "1.0.0");
        assert_eq!(result.errors.len(), SectionKind::ALL.len());
    }

    #[test]
    fn test_version_mismatch_and_unsupported() {
        let doc = valid_document();
        let result = CorpusSchemaValidator::new().validate(&doc, "2.0.0");
        assert_eq!(paths(&result), vec!["schema_version"]);

        let mut doc = valid_document();
        doc.set_schema_version("0.1.0");
        let result = CorpusSchemaValidator::new().validate(&doc, "1.0.0");
        assert!(result.errors[0].message.contains("expected '1.0.0'"));
    }

    #[test]
    fn test_notes_policy_rejects_provenance() {
        let mut doc = valid_document();
        doc.set_section(
            SectionKind::Profile,
            json!({"full_name": "T", "notes": "Imported from the uploaded CV"}),
        );
        let result = CorpusSchemaValidator::new().validate(&doc, "1.0.0");
        assert_eq!(paths(&result), vec!["profile.notes"]);

        doc.set_section(
            SectionKind::Profile,
            json!({"full_name": "T", "notes": "Prefers remote roles"}),
        );
        assert!(CorpusSchemaValidator::new().validate(&doc, "1.0.0").valid);
    }

    #[test]
    fn test_duplicate_record_ids() {
        let mut doc = valid_document();
        doc.set_section(
            SectionKind::Education,
            json!([
                {"id": "edu_1", "degree": "BS", "institution": "A"},
                {"id": "edu_1", "degree": "MS", "institution": "B"}
            ]),
        );
        let result = CorpusSchemaValidator::new().validate(&doc, "1.0.0");
        assert_eq!(paths(&result), vec!["education[1].id"]);
    }

    #[test]
    fn test_patch_validation_ignores_unrelated_sections() {
        let existing = Document::empty("1.0.0");
        let patch = SectionPatch {
            section: "experience/exp_9".parse().unwrap(),
            content: json!({"employer": "Acme", "title": "SRE", "start_date": "2021-03-15"}),
            provenance: Provenance::UploadedSource,
        };
        let result = CorpusSchemaValidator::new().validate_patch(&existing, &patch, "1.0.0");
        assert!(result.valid, "{:?}", result.errors);
        // the full document is still incomplete
        let mut full = existing.clone();
        full.apply(&patch).unwrap();
        assert!(!CorpusSchemaValidator::new().validate(&full, "1.0.0").valid);
    }

    #[test]
    fn test_patch_validation_reports_record_errors() {
        let patch = SectionPatch {
            section: "experience/exp_9".parse().unwrap(),
            content: json!({"employer": "Acme", "start_date": "2021-13"}),
            provenance: Provenance::ChatConfirmed,
        };
        let result =
            CorpusSchemaValidator::new().validate_patch(&valid_document(), &patch, "1.0.0");
        assert_eq!(
            paths(&result),
            vec!["experience[1].start_date", "experience[1].title"]
        );
    }

    #[test]
    fn test_patch_that_cannot_apply_is_invalid() {
        let patch = SectionPatch {
            section: "projects/missing".parse().unwrap(),
            content: Value::Null,
            provenance: Provenance::UserCorrection,
        };
        let result =
            CorpusSchemaValidator::new().validate_patch(&valid_document(), &patch, "1.0.0");
        assert_eq!(paths(&result), vec!["projects/missing"]);
    }

    #[test]
    fn test_date_formats() {
        assert!(is_valid_date("2020-01"));
        assert!(is_valid_date("2020-02-29"));
        assert!(!is_valid_date("2021-02-29"));
        assert!(!is_valid_date("2020"));
        assert!(!is_valid_date("01-2020"));
    }
}
