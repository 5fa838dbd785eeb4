//! Remote file layout: one manifest plus one file per singleton section and
//! per experience / project record, all under `CareerCorpus/`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::models::{is_valid_record_id, record_id, Document, SectionId, SectionKind};

pub const REMOTE_DIR: &str = "CareerCorpus";
pub const MANIFEST_PATH: &str = "CareerCorpus/corpus_index.json";
pub const SPLIT_FORMAT_VERSION: &str = "1.0.0";

const EXPERIENCE_PREFIX: &str = "CareerCorpus/corpus_experience_";
const PROJECT_PREFIX: &str = "CareerCorpus/corpus_project_";

/// Singleton sections stored as `{ "<section>": <content> }` files.
const CORE_SECTIONS: [SectionKind; 5] = [
    SectionKind::Profile,
    SectionKind::Skills,
    SectionKind::Certifications,
    SectionKind::Education,
    SectionKind::Metadata,
];

pub fn core_file_path(kind: SectionKind) -> Option<String> {
    CORE_SECTIONS
        .contains(&kind)
        .then(|| format!("{REMOTE_DIR}/corpus_{}.json", kind.as_str()))
}

pub fn record_file_path(kind: SectionKind, id: &str) -> Option<String> {
    match kind {
        SectionKind::Experience => Some(format!("{EXPERIENCE_PREFIX}{id}.json")),
        SectionKind::Projects => Some(format!("{PROJECT_PREFIX}{id}.json")),
        _ => None,
    }
}

/// Wrapper key used inside a record file.
fn record_wrapper(kind: SectionKind) -> &'static str {
    match kind {
        SectionKind::Projects => "project",
        _ => kind.as_str(),
    }
}

pub fn is_corpus_path(path: &str) -> bool {
    path.strip_prefix(REMOTE_DIR)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathOwner {
    Manifest,
    Section(SectionKind),
    Record(SectionKind, String),
}

fn path_owner(path: &str) -> Option<PathOwner> {
    if path == MANIFEST_PATH {
        return Some(PathOwner::Manifest);
    }
    for (prefix, kind) in [
        (EXPERIENCE_PREFIX, SectionKind::Experience),
        (PROJECT_PREFIX, SectionKind::Projects),
    ] {
        if let Some(id) = path
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(".json"))
        {
            return Some(PathOwner::Record(kind, id.to_string()));
        }
    }
    CORE_SECTIONS
        .iter()
        .find(|k| core_file_path(**k).as_deref() == Some(path))
        .map(|k| PathOwner::Section(*k))
}

/// Whether writing `path` is within the scope approved for `target`.
///
/// The manifest is covered by every target since record membership changes
/// it; record files are covered by their record id or their whole collection.
pub fn covers(target: &SectionId, path: &str) -> bool {
    match path_owner(path) {
        Some(PathOwner::Manifest) => true,
        Some(PathOwner::Section(kind)) => target.kind() == kind && target.record_id().is_none(),
        Some(PathOwner::Record(kind, id)) => {
            target.kind() == kind
                && target.record_id().map_or(true, |r| r == id)
        }
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub path: String,
}

/// Index of the split files. Deterministic: no timestamps, no hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: String,
    pub schema_version: String,
    pub core_files: BTreeMap<String, String>,
    #[serde(default)]
    pub experience_files: Vec<ManifestEntry>,
    #[serde(default)]
    pub project_files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Every file path the manifest points at, in manifest order.
    pub fn referenced_paths(&self) -> Vec<&str> {
        CORE_SECTIONS
            .iter()
            .filter_map(|k| self.core_files.get(k.as_str()))
            .chain(self.experience_files.iter().map(|e| &e.path))
            .chain(self.project_files.iter().map(|e| &e.path))
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("{section} record at index {index} has no usable id")]
    MissingRecordId { section: SectionKind, index: usize },

    #[error("section '{0}' is missing or malformed")]
    MalformedSection(SectionKind),
}

/// Why a remote file could not be turned back into a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {reason}")]
pub struct DecodeFailure {
    pub path: String,
    pub reason: String,
}

impl DecodeFailure {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Materializes the split files for a document, manifest included.
pub fn split(document: &Document) -> Result<BTreeMap<String, Value>, LayoutError> {
    let mut files = BTreeMap::new();
    let mut core_files = BTreeMap::new();

    for kind in CORE_SECTIONS {
        let content = document
            .section(kind)
            .cloned()
            .ok_or(LayoutError::MalformedSection(kind))?;
        let Some(path) = core_file_path(kind) else {
            continue;
        };
        files.insert(path.clone(), wrap(kind.as_str(), content));
        core_files.insert(kind.as_str().to_string(), path);
    }

    let experience_files = split_records(document, SectionKind::Experience, &mut files)?;
    let project_files = split_records(document, SectionKind::Projects, &mut files)?;

    let manifest = Manifest {
        format_version: SPLIT_FORMAT_VERSION.to_string(),
        schema_version: document.schema_version().unwrap_or_default().to_string(),
        core_files,
        experience_files,
        project_files,
    };
    files.insert(MANIFEST_PATH.to_string(), manifest_value(&manifest));
    Ok(files)
}

fn split_records(
    document: &Document,
    kind: SectionKind,
    files: &mut BTreeMap<String, Value>,
) -> Result<Vec<ManifestEntry>, LayoutError> {
    let records = document
        .section(kind)
        .and_then(Value::as_array)
        .ok_or(LayoutError::MalformedSection(kind))?;

    let mut entries = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let id = record_id(record)
            .filter(|id| is_valid_record_id(id))
            .ok_or(LayoutError::MissingRecordId {
                section: kind,
                index,
            })?;
        let Some(path) = record_file_path(kind, id) else {
            continue;
        };
        files.insert(path.clone(), wrap(record_wrapper(kind), record.clone()));
        entries.push(ManifestEntry {
            id: id.to_string(),
            path,
        });
    }
    Ok(entries)
}

fn wrap(key: &str, content: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), content);
    Value::Object(map)
}

fn manifest_value(manifest: &Manifest) -> Value {
    // Plain strings and maps only; serialization cannot fail.
    serde_json::to_value(manifest).unwrap_or(Value::Null)
}

pub fn decode_manifest(value: &Value) -> Result<Manifest, DecodeFailure> {
    serde_json::from_value(value.clone())
        .map_err(|e| DecodeFailure::new(MANIFEST_PATH, format!("invalid manifest: {e}")))
}

/// Rebuilds a document from a manifest and the decoded files it references.
pub fn assemble(
    manifest: &Manifest,
    files: &BTreeMap<String, Value>,
) -> Result<Document, DecodeFailure> {
    let mut document = Document::empty(&manifest.schema_version);

    for kind in CORE_SECTIONS {
        let Some(path) = manifest.core_files.get(kind.as_str()) else {
            if kind == SectionKind::Skills {
                // older manifests predate the skills file
                continue;
            }
            return Err(DecodeFailure::new(
                MANIFEST_PATH,
                format!("no core file listed for '{kind}'"),
            ));
        };
        let content = unwrap_file(files, path, kind.as_str())?;
        document.set_section(kind, content);
    }
    lift_profile_skills(&mut document, manifest.core_files.contains_key("skills"));

    for (kind, entries) in [
        (SectionKind::Experience, &manifest.experience_files),
        (SectionKind::Projects, &manifest.project_files),
    ] {
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(unwrap_file(files, &entry.path, record_wrapper(kind))?);
        }
        document.set_section(kind, Value::Array(records));
    }

    Ok(document)
}

/// Older corpora kept skills under `profile.skills`. The key is always
/// dropped from the profile; its content becomes the skills section unless a
/// skills file exists.
fn lift_profile_skills(document: &mut Document, has_skills_file: bool) {
    let Some(legacy) = document
        .section(SectionKind::Profile)
        .and_then(|p| p.get("skills"))
        .cloned()
    else {
        return;
    };
    if let Some(mut profile) = document.section(SectionKind::Profile).cloned() {
        if let Some(fields) = profile.as_object_mut() {
            fields.remove("skills");
        }
        document.set_section(SectionKind::Profile, profile);
    }
    if !has_skills_file && legacy.is_object() {
        document.set_section(SectionKind::Skills, legacy);
    }
}

fn unwrap_file(
    files: &BTreeMap<String, Value>,
    path: &str,
    key: &str,
) -> Result<Value, DecodeFailure> {
    let file = files
        .get(path)
        .ok_or_else(|| DecodeFailure::new(path, "referenced file is missing"))?;
    file.get(key)
        .cloned()
        .ok_or_else(|| DecodeFailure::new(path, format!("expected a '{key}' object")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::fixtures::valid_document;
    use crate::corpus::validation::{CorpusSchemaValidator, SchemaValidator};

    #[test]
    fn test_split_paths() {
        let files = split(&valid_document()).unwrap();
        let paths: Vec<&str> = files.keys().map(String::as_str).collect();
        assert_eq!(
            paths,
            vec![
                "CareerCorpus/corpus_certifications.json",
                "CareerCorpus/corpus_education.json",
                "CareerCorpus/corpus_experience_exp_1.json",
                "CareerCorpus/corpus_index.json",
                "CareerCorpus/corpus_metadata.json",
                "CareerCorpus/corpus_profile.json",
                "CareerCorpus/corpus_project_proj_1.json",
                "CareerCorpus/corpus_skills.json",
            ]
        );
        assert_eq!(
            files["CareerCorpus/corpus_project_proj_1.json"]["project"]["name"],
            "Project A"
        );
    }

    #[test]
    fn test_split_then_assemble_restores_document() {
        let doc = valid_document();
        let files = split(&doc).unwrap();
        let manifest = decode_manifest(&files[MANIFEST_PATH]).unwrap();
        assert_eq!(assemble(&manifest, &files).unwrap(), doc);
    }

    #[test]
    fn test_manifest_is_deterministic() {
        let a = split(&valid_document()).unwrap();
        let b = split(&valid_document()).unwrap();
        assert_eq!(a[MANIFEST_PATH], b[MANIFEST_PATH]);
    }

    #[test]
    fn test_missing_referenced_file_names_path() {
        let mut files = split(&valid_document()).unwrap();
        files.remove("CareerCorpus/corpus_experience_exp_1.json");
        let manifest = decode_manifest(&files[MANIFEST_PATH]).unwrap();
        let err = assemble(&manifest, &files).unwrap_err();
        assert_eq!(err.path, "CareerCorpus/corpus_experience_exp_1.json");
    }

    #[test]
    fn test_wrong_wrapper_key_is_decode_failure() {
        let mut files = split(&valid_document()).unwrap();
        files.insert(
            "CareerCorpus/corpus_profile.json".into(),
            serde_json::json!({"profil": {}}),
        );
        let manifest = decode_manifest(&files[MANIFEST_PATH]).unwrap();
        let err = assemble(&manifest, &files).unwrap_err();
        assert_eq!(err.path, "CareerCorpus/corpus_profile.json");
    }

    #[test]
    fn test_legacy_manifest_without_skills() {
        let mut files = split(&valid_document()).unwrap();
        let mut manifest = decode_manifest(&files[MANIFEST_PATH]).unwrap();
        manifest.core_files.remove("skills");
        files.remove("CareerCorpus/corpus_skills.json");
        let doc = assemble(&manifest, &files).unwrap();
        assert_eq!(doc.section(SectionKind::Skills), Some(&serde_json::json!({})));
    }

    #[test]
    fn test_legacy_profile_skills_become_skills_section() {
        let mut files = split(&valid_document()).unwrap();
        let mut manifest = decode_manifest(&files[MANIFEST_PATH]).unwrap();
        manifest.core_files.remove("skills");
        files.remove("CareerCorpus/corpus_skills.json");
        let legacy = serde_json::json!({"technical": ["Go"], "methods": ["Scrum"]});
        files.insert(
            "CareerCorpus/corpus_profile.json".into(),
            serde_json::json!({"profile": {
                "full_name": "Test User",
                "headline": "Engineer",
                "links": [],
                "skills": legacy.clone(),
            }}),
        );

        let doc = assemble(&manifest, &files).unwrap();
        assert_eq!(doc.section(SectionKind::Skills), Some(&legacy));
        assert_eq!(
            doc.section(SectionKind::Profile),
            valid_document().section(SectionKind::Profile)
        );
        let result = CorpusSchemaValidator::new().validate(&doc, "1.0.0");
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_skills_file_wins_over_profile_skills() {
        let mut files = split(&valid_document()).unwrap();
        let manifest = decode_manifest(&files[MANIFEST_PATH]).unwrap();
        files.insert(
            "CareerCorpus/corpus_profile.json".into(),
            serde_json::json!({"profile": {
                "full_name": "Test User",
                "headline": "Engineer",
                "links": [],
                "skills": {"technical": ["Stale"]},
            }}),
        );
        assert_eq!(assemble(&manifest, &files).unwrap(), valid_document());
    }

    #[test]
    fn test_record_without_id_cannot_split() {
        let mut doc = valid_document();
        doc.set_section(SectionKind::Projects, serde_json::json!([{"name": "x"}]));
        assert_eq!(
            split(&doc),
            Err(LayoutError::MissingRecordId {
                section: SectionKind::Projects,
                index: 0
            })
        );
    }

    #[test]
    fn test_coverage_rules() {
        let profile: SectionId = "profile".parse().unwrap();
        let exp: SectionId = "experience".parse().unwrap();
        let exp_1: SectionId = "experience/exp_1".parse().unwrap();
        let exp_path = "CareerCorpus/corpus_experience_exp_1.json";

        assert!(covers(&profile, MANIFEST_PATH));
        assert!(covers(&profile, "CareerCorpus/corpus_profile.json"));
        assert!(!covers(&profile, exp_path));
        assert!(covers(&exp, exp_path));
        assert!(covers(&exp_1, exp_path));
        assert!(!covers(&exp_1, "CareerCorpus/corpus_experience_exp_2.json"));
        assert!(!covers(&exp, "README.md"));
    }

    #[test]
    fn test_corpus_path_prefix() {
        assert!(is_corpus_path(MANIFEST_PATH));
        assert!(!is_corpus_path("CareerCorpusOld/x.json"));
        assert!(!is_corpus_path("README.md"));
    }
}
