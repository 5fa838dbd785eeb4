use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// The named, independently addressable parts of a career corpus document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Profile,
    Experience,
    Projects,
    Skills,
    Certifications,
    Education,
    Metadata,
}

impl SectionKind {
    pub const ALL: [SectionKind; 7] = [
        SectionKind::Profile,
        SectionKind::Experience,
        SectionKind::Projects,
        SectionKind::Skills,
        SectionKind::Certifications,
        SectionKind::Education,
        SectionKind::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Profile => "profile",
            SectionKind::Experience => "experience",
            SectionKind::Projects => "projects",
            SectionKind::Skills => "skills",
            SectionKind::Certifications => "certifications",
            SectionKind::Education => "education",
            SectionKind::Metadata => "metadata",
        }
    }

    /// Sections whose content is a list of records.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            SectionKind::Experience
                | SectionKind::Projects
                | SectionKind::Certifications
                | SectionKind::Education
        )
    }

    /// Sections stored one file per record, so single records are addressable.
    pub fn is_record_addressable(&self) -> bool {
        matches!(self, SectionKind::Experience | SectionKind::Projects)
    }

    /// Prefix for generated record ids.
    pub fn id_prefix(&self) -> Option<&'static str> {
        match self {
            SectionKind::Experience => Some("exp"),
            SectionKind::Projects => Some("proj"),
            SectionKind::Certifications => Some("cert"),
            SectionKind::Education => Some("edu"),
            _ => None,
        }
    }

    fn empty_content(&self) -> Value {
        if self.is_list() {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionKind {
    type Err = SectionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SectionKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SectionIdError::UnknownSection(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SectionIdError {
    #[error("unknown section '{0}'")]
    UnknownSection(String),

    #[error("section '{0}' does not address individual records")]
    NotRecordAddressable(String),

    #[error("invalid record id '{0}' (use letters, digits, '_' or '-')")]
    InvalidRecordId(String),
}

/// Identifies a whole section (`experience`) or one record of a
/// record-addressable section (`experience/exp_1`).
///
/// Approval is keyed by this id and matched exactly: a collection id and the
/// ids of its records are distinct.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SectionId {
    kind: SectionKind,
    record: Option<String>,
}

impl SectionId {
    pub fn section(kind: SectionKind) -> Self {
        Self { kind, record: None }
    }

    pub fn record(kind: SectionKind, id: &str) -> Result<Self, SectionIdError> {
        if !kind.is_record_addressable() {
            return Err(SectionIdError::NotRecordAddressable(kind.to_string()));
        }
        if !is_valid_record_id(id) {
            return Err(SectionIdError::InvalidRecordId(id.to_string()));
        }
        Ok(Self {
            kind,
            record: Some(id.to_string()),
        })
    }

    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    pub fn record_id(&self) -> Option<&str> {
        self.record.as_deref()
    }
}

pub fn is_valid_record_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.record {
            Some(id) => write!(f, "{}/{}", self.kind, id),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

impl FromStr for SectionId {
    type Err = SectionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((kind, id)) => SectionId::record(kind.parse()?, id),
            None => Ok(SectionId::section(s.parse()?)),
        }
    }
}

impl TryFrom<String> for SectionId {
    type Error = SectionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SectionId> for String {
    fn from(id: SectionId) -> Self {
        id.to_string()
    }
}

/// Where the content of a patch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    UploadedSource,
    ChatConfirmed,
    UserCorrection,
}

/// A proposed replacement for exactly one section or one record.
///
/// Record patches with `null` content delete the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionPatch {
    pub section: SectionId,
    pub content: Value,
    pub provenance: Provenance,
}

impl SectionPatch {
    /// Gives id-less records of a collection patch a generated id, so every
    /// draft built from the staged patch sees the same ids.
    pub fn assign_record_ids(&mut self) -> bool {
        let Some(prefix) = self.section.kind().id_prefix() else {
            return false;
        };
        if self.section.record_id().is_some() {
            return false;
        }
        let Value::Array(records) = &mut self.content else {
            return false;
        };
        let mut changed = false;
        for record in records.iter_mut().filter_map(Value::as_object_mut) {
            changed |= ensure_record_id(record, prefix);
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("section '{0}' is not a list of records")]
    NotAList(SectionKind),

    #[error("record patch for '{0}' must be an object or null")]
    InvalidRecord(SectionId),

    #[error("record '{0}' does not exist")]
    RecordNotFound(SectionId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("corpus document must be a JSON object")]
pub struct NotAnObject;

/// The canonical structured career record.
///
/// Held as a JSON object so the schema validator can report missing
/// sections and type mismatches rather than failing at decode time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// A document with every section present and empty.
    pub fn empty(schema_version: &str) -> Self {
        let mut map = Map::new();
        map.insert(
            "schema_version".to_string(),
            Value::String(schema_version.to_string()),
        );
        for kind in SectionKind::ALL {
            map.insert(kind.as_str().to_string(), kind.empty_content());
        }
        Document(map)
    }

    pub fn from_value(value: Value) -> Result<Self, NotAnObject> {
        match value {
            Value::Object(map) => Ok(Document(map)),
            _ => Err(NotAnObject),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn schema_version(&self) -> Option<&str> {
        self.0.get("schema_version").and_then(Value::as_str)
    }

    pub fn set_schema_version(&mut self, version: &str) {
        self.0.insert(
            "schema_version".to_string(),
            Value::String(version.to_string()),
        );
    }

    pub fn section(&self, kind: SectionKind) -> Option<&Value> {
        self.0.get(kind.as_str())
    }

    pub fn set_section(&mut self, kind: SectionKind, content: Value) {
        self.0.insert(kind.as_str().to_string(), content);
    }

    /// Records of a list section; empty when the section is absent or malformed.
    pub fn records(&self, kind: SectionKind) -> &[Value] {
        self.section(kind)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn record(&self, kind: SectionKind, id: &str) -> Option<&Value> {
        self.records(kind).iter().find(|r| record_id(r) == Some(id))
    }

    pub fn onboarding_complete(&self) -> bool {
        self.section(SectionKind::Metadata)
            .and_then(|m| m.get("onboarding_complete"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Applies a patch in place. Only the in-memory document is touched.
    pub fn apply(&mut self, patch: &SectionPatch) -> Result<(), PatchError> {
        let kind = patch.section.kind();
        let Some(id) = patch.section.record_id() else {
            self.set_section(kind, patch.content.clone());
            return Ok(());
        };

        let entry = self
            .0
            .entry(kind.as_str().to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        let records = entry.as_array_mut().ok_or(PatchError::NotAList(kind))?;
        let position = records.iter().position(|r| record_id(r) == Some(id));

        match (&patch.content, position) {
            (Value::Null, Some(idx)) => {
                records.remove(idx);
            }
            (Value::Null, None) => return Err(PatchError::RecordNotFound(patch.section.clone())),
            (Value::Object(fields), position) => {
                let mut record = fields.clone();
                record.insert("id".to_string(), Value::String(id.to_string()));
                match position {
                    Some(idx) => records[idx] = Value::Object(record),
                    None => records.push(Value::Object(record)),
                }
            }
            _ => return Err(PatchError::InvalidRecord(patch.section.clone())),
        }
        Ok(())
    }

    /// Brings legacy or loosely-entered content into canonical shape.
    /// Returns true when anything changed.
    pub fn normalize(&mut self) -> bool {
        let mut changed = self.merge_legacy_notes();
        changed |= self.normalize_links();

        for kind in SectionKind::ALL {
            let Some(section) = self.0.get_mut(kind.as_str()) else {
                continue;
            };
            match section {
                Value::Array(records) => {
                    for record in records.iter_mut().filter_map(Value::as_object_mut) {
                        if let Some(prefix) = kind.id_prefix() {
                            changed |= ensure_record_id(record, prefix);
                        }
                        changed |= normalize_notes(record);
                    }
                }
                Value::Object(fields) => changed |= normalize_notes(fields),
                _ => {}
            }
        }
        changed
    }

    fn merge_legacy_notes(&mut self) -> bool {
        let mut changed = false;
        if let Some(legacy) = self.0.remove("notes") {
            changed = true;
            let incoming = legacy.as_str().map(str::trim).unwrap_or_default();
            if !incoming.is_empty() {
                if let Some(profile) = self
                    .0
                    .get_mut(SectionKind::Profile.as_str())
                    .and_then(Value::as_object_mut)
                {
                    let existing = profile
                        .get("notes")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .unwrap_or_default();
                    let merged = if existing.is_empty() {
                        incoming.to_string()
                    } else {
                        format!("{existing} | {incoming}")
                    };
                    profile.insert("notes".to_string(), Value::String(merged));
                }
            }
        }
        if let Some(metadata) = self
            .0
            .get_mut(SectionKind::Metadata.as_str())
            .and_then(Value::as_object_mut)
        {
            changed |= metadata.remove("notes").is_some();
        }
        changed
    }

    fn normalize_links(&mut self) -> bool {
        let Some(profile) = self
            .0
            .get_mut(SectionKind::Profile.as_str())
            .and_then(Value::as_object_mut)
        else {
            return false;
        };
        let Some(links) = profile.get("links") else {
            return false;
        };
        let normalized: Vec<Value> = match links {
            Value::Null => return false,
            Value::Array(items) => items.iter().filter_map(normalize_link).collect(),
            _ => Vec::new(),
        };
        let normalized = Value::Array(normalized);
        if profile.get("links") == Some(&normalized) {
            return false;
        }
        profile.insert("links".to_string(), normalized);
        true
    }
}

pub fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

fn ensure_record_id(record: &mut Map<String, Value>, prefix: &str) -> bool {
    let has_id = record
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.trim().is_empty());
    if has_id {
        return false;
    }
    let generated = format!("{prefix}_{}", Uuid::new_v4().simple());
    record.insert("id".to_string(), Value::String(generated));
    true
}

/// Blank notes become null; non-string notes are stringified.
fn normalize_notes(fields: &mut Map<String, Value>) -> bool {
    let Some(notes) = fields.get("notes") else {
        return false;
    };
    let normalized = match notes {
        Value::Null => return false,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string().trim().to_string(),
    };
    let normalized = if normalized.is_empty() {
        Value::Null
    } else {
        Value::String(normalized)
    };
    if fields.get("notes") == Some(&normalized) {
        return false;
    }
    fields.insert("notes".to_string(), normalized);
    true
}

/// Accepts `{name, url}`, `{name, link}`, `"Label: value"` or a bare URL.
fn normalize_link(item: &Value) -> Option<Value> {
    let (name, url) = match item {
        Value::Object(fields) => {
            let url = fields
                .get("url")
                .and_then(Value::as_str)
                .or_else(|| fields.get("link").and_then(Value::as_str))
                .unwrap_or_default()
                .trim()
                .to_string();
            let name = fields
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            (name, url)
        }
        Value::String(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return None;
            }
            match parse_named_link(raw) {
                Some((label, value)) => (label.to_string(), value.to_string()),
                None => (String::new(), raw.to_string()),
            }
        }
        _ => return None,
    };
    if url.is_empty() {
        return None;
    }
    let name = if name.is_empty() {
        infer_link_name(&url).to_string()
    } else {
        name
    };
    let mut link = Map::new();
    link.insert("name".to_string(), Value::String(name));
    link.insert("url".to_string(), Value::String(url));
    Some(Value::Object(link))
}

fn parse_named_link(value: &str) -> Option<(&str, &str)> {
    let lower = value.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return None;
    }
    let (label, rest) = value.split_once(':')?;
    let (label, rest) = (label.trim(), rest.trim());
    if label.is_empty() || rest.is_empty() {
        return None;
    }
    Some((label, rest))
}

fn infer_link_name(url: &str) -> &'static str {
    let host = url
        .split("://")
        .nth(1)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if host.contains("github.com") {
        "GitHub"
    } else if host.contains("linkedin.com") {
        "LinkedIn"
    } else if host.contains("stackoverflow.com") {
        "Stack Overflow"
    } else {
        "Website"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(section: &str, content: Value) -> SectionPatch {
        SectionPatch {
            section: section.parse().unwrap(),
            content,
            provenance: Provenance::ChatConfirmed,
        }
    }

    #[test]
    fn test_section_id_round_trips_through_strings() {
        let id: SectionId = "experience/exp_1".parse().unwrap();
        assert_eq!(id.kind(), SectionKind::Experience);
        assert_eq!(id.record_id(), Some("exp_1"));
        assert_eq!(id.to_string(), "experience/exp_1");
        assert_eq!("skills".parse::<SectionId>().unwrap().record_id(), None);
    }

    #[test]
    fn test_section_id_rejects_records_of_singletons() {
        assert_eq!(
            "profile/x".parse::<SectionId>(),
            Err(SectionIdError::NotRecordAddressable("profile".into()))
        );
        assert!("experience/../etc".parse::<SectionId>().is_err());
        assert!("hobbies".parse::<SectionId>().is_err());
    }

    #[test]
    fn test_collection_and_record_ids_are_distinct() {
        let collection: SectionId = "experience".parse().unwrap();
        let record: SectionId = "experience/exp_1".parse().unwrap();
        assert_ne!(collection, record);
        assert!(collection < record);
    }

    #[test]
    fn test_record_patch_upserts_and_forces_id() {
        let mut doc = Document::empty("1.0.0");
        doc.apply(&patch(
            "experience/exp_a",
            json!({"id": "other", "employer": "Acme"}),
        ))
        .unwrap();
        assert_eq!(doc.records(SectionKind::Experience).len(), 1);
        assert_eq!(
            doc.record(SectionKind::Experience, "exp_a").unwrap()["employer"],
            "Acme"
        );

        doc.apply(&patch("experience/exp_a", json!({"employer": "Initech"})))
            .unwrap();
        assert_eq!(doc.records(SectionKind::Experience).len(), 1);
        assert_eq!(
            doc.record(SectionKind::Experience, "exp_a").unwrap()["employer"],
            "Initech"
        );
    }

    #[test]
    fn test_null_record_patch_deletes() {
        let mut doc = Document::empty("1.0.0");
        doc.apply(&patch("projects/p1", json!({"name": "ERP"})))
            .unwrap();
        doc.apply(&patch("projects/p1", Value::Null)).unwrap();
        assert!(doc.records(SectionKind::Projects).is_empty());
        assert_eq!(
            doc.apply(&patch("projects/p1", Value::Null)),
            Err(PatchError::RecordNotFound("projects/p1".parse().unwrap()))
        );
    }

    #[test]
    fn test_record_patch_rejects_scalar_content() {
        let mut doc = Document::empty("1.0.0");
        assert!(matches!(
            doc.apply(&patch("experience/e1", json!("text"))),
            Err(PatchError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_normalize_assigns_prefixed_ids() {
        let mut doc = Document::empty("1.0.0");
        doc.set_section(
            SectionKind::Certifications,
            json!([{"name": "Cert A", "issuer": "Issuer"}]),
        );
        assert!(doc.normalize());
        let id = record_id(&doc.records(SectionKind::Certifications)[0]).unwrap();
        assert!(id.starts_with("cert_"));
        assert!(!doc.normalize(), "second pass is a no-op");
    }

    #[test]
    fn test_collection_patch_gets_ids_once() {
        let mut p = patch(
            "experience",
            json!([{"employer": "A"}, {"id": "exp_keep", "employer": "B"}, "stray"]),
        );
        assert!(p.assign_record_ids());
        let records = p.content.as_array().unwrap();
        assert!(record_id(&records[0]).unwrap().starts_with("exp_"));
        assert_eq!(record_id(&records[1]), Some("exp_keep"));
        assert_eq!(records[2], json!("stray"));
        assert!(!p.assign_record_ids());

        let mut record = patch("experience/exp_1", json!({"employer": "A"}));
        assert!(!record.assign_record_ids());
        let mut profile = patch("profile", json!({"full_name": "T"}));
        assert!(!profile.assign_record_ids());
    }

    #[test]
    fn test_normalize_blank_notes_become_null() {
        let mut doc = Document::empty("1.0.0");
        doc.set_section(SectionKind::Profile, json!({"full_name": "T", "notes": "   "}));
        doc.normalize();
        assert_eq!(doc.section(SectionKind::Profile).unwrap()["notes"], Value::Null);
    }

    #[test]
    fn test_normalize_links_from_strings() {
        let mut doc = Document::empty("1.0.0");
        doc.set_section(
            SectionKind::Profile,
            json!({"full_name": "T", "links": [
                "https://github.com/someone",
                "Portfolio: example.dev",
                {"link": "https://www.linkedin.com/in/x"},
                ""
            ]}),
        );
        doc.normalize();
        assert_eq!(
            doc.section(SectionKind::Profile).unwrap()["links"],
            json!([
                {"name": "GitHub", "url": "https://github.com/someone"},
                {"name": "Portfolio", "url": "example.dev"},
                {"name": "LinkedIn", "url": "https://www.linkedin.com/in/x"}
            ])
        );
    }

    #[test]
    fn test_legacy_top_level_notes_merge_into_profile() {
        let mut doc = Document::empty("1.0.0");
        doc.set_section(SectionKind::Profile, json!({"full_name": "T", "notes": "Prefers Rust"}));
        let mut map = doc.as_map().clone();
        map.insert("notes".into(), json!("Open to relocation"));
        let mut doc = Document::from_value(Value::Object(map)).unwrap();
        assert!(doc.normalize());
        assert!(doc.as_map().get("notes").is_none());
        assert_eq!(
            doc.section(SectionKind::Profile).unwrap()["notes"],
            "Prefers Rust | Open to relocation"
        );
    }

    #[test]
    fn test_onboarding_flag_reads_metadata() {
        let mut doc = Document::empty("1.0.0");
        assert!(!doc.onboarding_complete());
        doc.set_section(SectionKind::Metadata, json!({"onboarding_complete": true}));
        assert!(doc.onboarding_complete());
    }
}
