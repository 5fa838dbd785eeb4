//! Field tables for the career corpus schema.
//!
//! One table per section. Records of list sections and singleton sections
//! share the same shape: a flat object whose keys must all appear in the
//! table. Every section accepts an optional, content-only `notes` field.

use super::models::SectionKind;

/// Schema versions the validator knows how to check.
pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &["1.0.0"];

pub const DEFAULT_SCHEMA_VERSION: &str = "1.0.0";

/// Allowed values for `certifications[].status`.
pub const CERTIFICATION_STATUSES: &[&str] = &["active", "expired", "in_progress"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    /// `YYYY-MM` or `YYYY-MM-DD`.
    Date,
    /// Letters, digits, `_` and `-`.
    Identifier,
    Integer,
    Bool,
    StringList,
    /// List of `{name, url}` objects.
    LinkList,
    Enum(&'static [&'static str]),
}

impl FieldType {
    pub fn describe(&self) -> &'static str {
        match self {
            FieldType::String => "a string",
            FieldType::Date => "a date (YYYY-MM or YYYY-MM-DD)",
            FieldType::Identifier => "an identifier",
            FieldType::Integer => "an integer",
            FieldType::Bool => "a boolean",
            FieldType::StringList => "a list of strings",
            FieldType::LinkList => "a list of links",
            FieldType::Enum(_) => "one of the allowed values",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    pub nullable: bool,
}

const fn required(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required: true,
        nullable: false,
    }
}

const fn optional(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required: false,
        nullable: true,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Section tables
// ────────────────────────────────────────────────────────────────────────────

const PROFILE_FIELDS: &[FieldSpec] = &[
    required("full_name", FieldType::String),
    optional("headline", FieldType::String),
    optional("email", FieldType::String),
    optional("phone", FieldType::String),
    optional("location", FieldType::String),
    optional("links", FieldType::LinkList),
    optional("notes", FieldType::String),
];

const EXPERIENCE_FIELDS: &[FieldSpec] = &[
    required("id", FieldType::Identifier),
    required("employer", FieldType::String),
    required("title", FieldType::String),
    required("start_date", FieldType::Date),
    optional("end_date", FieldType::Date),
    optional("location", FieldType::String),
    optional("bullets", FieldType::StringList),
    optional("tools", FieldType::StringList),
    optional("outcomes", FieldType::StringList),
    optional("domain_tags", FieldType::StringList),
    optional("notes", FieldType::String),
];

const PROJECT_FIELDS: &[FieldSpec] = &[
    required("id", FieldType::Identifier),
    required("name", FieldType::String),
    optional("role", FieldType::String),
    optional("url", FieldType::String),
    optional("start_date", FieldType::Date),
    optional("end_date", FieldType::Date),
    optional("stack", FieldType::StringList),
    optional("outcomes", FieldType::StringList),
    optional("notes", FieldType::String),
];

const SKILLS_FIELDS: &[FieldSpec] = &[
    optional("technical", FieldType::StringList),
    optional("platforms", FieldType::StringList),
    optional("methods", FieldType::StringList),
    optional("domains", FieldType::StringList),
    optional("notes", FieldType::String),
];

const CERTIFICATION_FIELDS: &[FieldSpec] = &[
    required("id", FieldType::Identifier),
    required("name", FieldType::String),
    required("issuer", FieldType::String),
    optional("status", FieldType::Enum(CERTIFICATION_STATUSES)),
    optional("date_earned", FieldType::Date),
    optional("expires", FieldType::Date),
    optional("credential_id", FieldType::String),
    optional("notes", FieldType::String),
];

const EDUCATION_FIELDS: &[FieldSpec] = &[
    required("id", FieldType::Identifier),
    required("degree", FieldType::String),
    required("institution", FieldType::String),
    optional("field", FieldType::String),
    optional("graduation_year", FieldType::Integer),
    optional("notes", FieldType::String),
];

const METADATA_FIELDS: &[FieldSpec] = &[
    required("last_updated_utc", FieldType::String),
    optional("source", FieldType::String),
    optional("onboarding_complete", FieldType::Bool),
    optional("onboarding_completed_utc", FieldType::String),
    optional("notes", FieldType::String),
];

/// Fields of one record (list sections) or of the section object (singletons).
pub fn section_fields(kind: SectionKind) -> &'static [FieldSpec] {
    match kind {
        SectionKind::Profile => PROFILE_FIELDS,
        SectionKind::Experience => EXPERIENCE_FIELDS,
        SectionKind::Projects => PROJECT_FIELDS,
        SectionKind::Skills => SKILLS_FIELDS,
        SectionKind::Certifications => CERTIFICATION_FIELDS,
        SectionKind::Education => EDUCATION_FIELDS,
        SectionKind::Metadata => METADATA_FIELDS,
    }
}

pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_SCHEMA_VERSIONS.contains(&version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_section_accepts_notes() {
        for kind in SectionKind::ALL {
            assert!(
                section_fields(kind).iter().any(|f| f.name == "notes"),
                "{kind} has no notes field"
            );
        }
    }

    #[test]
    fn test_list_records_require_an_id() {
        for kind in SectionKind::ALL.iter().filter(|k| k.is_list()) {
            let id = section_fields(*kind).iter().find(|f| f.name == "id");
            assert!(matches!(id, Some(f) if f.required && f.ty == FieldType::Identifier));
        }
    }

    #[test]
    fn test_default_version_is_supported() {
        assert!(is_supported_version(DEFAULT_SCHEMA_VERSION));
        assert!(!is_supported_version("0.9.0"));
    }
}
