//! Shared test documents.

use serde_json::json;

use super::models::Document;

/// A complete, schema-valid corpus with one record in every list section.
pub fn valid_document() -> Document {
    Document::from_value(json!({
        "schema_version": "1.0.0",
        "profile": {"full_name": "Test User", "headline": "Engineer", "links": []},
        "experience": [{
            "id": "exp_1",
            "employer": "Example Co",
            "title": "Engineer",
            "start_date": "2020-01",
            "end_date": null,
            "location": "Remote",
            "bullets": ["Built systems"],
            "tools": ["Rust"],
            "outcomes": ["Improved latency by 30%"],
            "domain_tags": ["platform"]
        }],
        "projects": [{"id": "proj_1", "name": "Project A", "role": "Lead", "stack": ["Rust"], "outcomes": []}],
        "skills": {"technical": ["Rust"], "platforms": ["AWS"], "methods": ["Agile"], "domains": ["ERP"]},
        "certifications": [{"id": "cert_1", "name": "Cert A", "issuer": "Issuer", "status": "active"}],
        "education": [{"id": "edu_1", "degree": "BS", "institution": "Uni", "graduation_year": 2018}],
        "metadata": {"last_updated_utc": "2026-01-01T00:00:00Z", "source": "unit"}
    }))
    .expect("fixture is an object")
}
