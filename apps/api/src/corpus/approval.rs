use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::SectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub approved: bool,
    pub approved_at: Option<DateTime<Utc>>,
}

/// Section id → approval, as seen at the moment a write starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalRecord(BTreeMap<SectionId, Approval>);

impl ApprovalRecord {
    pub fn get(&self, section: &SectionId) -> Option<&Approval> {
        self.0.get(section)
    }

    pub fn is_approved(&self, section: &SectionId) -> bool {
        self.0.get(section).is_some_and(|a| a.approved)
    }

    pub fn approved_set(&self) -> BTreeSet<SectionId> {
        self.0
            .iter()
            .filter(|(_, a)| a.approved)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Targets that lack an explicit approval, in id order.
    pub fn unapproved<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a SectionId>,
    ) -> Vec<SectionId> {
        targets
            .into_iter()
            .filter(|t| !self.is_approved(t))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SectionId, &Approval)> {
        self.0.iter()
    }
}

/// Session-scoped record of which sections a person explicitly approved.
///
/// Matching is exact: approving `experience` says nothing about
/// `experience/exp_1`. Approval is dropped when the section's draft changes,
/// so an approval always refers to the content that was on screen.
#[derive(Debug, Clone, Default)]
pub struct SectionApprovalGate {
    record: ApprovalRecord,
}

impl SectionApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approve(&mut self, section: SectionId) {
        self.approve_at(section, Utc::now());
    }

    pub fn approve_at(&mut self, section: SectionId, at: DateTime<Utc>) {
        self.record.0.insert(
            section,
            Approval {
                approved: true,
                approved_at: Some(at),
            },
        );
    }

    /// Returns true when an approval was withdrawn.
    pub fn revoke(&mut self, section: &SectionId) -> bool {
        match self.record.0.get_mut(section) {
            Some(approval) if approval.approved => {
                approval.approved = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_approved(&self, section: &SectionId) -> bool {
        self.record.is_approved(section)
    }

    pub fn approved_set(&self) -> BTreeSet<SectionId> {
        self.record.approved_set()
    }

    /// Snapshot handed to a write transaction.
    pub fn record(&self) -> ApprovalRecord {
        self.record.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SectionId {
        s.parse().unwrap()
    }

    #[test]
    fn test_approve_and_query() {
        let mut gate = SectionApprovalGate::new();
        assert!(!gate.is_approved(&id("profile")));
        gate.approve(id("profile"));
        assert!(gate.is_approved(&id("profile")));
        assert_eq!(gate.approved_set(), BTreeSet::from([id("profile")]));
        assert!(gate.record().get(&id("profile")).unwrap().approved_at.is_some());
    }

    #[test]
    fn test_no_propagation_between_collection_and_records() {
        let mut gate = SectionApprovalGate::new();
        gate.approve(id("experience"));
        assert!(!gate.is_approved(&id("experience/exp_1")));

        let mut gate = SectionApprovalGate::new();
        gate.approve(id("experience/exp_1"));
        assert!(!gate.is_approved(&id("experience")));
    }

    #[test]
    fn test_revoke_keeps_entry_but_not_approval() {
        let mut gate = SectionApprovalGate::new();
        gate.approve(id("skills"));
        assert!(gate.revoke(&id("skills")));
        assert!(!gate.revoke(&id("skills")));
        assert!(!gate.is_approved(&id("skills")));
        assert!(gate.record().get(&id("skills")).is_some());
        assert!(gate.approved_set().is_empty());
    }

    #[test]
    fn test_unapproved_targets() {
        let mut gate = SectionApprovalGate::new();
        gate.approve(id("profile"));
        gate.approve(id("experience"));
        let targets = [id("certifications"), id("profile")];
        assert_eq!(gate.record().unapproved(&targets), vec![id("certifications")]);
    }

    #[test]
    fn test_record_serializes_by_section_string() {
        let mut gate = SectionApprovalGate::new();
        gate.approve(id("projects/proj_1"));
        let json = serde_json::to_value(gate.record()).unwrap();
        assert_eq!(json["projects/proj_1"]["approved"], true);
    }
}
