use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::BoundingBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    DuplicateIdentity,
    MissingOutput,
    FanOut,
    MissingInputs,
    DetailFetchFailed,
    MixedTracks,
    TimeSpanExceeded,
    UnparseableInputs,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::DuplicateIdentity => "duplicate identity",
            Rule::MissingOutput => "missing output",
            Rule::FanOut => "fan-out",
            Rule::MissingInputs => "missing inputs",
            Rule::DetailFetchFailed => "detail fetch failed",
            Rule::MixedTracks => "mixed tracks",
            Rule::TimeSpanExceeded => "time span exceeded",
            Rule::UnparseableInputs => "unparseable inputs",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositeEvidence {
    pub concept_id: String,
    pub temporal_start: Option<DateTime<Utc>>,
    pub temporal_end: Option<DateTime<Utc>>,
    pub bounding_box: Option<BoundingBox>,
    pub tracks: Vec<String>,
    pub acquisition_min: Option<DateTime<Utc>>,
    pub acquisition_max: Option<DateTime<Utc>>,
    pub span_minutes: Option<f64>,
    /// Canonical acquisitions, unparsed entries carrying their marker.
    pub acquisitions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    Duplicate {
        identity: String,
        granules: Vec<String>,
        latest: Option<String>,
    },
    MissingOutput {
        identity: String,
        input_granules: Vec<String>,
    },
    FanOut {
        identity: String,
        outputs: Vec<String>,
    },
    Composite(CompositeEvidence),
}

/// One reported defect. Built once by an analysis and never changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub subject: String,
    pub rules: Vec<Rule>,
    pub reason: String,
    pub evidence: Evidence,
}

impl Finding {
    pub fn has_rule(&self, rule: Rule) -> bool {
        self.rules.contains(&rule)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FindingSummary {
    pub total: usize,
    pub by_rule: BTreeMap<Rule, usize>,
}

impl FindingSummary {
    pub fn is_clean(&self) -> bool {
        self.total == 0
    }
}

/// Append-only findings collection with running per-rule counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FindingSet {
    findings: Vec<Finding>,
    summary: FindingSummary,
}

impl FindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, finding: Finding) {
        self.summary.total += 1;
        for rule in &finding.rules {
            *self.summary.by_rule.entry(*rule).or_insert(0) += 1;
        }
        self.findings.push(finding);
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn count(&self, rule: Rule) -> usize {
        self.summary.by_rule.get(&rule).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> &FindingSummary {
        &self.summary
    }

    pub fn iter(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter()
    }

    pub fn as_slice(&self) -> &[Finding] {
        &self.findings
    }
}

impl Extend<Finding> for FindingSet {
    fn extend<T: IntoIterator<Item = Finding>>(&mut self, iter: T) {
        for finding in iter {
            self.push(finding);
        }
    }
}

impl FromIterator<Finding> for FindingSet {
    fn from_iter<T: IntoIterator<Item = Finding>>(iter: T) -> Self {
        let mut set = FindingSet::new();
        set.extend(iter);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing(identity: &str) -> Finding {
        Finding {
            subject: identity.to_string(),
            rules: vec![Rule::MissingOutput],
            reason: Rule::MissingOutput.to_string(),
            evidence: Evidence::MissingOutput {
                identity: identity.to_string(),
                input_granules: vec![identity.to_string()],
            },
        }
    }

    #[test]
    fn summary_tracks_pushes() {
        let mut set = FindingSet::new();
        assert!(set.summary().is_clean());
        set.push(missing("A"));
        set.push(missing("B"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.count(Rule::MissingOutput), 2);
        assert_eq!(set.count(Rule::FanOut), 0);
        assert!(!set.summary().is_clean());
    }

    #[test]
    fn serializes_rule_and_evidence_kind() {
        let json = serde_json::to_value(missing("A")).unwrap();
        assert_eq!(json["rules"][0], "missing_output");
        assert_eq!(json["evidence"]["kind"], "missing_output");
    }
}
