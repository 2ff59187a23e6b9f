//! Consistency checks for products fused from several input acquisitions.
//!
//! Each derived granule is judged on its own: its manifest is fetched,
//! file-variants are collapsed into acquisitions, and every check runs
//! before the verdict is decided. Passing granules only show up in the
//! report counters.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cmr::MetadataSource;
use crate::domain::{GranuleRecord, ProductType};
use crate::error::AuditError;
use crate::finding::{CompositeEvidence, Evidence, Finding, FindingSet, Rule};
use crate::identity::{self, CanonicalIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValidatorConfig {
    /// Product family the manifest entries belong to.
    pub input_product: ProductType,
    pub max_time_span_minutes: f64,
}

impl ValidatorConfig {
    /// The threshold must be finite and non-negative.
    pub fn new(input_product: ProductType, max_time_span_minutes: f64) -> Result<Self, AuditError> {
        if !max_time_span_minutes.is_finite() || max_time_span_minutes < 0.0 {
            return Err(AuditError::InvalidTimeSpan(max_time_span_minutes));
        }
        Ok(Self {
            input_product,
            max_time_span_minutes,
        })
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            input_product: ProductType::RtcS1,
            max_time_span_minutes: 10.0,
        }
    }
}

/// One sensing event behind a composite, with every manifest entry that
/// normalized to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acquisition {
    pub identity: CanonicalIdentity,
    pub track: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub files: Vec<String>,
}

/// Manifest entries listed more than once, verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestWarning {
    pub concept_id: String,
    pub native_id: String,
    pub repeated_entries: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail(Finding),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Result of checking one manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestCheck {
    pub acquisitions: Vec<Acquisition>,
    pub warning: Option<ManifestWarning>,
    pub span_minutes: Option<f64>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpanStats {
    pub granules: usize,
    pub min_minutes: f64,
    pub mean_minutes: f64,
    pub max_minutes: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompositeReport {
    pub scanned: usize,
    pub passed: usize,
    pub failed: usize,
    pub missing_manifests: usize,
    pub warnings: Vec<ManifestWarning>,
    pub span: Option<SpanStats>,
    #[serde(skip)]
    findings: FindingSet,
}

impl CompositeReport {
    pub fn findings(&self) -> &FindingSet {
        &self.findings
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Collapses manifest entries into acquisitions keyed by canonical identity.
/// Entries that do not parse become their own pseudo-acquisition.
pub fn collapse_acquisitions(entries: &[String], product: ProductType) -> Vec<Acquisition> {
    let mut by_identity: BTreeMap<String, Acquisition> = BTreeMap::new();
    for entry in entries {
        let parsed = identity::parse(entry, product);
        let file = identity::file_name(entry).to_string();
        by_identity
            .entry(parsed.canonical.to_string())
            .or_insert_with(|| Acquisition {
                identity: parsed.canonical,
                track: parsed.track,
                acquired_at: parsed.acquired_at,
                files: Vec::new(),
            })
            .files
            .push(file);
    }
    by_identity.into_values().collect()
}

fn repeated_entries(entries: &[String]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in entries {
        *counts.entry(entry.as_str()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(entry, count)| (entry.to_string(), count))
        .collect()
}

fn span_minutes(min: DateTime<Utc>, max: DateTime<Utc>) -> f64 {
    (max - min).num_milliseconds() as f64 / 60_000.0
}

fn evidence_for(granule: &GranuleRecord) -> CompositeEvidence {
    CompositeEvidence {
        concept_id: granule.concept_id.clone(),
        temporal_start: granule.temporal_start,
        temporal_end: granule.temporal_end,
        bounding_box: granule.bounding_box,
        tracks: Vec::new(),
        acquisition_min: None,
        acquisition_max: None,
        span_minutes: None,
        acquisitions: Vec::new(),
    }
}

fn fail(
    granule: &GranuleRecord,
    rules: Vec<Rule>,
    reason: String,
    evidence: CompositeEvidence,
) -> Verdict {
    Verdict::Fail(Finding {
        subject: granule.native_id.clone(),
        rules,
        reason,
        evidence: Evidence::Composite(evidence),
    })
}

/// Runs every check against one derived granule's manifest. Never fails:
/// malformed manifests produce a `Fail` verdict with evidence.
pub fn check_manifest(
    granule: &GranuleRecord,
    manifest: Option<&[String]>,
    config: &ValidatorConfig,
) -> ManifestCheck {
    let entries = match manifest {
        Some(entries) if !entries.is_empty() => entries,
        _ => {
            return ManifestCheck {
                acquisitions: Vec::new(),
                warning: None,
                span_minutes: None,
                verdict: fail(
                    granule,
                    vec![Rule::MissingInputs],
                    Rule::MissingInputs.to_string(),
                    evidence_for(granule),
                ),
            };
        }
    };

    let repeated = repeated_entries(entries);
    let warning = (!repeated.is_empty()).then(|| ManifestWarning {
        concept_id: granule.concept_id.clone(),
        native_id: granule.native_id.clone(),
        repeated_entries: repeated,
    });

    let acquisitions = collapse_acquisitions(entries, config.input_product);
    let tracks: BTreeSet<&str> = acquisitions
        .iter()
        .filter_map(|acq| acq.track.as_deref())
        .collect();
    let acquisition_min = acquisitions.iter().filter_map(|acq| acq.acquired_at).min();
    let acquisition_max = acquisitions.iter().filter_map(|acq| acq.acquired_at).max();
    let span = acquisition_min
        .zip(acquisition_max)
        .map(|(min, max)| span_minutes(min, max));

    let mut rules = Vec::new();
    let mut reasons = Vec::new();
    if tracks.len() > 1 {
        rules.push(Rule::MixedTracks);
        reasons.push(Rule::MixedTracks.to_string());
    }
    if let Some(span) = span.filter(|span| *span > config.max_time_span_minutes) {
        rules.push(Rule::TimeSpanExceeded);
        reasons.push(format!(
            "time span {span:.2} exceeds {:.2}",
            config.max_time_span_minutes
        ));
    }
    let needs_track = config.input_product.carries_track();
    if acquisitions
        .iter()
        .any(|acq| acq.acquired_at.is_none() || (needs_track && acq.track.is_none()))
    {
        rules.push(Rule::UnparseableInputs);
        reasons.push(Rule::UnparseableInputs.to_string());
    }

    let verdict = if rules.is_empty() {
        Verdict::Pass
    } else {
        let evidence = CompositeEvidence {
            tracks: tracks.iter().map(|track| track.to_string()).collect(),
            acquisition_min,
            acquisition_max,
            span_minutes: span,
            acquisitions: acquisitions
                .iter()
                .map(|acq| acq.identity.to_string())
                .collect(),
            ..evidence_for(granule)
        };
        fail(granule, rules, reasons.join("; "), evidence)
    };

    ManifestCheck {
        acquisitions,
        warning,
        span_minutes: span,
        verdict,
    }
}

pub struct CompositeValidator<'a, S: MetadataSource + ?Sized> {
    source: &'a S,
    config: ValidatorConfig,
}

impl<'a, S: MetadataSource + ?Sized> CompositeValidator<'a, S> {
    pub fn new(source: &'a S, config: ValidatorConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Fetches the manifest of `granule` and checks it. Only service
    /// failures escape; a rejected or undecodable detail request becomes a
    /// failing verdict.
    pub fn validate_granule(&self, granule: &GranuleRecord) -> Result<ManifestCheck, AuditError> {
        let detail = match self.source.fetch_detail(&granule.concept_id) {
            Ok(detail) => detail,
            Err(err) if err.is_service_error() => return Err(err),
            Err(err) => {
                warn!(
                    concept_id = %granule.concept_id,
                    native_id = %granule.native_id,
                    error = %err,
                    "granule detail fetch failed"
                );
                return Ok(ManifestCheck {
                    acquisitions: Vec::new(),
                    warning: None,
                    span_minutes: None,
                    verdict: fail(
                        granule,
                        vec![Rule::DetailFetchFailed],
                        format!("{}: {err}", Rule::DetailFetchFailed),
                        evidence_for(granule),
                    ),
                });
            }
        };

        let check = check_manifest(granule, detail.input_manifest.as_deref(), &self.config);
        if let Some(warning) = &check.warning {
            warn!(
                concept_id = %warning.concept_id,
                native_id = %warning.native_id,
                repeated = ?warning.repeated_entries,
                "manifest lists identical entries more than once"
            );
        }
        debug!(
            native_id = %granule.native_id,
            acquisitions = check.acquisitions.len(),
            span_minutes = ?check.span_minutes,
            pass = check.verdict.is_pass(),
            "validated composite granule"
        );
        Ok(check)
    }

    /// Validates granules one at a time. A search error or an unreachable
    /// service aborts the batch.
    pub fn validate<I>(&self, granules: I) -> Result<CompositeReport, AuditError>
    where
        I: IntoIterator<Item = Result<GranuleRecord, AuditError>>,
    {
        let mut report = CompositeReport::default();
        let mut spans = Vec::new();
        for granule in granules {
            let granule = granule?;
            let check = self.validate_granule(&granule)?;
            report.scanned += 1;
            if let Some(span) = check.span_minutes {
                spans.push(span);
            }
            if let Some(warning) = check.warning {
                report.warnings.push(warning);
            }
            match check.verdict {
                Verdict::Pass => report.passed += 1,
                Verdict::Fail(finding) => {
                    if finding.has_rule(Rule::MissingInputs) {
                        report.missing_manifests += 1;
                    }
                    report.failed += 1;
                    report.findings.push(finding);
                }
            }
        }
        report.span = span_stats(&spans);

        info!(
            scanned = report.scanned,
            passed = report.passed,
            failed = report.failed,
            missing_manifests = report.missing_manifests,
            warnings = report.warnings.len(),
            "composite validation finished"
        );
        Ok(report)
    }
}

fn span_stats(spans: &[f64]) -> Option<SpanStats> {
    if spans.is_empty() {
        return None;
    }
    let min_minutes = spans.iter().copied().fold(f64::INFINITY, f64::min);
    let max_minutes = spans.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(SpanStats {
        granules: spans.len(),
        min_minutes,
        mean_minutes: spans.iter().sum::<f64>() / spans.len() as f64,
        max_minutes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_entries_counts_only_exact_repeats() {
        let entries = ["a.tif", "b.tif", "a.tif", "a.tif"]
            .map(String::from)
            .to_vec();
        let repeated = repeated_entries(&entries);
        assert_eq!(repeated.len(), 1);
        assert_eq!(repeated["a.tif"], 3);
    }

    #[test]
    fn span_stats_over_values() {
        let stats = span_stats(&[1.0, 3.0, 8.0]).unwrap();
        assert_eq!(stats.granules, 3);
        assert_eq!(stats.min_minutes, 1.0);
        assert_eq!(stats.max_minutes, 8.0);
        assert_eq!(stats.mean_minutes, 4.0);
        assert!(span_stats(&[]).is_none());
    }
}
