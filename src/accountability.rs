use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{GranuleRecord, Period, ProductType};
use crate::duplicates::UNKNOWN_PERIOD;
use crate::finding::{Evidence, Finding, FindingSet, Rule};
use crate::identity::{self, CanonicalIdentity};

/// Drops input granules flown on `platform`, optionally only those acquired
/// before `before`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformExclusion {
    pub platform: String,
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
}

impl PlatformExclusion {
    pub fn excludes(&self, granule: &GranuleRecord, acquired_at: Option<DateTime<Utc>>) -> bool {
        let on_platform = granule
            .platforms
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&self.platform));
        if !on_platform {
            return false;
        }
        match (self.before, granule.temporal_start.or(acquired_at)) {
            (None, _) => true,
            (Some(cutoff), Some(start)) => start < cutoff,
            (Some(_), None) => false,
        }
    }
}

/// How an output granule names the inputs it accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputLinkage {
    /// Outputs declare their inputs in `InputGranules`.
    Manifest,
    /// Outputs carry the input's identifier, normalized with the input pattern.
    SharedIdentity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiplicityPolicy {
    pub input_product: ProductType,
    pub linkage: OutputLinkage,
    pub exclusions: Vec<PlatformExclusion>,
    /// When false, an input accounted for by more than one output is a finding.
    pub allow_fan_out: bool,
}

impl MultiplicityPolicy {
    pub fn new(input_product: ProductType, linkage: OutputLinkage) -> Self {
        Self {
            input_product,
            linkage,
            exclusions: Vec::new(),
            allow_fan_out: true,
        }
    }

    /// HLS tiles to DSWx-HLS outputs. Landsat-9 scenes acquired before
    /// `landsat9_cutoff` were never processed.
    pub fn dswx_hls(landsat9_cutoff: Option<DateTime<Utc>>) -> Self {
        Self::new(ProductType::Hls, OutputLinkage::Manifest).with_exclusion(PlatformExclusion {
            platform: "LANDSAT-9".to_string(),
            before: landsat9_cutoff,
        })
    }

    pub fn with_exclusion(mut self, exclusion: PlatformExclusion) -> Self {
        self.exclusions.push(exclusion);
        self
    }

    pub fn strict(mut self) -> Self {
        self.allow_fan_out = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PeriodAccountability {
    pub expected: usize,
    pub matched: usize,
    pub missing: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountabilityReport {
    pub input_product: ProductType,
    pub expected_count: usize,
    pub matched_count: usize,
    pub missing: Vec<String>,
    pub filtered_out: usize,
    pub unparsed_inputs: usize,
    /// Outputs that account for none of the expected inputs.
    pub unlinked_outputs: usize,
    pub fan_out: BTreeMap<String, Vec<String>>,
    pub by_period: BTreeMap<String, PeriodAccountability>,
    #[serde(skip)]
    missing_sources: BTreeMap<String, Vec<String>>,
}

impl AccountabilityReport {
    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.fan_out.is_empty()
    }

    pub fn findings(&self) -> FindingSet {
        let missing = self.missing.iter().map(|identity| Finding {
            subject: identity.clone(),
            rules: vec![Rule::MissingOutput],
            reason: format!("no output accounts for input {identity}"),
            evidence: Evidence::MissingOutput {
                identity: identity.clone(),
                input_granules: self
                    .missing_sources
                    .get(identity)
                    .cloned()
                    .unwrap_or_default(),
            },
        });
        let fan_out = self.fan_out.iter().map(|(identity, outputs)| Finding {
            subject: identity.clone(),
            rules: vec![Rule::FanOut],
            reason: format!("input {identity} accounted for by {} outputs", outputs.len()),
            evidence: Evidence::FanOut {
                identity: identity.clone(),
                outputs: outputs.clone(),
            },
        });
        missing.chain(fan_out).collect()
    }
}

#[derive(Default)]
struct ExpectedInput {
    native_ids: Vec<String>,
    period: String,
}

#[derive(Debug, Clone)]
pub struct AccountabilityMapper {
    policy: MultiplicityPolicy,
    period: Period,
}

impl AccountabilityMapper {
    pub fn new(policy: MultiplicityPolicy, period: Period) -> Self {
        Self { policy, period }
    }

    pub fn policy(&self) -> &MultiplicityPolicy {
        &self.policy
    }

    pub fn map<I, O, G, H>(&self, input_granules: I, output_granules: O) -> AccountabilityReport
    where
        I: IntoIterator<Item = G>,
        G: Borrow<GranuleRecord>,
        O: IntoIterator<Item = H>,
        H: Borrow<GranuleRecord>,
    {
        let product = self.policy.input_product;
        let mut expected: BTreeMap<String, ExpectedInput> = BTreeMap::new();
        let mut filtered_out = 0usize;
        let mut unparsed_inputs = 0usize;

        for granule in input_granules {
            let granule = granule.borrow();
            let parsed = identity::parse(&granule.native_id, product);
            if self
                .policy
                .exclusions
                .iter()
                .any(|rule| rule.excludes(granule, parsed.acquired_at))
            {
                debug!(native_id = %granule.native_id, "input excluded by platform policy");
                filtered_out += 1;
                continue;
            }
            if !parsed.canonical.is_parsed() {
                unparsed_inputs += 1;
            }
            let period = granule
                .temporal_start
                .or(parsed.acquired_at)
                .map(|ts| self.period.label(&ts))
                .unwrap_or_else(|| UNKNOWN_PERIOD.to_string());
            let entry = expected
                .entry(parsed.canonical.to_string())
                .or_insert_with(|| ExpectedInput {
                    native_ids: Vec::new(),
                    period,
                });
            entry.native_ids.push(granule.native_id.clone());
        }

        let mut coverage: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut unlinked_outputs = 0usize;
        for output in output_granules {
            let output = output.borrow();
            let covered = self.covered_inputs(output);
            if !covered.iter().any(|id| expected.contains_key(id)) {
                unlinked_outputs += 1;
            }
            for id in covered {
                coverage
                    .entry(id)
                    .or_default()
                    .insert(output.native_id.clone());
            }
        }

        let mut missing = Vec::new();
        let mut missing_sources = BTreeMap::new();
        let mut fan_out = BTreeMap::new();
        let mut by_period: BTreeMap<String, PeriodAccountability> = BTreeMap::new();
        for (id, input) in expected.iter_mut() {
            let bucket = by_period.entry(input.period.clone()).or_default();
            bucket.expected += 1;
            match coverage.get(id) {
                Some(outputs) if !outputs.is_empty() => {
                    bucket.matched += 1;
                    if !self.policy.allow_fan_out && outputs.len() > 1 {
                        fan_out.insert(id.clone(), outputs.iter().cloned().collect());
                    }
                }
                _ => {
                    bucket.missing += 1;
                    missing.push(id.clone());
                    input.native_ids.sort();
                    missing_sources.insert(id.clone(), std::mem::take(&mut input.native_ids));
                }
            }
        }

        let expected_count = expected.len();
        let matched_count = expected_count - missing.len();
        info!(
            product = %product,
            expected_count,
            matched_count,
            missing = missing.len(),
            filtered_out,
            "accountability mapping finished"
        );

        AccountabilityReport {
            input_product: product,
            expected_count,
            matched_count,
            missing,
            filtered_out,
            unparsed_inputs,
            unlinked_outputs,
            fan_out,
            by_period,
            missing_sources,
        }
    }

    fn covered_inputs(&self, output: &GranuleRecord) -> BTreeSet<String> {
        let product = self.policy.input_product;
        let candidates: Box<dyn Iterator<Item = &String>> = match self.policy.linkage {
            OutputLinkage::Manifest => Box::new(output.input_granules.iter()),
            OutputLinkage::SharedIdentity => Box::new(std::iter::once(&output.native_id)),
        };
        candidates
            .map(|name| identity::normalize(name, product))
            .filter(CanonicalIdentity::is_parsed)
            .map(|canonical| canonical.to_string())
            .collect()
    }
}

/// Day-bucketed mapping under `policy`.
pub fn map_accountability<I, O, G, H>(
    input_granules: I,
    output_granules: O,
    policy: &MultiplicityPolicy,
) -> AccountabilityReport
where
    I: IntoIterator<Item = G>,
    G: Borrow<GranuleRecord>,
    O: IntoIterator<Item = H>,
    H: Borrow<GranuleRecord>,
{
    AccountabilityMapper::new(policy.clone(), Period::Day).map(input_granules, output_granules)
}
