use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{GranuleRecord, Period, ProductType};
use crate::finding::{Evidence, Finding, FindingSet, Rule};
use crate::identity;

pub const UNKNOWN_PERIOD: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PeriodCounts {
    pub total: usize,
    pub unique: usize,
    pub duplicate_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    /// Colliding native ids, sorted.
    pub granules: Vec<String>,
    /// Most recently produced granule by creation timestamp, when encoded.
    pub latest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateReport {
    pub product: ProductType,
    pub total: usize,
    pub unique: usize,
    pub duplicate_count: usize,
    pub unparsed: usize,
    pub duplicate_identities: Vec<String>,
    pub collisions: BTreeMap<String, Collision>,
    pub by_period: BTreeMap<String, PeriodCounts>,
}

impl DuplicateReport {
    pub fn has_duplicates(&self) -> bool {
        !self.duplicate_identities.is_empty()
    }

    pub fn findings(&self) -> FindingSet {
        self.collisions
            .iter()
            .map(|(identity, collision)| Finding {
                subject: identity.clone(),
                rules: vec![Rule::DuplicateIdentity],
                reason: format!(
                    "{} granules share canonical identity",
                    collision.granules.len()
                ),
                evidence: Evidence::Duplicate {
                    identity: identity.clone(),
                    granules: collision.granules.clone(),
                    latest: collision.latest.clone(),
                },
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DuplicateDetector {
    product: ProductType,
    period: Period,
}

impl DuplicateDetector {
    pub fn new(product: ProductType, period: Period) -> Self {
        Self { product, period }
    }

    pub fn detect<I, G>(&self, granules: I) -> DuplicateReport
    where
        I: IntoIterator<Item = G>,
        G: Borrow<GranuleRecord>,
    {
        let mut groups: BTreeMap<String, Vec<(String, Option<DateTime<Utc>>)>> = BTreeMap::new();
        let mut periods: BTreeMap<String, (usize, BTreeSet<String>)> = BTreeMap::new();
        let mut total = 0usize;
        let mut unparsed = 0usize;

        for granule in granules {
            let granule = granule.borrow();
            total += 1;
            let parsed = identity::parse(&granule.native_id, self.product);
            if !parsed.canonical.is_parsed() {
                unparsed += 1;
                debug!(
                    native_id = %granule.native_id,
                    product = %self.product,
                    "granule id did not match product pattern"
                );
            }
            let key = parsed.canonical.to_string();

            let label = granule
                .temporal_start
                .or(parsed.acquired_at)
                .map(|ts| self.period.label(&ts))
                .unwrap_or_else(|| UNKNOWN_PERIOD.to_string());
            let bucket = periods.entry(label).or_default();
            bucket.0 += 1;
            bucket.1.insert(key.clone());

            groups
                .entry(key)
                .or_default()
                .push((granule.native_id.clone(), parsed.created_at));
        }

        let unique = groups.len();
        let mut collisions = BTreeMap::new();
        for (key, members) in groups {
            if members.len() < 2 {
                continue;
            }
            let latest = members
                .iter()
                .filter_map(|(id, created)| created.map(|ts| (ts, id)))
                .max()
                .map(|(_, id)| id.clone());
            let mut granules = members.into_iter().map(|(id, _)| id).collect::<Vec<_>>();
            granules.sort();
            collisions.insert(key, Collision { granules, latest });
        }

        let by_period = periods
            .into_iter()
            .map(|(label, (count, keys))| {
                let counts = PeriodCounts {
                    total: count,
                    unique: keys.len(),
                    duplicate_count: count - keys.len(),
                };
                (label, counts)
            })
            .collect();

        if unparsed > 0 {
            warn!(
                product = %self.product,
                unparsed,
                "granule ids did not match the product pattern"
            );
        }
        let duplicate_count = total - unique;
        if total > 0 {
            info!(
                product = %self.product,
                total,
                unique,
                duplicate_count,
                rate = %format!("{:.2}%", duplicate_count as f64 / total as f64 * 100.0),
                "duplicate detection finished"
            );
        }

        DuplicateReport {
            product: self.product,
            total,
            unique,
            duplicate_count,
            unparsed,
            duplicate_identities: collisions.keys().cloned().collect(),
            collisions,
            by_period,
        }
    }
}

/// Day-bucketed detection.
pub fn detect<I, G>(granules: I, product: ProductType) -> DuplicateReport
where
    I: IntoIterator<Item = G>,
    G: Borrow<GranuleRecord>,
{
    DuplicateDetector::new(product, Period::Day).detect(granules)
}
