use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cmr::{ClientConfig, MAX_PAGE_SIZE, Pagination, RetryPolicy};
use crate::composite::ValidatorConfig;
use crate::domain::{BoundingBox, CollectionId, ProductType, Venue};
use crate::error::AuditError;

pub const DEFAULT_CONFIG_FILE: &str = "opera-audit.json";
pub const PROD_CMR_URL: &str = "https://cmr.earthdata.nasa.gov";
pub const UAT_CMR_URL: &str = "https://cmr.uat.earthdata.nasa.gov";
pub const DEFAULT_COMPOSITE_BBOX: &str = "-180,60,180,90";
pub const DEFAULT_LANDSAT9_CUTOFF: &str = "2025-10-01T00:04:07.135Z";

const DEFAULT_COLLECTIONS: &[(ProductType, &[&str], &[&str])] = &[
    (
        ProductType::Hls,
        &["C2021957295-LPCLOUD", "C2021957657-LPCLOUD"],
        &[],
    ),
    (ProductType::DswxHls, &["C2617126679-POCLOUD"], &[]),
    (ProductType::RtcS1, &["C2777436413-ASF"], &["C1259974840-ASF"]),
    (ProductType::CslcS1, &["C2777443834-ASF"], &[]),
    (ProductType::DswxS1, &["C2949811996-POCLOUD"], &[]),
    (ProductType::DispS1, &["C3294057315-ASF"], &[]),
    (ProductType::RtcS1Static, &["C2795135174-ASF"], &[]),
    (ProductType::CslcS1Static, &["C2795135668-ASF"], &[]),
    (ProductType::DistAlertHls, &["C2746980408-LPCLOUD"], &[]),
    (ProductType::Tropo, &["C3717139408-ASF"], &[]),
];

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub cmr: CmrSection,
    #[serde(default)]
    pub products: BTreeMap<String, CollectionEntry>,
    #[serde(default)]
    pub composite: CompositeSection,
    #[serde(default)]
    pub accountability: AccountabilitySection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CmrSection {
    #[serde(default)]
    pub prod_url: Option<String>,
    #[serde(default)]
    pub uat_url: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub throttle_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetrySection {
    #[serde(default)]
    pub max_attempts: Option<usize>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

/// A product's collections: a bare id or list means PROD only.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CollectionEntry {
    Shorthand(CollectionIds),
    Detailed(CollectionEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CollectionIds {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CollectionEntryObject {
    #[serde(default)]
    pub prod: Option<CollectionIds>,
    #[serde(default)]
    pub uat: Option<CollectionIds>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CompositeSection {
    #[serde(default)]
    pub max_time_span_minutes: Option<f64>,
    #[serde(default)]
    pub bounding_box: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AccountabilitySection {
    #[serde(default)]
    pub landsat9_cutoff: Option<String>,
    #[serde(default)]
    pub allow_fan_out: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CmrSettings {
    pub prod_url: String,
    pub uat_url: String,
    pub page_size: usize,
    pub max_pages: usize,
    pub timeout: Duration,
    pub throttle: Duration,
    pub retry: RetryPolicy,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VenueCollections {
    pub prod: Vec<CollectionId>,
    pub uat: Vec<CollectionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeSettings {
    pub max_time_span_minutes: f64,
    pub bounding_box: BoundingBox,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountabilitySettings {
    pub landsat9_cutoff: DateTime<Utc>,
    pub allow_fan_out: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub cmr: CmrSettings,
    pub collections: BTreeMap<ProductType, VenueCollections>,
    pub composite: CompositeSettings,
    pub accountability: AccountabilitySettings,
}

impl ResolvedConfig {
    pub fn base_url(&self, venue: Venue) -> &str {
        match venue {
            Venue::Prod => &self.cmr.prod_url,
            Venue::Uat => &self.cmr.uat_url,
        }
    }

    pub fn client_config(&self, venue: Venue) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url(venue).to_string(),
            timeout: self.cmr.timeout,
            throttle: self.cmr.throttle,
            retry: self.cmr.retry,
            pagination: self.cmr.pagination,
        }
    }

    /// Every collection holding `product` in `venue`; never empty.
    pub fn collections(
        &self,
        product: ProductType,
        venue: Venue,
    ) -> Result<&[CollectionId], AuditError> {
        let ids = self.collections.get(&product).map(|entry| match venue {
            Venue::Prod => entry.prod.as_slice(),
            Venue::Uat => entry.uat.as_slice(),
        });
        match ids {
            Some(ids) if !ids.is_empty() => Ok(ids),
            _ => Err(AuditError::MissingCollection {
                product: product.to_string(),
                venue: venue.to_string(),
            }),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `opera-audit.json` when present. Without either the
    /// built-in defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, AuditError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if !config_path.exists() {
            if path.is_some() {
                return Err(AuditError::MissingConfig(config_path));
            }
            return Self::defaults();
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| AuditError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| AuditError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn defaults() -> Result<ResolvedConfig, AuditError> {
        Self::resolve_config(Config::default())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, AuditError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let cmr = config.cmr;
        let page_size = cmr.page_size.unwrap_or(MAX_PAGE_SIZE);
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(AuditError::InvalidPageSize(page_size));
        }
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: cmr.retry.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: cmr
                .retry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: cmr
                .retry
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        };
        let cmr = CmrSettings {
            prod_url: cmr.prod_url.unwrap_or_else(|| PROD_CMR_URL.to_string()),
            uat_url: cmr.uat_url.unwrap_or_else(|| UAT_CMR_URL.to_string()),
            page_size,
            max_pages: cmr.max_pages.unwrap_or(50),
            timeout: Duration::from_secs(cmr.timeout_secs.unwrap_or(60)),
            throttle: Duration::from_millis(cmr.throttle_ms.unwrap_or(0)),
            retry,
            pagination: cmr.pagination.unwrap_or_default(),
        };

        let mut collections = default_collections()?;
        for (product, entry) in config.products {
            let product: ProductType = product.parse()?;
            let resolved = match entry {
                CollectionEntry::Shorthand(ids) => VenueCollections {
                    prod: parse_ids(ids)?,
                    uat: Vec::new(),
                },
                CollectionEntry::Detailed(obj) => VenueCollections {
                    prod: obj.prod.map(parse_ids).transpose()?.unwrap_or_default(),
                    uat: obj.uat.map(parse_ids).transpose()?.unwrap_or_default(),
                },
            };
            collections.insert(product, resolved);
        }

        let composite = CompositeSettings {
            max_time_span_minutes: config.composite.max_time_span_minutes.unwrap_or(10.0),
            bounding_box: config
                .composite
                .bounding_box
                .as_deref()
                .unwrap_or(DEFAULT_COMPOSITE_BBOX)
                .parse()?,
        };
        ValidatorConfig::new(ProductType::RtcS1, composite.max_time_span_minutes)
            .map_err(|err| AuditError::ConfigParse(err.to_string()))?;

        let cutoff = config
            .accountability
            .landsat9_cutoff
            .as_deref()
            .unwrap_or(DEFAULT_LANDSAT9_CUTOFF);
        let accountability = AccountabilitySettings {
            landsat9_cutoff: DateTime::parse_from_rfc3339(cutoff)
                .map(|value| value.with_timezone(&Utc))
                .map_err(|err| {
                    AuditError::ConfigParse(format!("landsat9_cutoff {cutoff:?}: {err}"))
                })?,
            allow_fan_out: config.accountability.allow_fan_out.unwrap_or(true),
        };

        Ok(ResolvedConfig {
            schema_version,
            cmr,
            collections,
            composite,
            accountability,
        })
    }
}

fn parse_ids(ids: CollectionIds) -> Result<Vec<CollectionId>, AuditError> {
    match ids {
        CollectionIds::One(id) => Ok(vec![id.parse()?]),
        CollectionIds::Many(ids) => ids.iter().map(|id| id.parse()).collect(),
    }
}

pub fn default_collections() -> Result<BTreeMap<ProductType, VenueCollections>, AuditError> {
    DEFAULT_COLLECTIONS
        .iter()
        .map(|(product, prod, uat)| {
            let parse = |ids: &[&str]| {
                ids.iter()
                    .map(|id| id.parse())
                    .collect::<Result<Vec<CollectionId>, AuditError>>()
            };
            Ok((
                *product,
                VenueCollections {
                    prod: parse(*prod)?,
                    uat: parse(*uat)?,
                },
            ))
        })
        .collect()
}
