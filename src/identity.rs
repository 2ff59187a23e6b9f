//! Canonical identities for OPERA granule names.
//!
//! Every product family has one anchored pattern that recognises its native
//! identifiers and a canonical template built from the captures that define
//! the observation. Tokens that change on re-processing (creation timestamp,
//! product version) or per delivered file (band, polarization layer, mask,
//! container extension) are matched but left out of the template, so the
//! canonical form re-parses to itself.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Serialize, Serializer};

use crate::domain::ProductType;

pub const UNPARSED_PREFIX: &str = "UNPARSED::";

/// Per-file tail shared by OPERA products: an optional layer/variant token
/// followed by any number of extensions.
const OPERA_TAIL: &str = r"(?:_(?P<variant>[A-Za-z0-9][A-Za-z0-9_+\-]*))?(?:\.[A-Za-z0-9]+)*$";
const S1_BURST: &str = r"(?P<burst>T\d{3}-\d{6}-IW[1-3])";
const MGRS_TILE: &str = r"(?P<tile>T[0-9A-Za-z]{5})";
const POLARIZATION: &str = r"(?P<pol>VV\+VH|HH\+HV|VV|VH|HH|HV)";
const OPERA_TIME: &str = r"\d{8}T\d{6}Z";
const OPERA_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const HLS_TIME_FORMAT: &str = "%Y%jT%H%M%S";
const VALIDITY_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalIdentity {
    Parsed(String),
    /// The raw identifier, kept verbatim because it did not match its
    /// product pattern.
    Unparsed(String),
}

impl CanonicalIdentity {
    pub fn is_parsed(&self) -> bool {
        matches!(self, CanonicalIdentity::Parsed(_))
    }

    /// The canonical key, or the raw identifier for unparsed values.
    pub fn key(&self) -> &str {
        match self {
            CanonicalIdentity::Parsed(value) | CanonicalIdentity::Unparsed(value) => value,
        }
    }
}

impl fmt::Display for CanonicalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalIdentity::Parsed(value) => f.write_str(value),
            CanonicalIdentity::Unparsed(raw) => write!(f, "{UNPARSED_PREFIX}{raw}"),
        }
    }
}

impl Serialize for CanonicalIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Everything the analyses read out of one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedIdentity {
    pub product: ProductType,
    pub canonical: CanonicalIdentity,
    pub track: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub sensor: Option<String>,
}

struct ProductPattern {
    full: Regex,
    template: &'static str,
    timestamp: Regex,
    timestamp_format: &'static str,
    date_only: bool,
}

impl ProductPattern {
    fn new(
        full: String,
        template: &'static str,
        timestamp: &str,
        timestamp_format: &'static str,
    ) -> Self {
        Self {
            full: Regex::new(&full).expect("product pattern must compile"),
            template,
            timestamp: Regex::new(timestamp).expect("timestamp pattern must compile"),
            timestamp_format,
            date_only: timestamp_format == VALIDITY_FORMAT,
        }
    }
}

static PATTERNS: LazyLock<BTreeMap<ProductType, ProductPattern>> = LazyLock::new(|| {
    let opera_acquisition = format!("_({OPERA_TIME})");
    let static_validity = r"_(\d{8})_S1[A-D]";
    let mut patterns = BTreeMap::new();
    patterns.insert(
        ProductType::Hls,
        ProductPattern::new(
            format!(
                r"^(?P<id>HLS\.(?P<sensor>[SL]30)\.{MGRS_TILE}\.(?P<acq>\d{{7}}T\d{{6}}))(?:\.v\d+\.\d+)?(?:\.(?:B[A-Za-z0-9]{{2}}|Fmask|SAA|SZA|VAA|VZA)\.tif)?$"
            ),
            "${id}",
            r"\.(\d{7}T\d{6})(?:\.|$)",
            HLS_TIME_FORMAT,
        ),
    );
    patterns.insert(
        ProductType::RtcS1,
        ProductPattern::new(
            format!(
                r"^OPERA_L2_RTC-S1_{S1_BURST}_(?P<acq>{OPERA_TIME})(?:_(?P<created>{OPERA_TIME}))?_(?P<sensor>S1[A-D])(?:_30)?(?:_v\d+\.\d+)?{OPERA_TAIL}"
            ),
            "OPERA_L2_RTC-S1_${burst}_${acq}_${sensor}",
            &opera_acquisition,
            OPERA_TIME_FORMAT,
        ),
    );
    patterns.insert(
        ProductType::CslcS1,
        ProductPattern::new(
            format!(
                r"^OPERA_L2_CSLC-S1_{S1_BURST}_(?P<acq>{OPERA_TIME})(?:_(?P<created>{OPERA_TIME}))?_(?P<sensor>S1[A-D])_{POLARIZATION}(?:_v\d+\.\d+)?{OPERA_TAIL}"
            ),
            "OPERA_L2_CSLC-S1_${burst}_${acq}_${sensor}_${pol}",
            &opera_acquisition,
            OPERA_TIME_FORMAT,
        ),
    );
    patterns.insert(
        ProductType::DswxS1,
        ProductPattern::new(
            format!(
                r"^OPERA_L3_DSWx-S1_{MGRS_TILE}_(?P<acq>{OPERA_TIME})(?:_(?P<created>{OPERA_TIME}))?_(?P<sensor>S1[A-D])(?:_30)?(?:_v\d+\.\d+)?{OPERA_TAIL}"
            ),
            "OPERA_L3_DSWx-S1_${tile}_${acq}_${sensor}",
            &opera_acquisition,
            OPERA_TIME_FORMAT,
        ),
    );
    patterns.insert(
        ProductType::DswxHls,
        ProductPattern::new(
            format!(
                r"^OPERA_L3_DSWx-HLS_{MGRS_TILE}_(?P<acq>{OPERA_TIME})(?:_(?P<created>{OPERA_TIME}))?_(?P<sensor>S2[A-D]|L8|L9)(?:_30)?(?:_v\d+\.\d+)?{OPERA_TAIL}"
            ),
            "OPERA_L3_DSWx-HLS_${tile}_${acq}_${sensor}",
            &opera_acquisition,
            OPERA_TIME_FORMAT,
        ),
    );
    patterns.insert(
        ProductType::DispS1,
        ProductPattern::new(
            format!(
                r"^OPERA_L3_DISP-S1_IW_(?P<frame>F\d{{5}})_{POLARIZATION}_(?P<acq>{OPERA_TIME})_(?P<secondary>{OPERA_TIME})(?:_v\d+\.\d+)?(?:_(?P<created>{OPERA_TIME}))?{OPERA_TAIL}"
            ),
            "OPERA_L3_DISP-S1_IW_${frame}_${pol}_${acq}_${secondary}",
            &opera_acquisition,
            OPERA_TIME_FORMAT,
        ),
    );
    patterns.insert(
        ProductType::RtcS1Static,
        ProductPattern::new(
            format!(
                r"^OPERA_L2_RTC-S1-STATIC_{S1_BURST}_(?P<validity>\d{{8}})_(?P<sensor>S1[A-D])(?:_30)?(?:_v\d+\.\d+)?{OPERA_TAIL}"
            ),
            "OPERA_L2_RTC-S1-STATIC_${burst}_${validity}_${sensor}",
            static_validity,
            VALIDITY_FORMAT,
        ),
    );
    patterns.insert(
        ProductType::CslcS1Static,
        ProductPattern::new(
            format!(
                r"^OPERA_L2_CSLC-S1-STATIC_{S1_BURST}_(?P<validity>\d{{8}})_(?P<sensor>S1[A-D])(?:_v\d+\.\d+)?{OPERA_TAIL}"
            ),
            "OPERA_L2_CSLC-S1-STATIC_${burst}_${validity}_${sensor}",
            static_validity,
            VALIDITY_FORMAT,
        ),
    );
    patterns.insert(
        ProductType::DistAlertHls,
        ProductPattern::new(
            format!(
                r"^OPERA_L3_DIST-ALERT-HLS_{MGRS_TILE}_(?P<acq>{OPERA_TIME})(?:_(?P<created>{OPERA_TIME}))?_(?P<sensor>S2[A-D]|L8|L9)(?:_30)?(?:_v\d+(?:\.\d+)?)?{OPERA_TAIL}"
            ),
            "OPERA_L3_DIST-ALERT-HLS_${tile}_${acq}_${sensor}",
            &opera_acquisition,
            OPERA_TIME_FORMAT,
        ),
    );
    patterns.insert(
        ProductType::Tropo,
        ProductPattern::new(
            format!(
                r"^OPERA_L4_TROPO-ZENITH_(?P<acq>{OPERA_TIME})(?:_(?P<created>{OPERA_TIME}))?_(?P<model>[A-Za-z0-9\-]+)(?:_v\d+\.\d+)?(?:\.[A-Za-z0-9]+)*$"
            ),
            "OPERA_L4_TROPO-ZENITH_${acq}_${model}",
            &opera_acquisition,
            OPERA_TIME_FORMAT,
        ),
    );
    patterns
});

static TRACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_T(\d{3})-\d{6}-IW[1-3]_").expect("track pattern must compile"));

fn pattern(product: ProductType) -> &'static ProductPattern {
    &PATTERNS[&product]
}

/// Drops any URL or path prefix; manifests list S3 keys as often as names.
pub fn file_name(identifier: &str) -> &str {
    let trimmed = identifier.trim();
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

pub fn normalize(native_id: &str, product: ProductType) -> CanonicalIdentity {
    let name = file_name(native_id);
    if let Some(raw) = name.strip_prefix(UNPARSED_PREFIX) {
        return CanonicalIdentity::Unparsed(raw.to_string());
    }
    let pattern = pattern(product);
    match pattern.full.captures(name) {
        Some(captures) => {
            let mut canonical = String::new();
            captures.expand(pattern.template, &mut canonical);
            CanonicalIdentity::Parsed(canonical)
        }
        None => CanonicalIdentity::Unparsed(name.to_string()),
    }
}

/// Orbital track (`056` from `T056-118754-IW2`), for S1 burst products only.
pub fn extract_track(identifier: &str, product: ProductType) -> Option<String> {
    if !product.carries_track() {
        return None;
    }
    TRACK
        .captures(file_name(identifier))
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

/// First acquisition (or validity) timestamp encoded in the identifier.
pub fn extract_acquired_at(identifier: &str, product: ProductType) -> Option<DateTime<Utc>> {
    let pattern = pattern(product);
    let token = pattern
        .timestamp
        .captures(file_name(identifier))?
        .get(1)?
        .as_str();
    parse_token(token, pattern)
}

fn parse_token(token: &str, pattern: &ProductPattern) -> Option<DateTime<Utc>> {
    if pattern.date_only {
        return NaiveDate::parse_from_str(token, pattern.timestamp_format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc());
    }
    NaiveDateTime::parse_from_str(token, pattern.timestamp_format)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Normalizes and extracts the per-identity fields in one pass. Unparsed
/// identifiers report every field as absent.
pub fn parse(native_id: &str, product: ProductType) -> ParsedIdentity {
    let canonical = normalize(native_id, product);
    let CanonicalIdentity::Parsed(key) = &canonical else {
        return ParsedIdentity {
            product,
            canonical,
            track: None,
            acquired_at: None,
            created_at: None,
            sensor: None,
        };
    };

    let pattern = pattern(product);
    let captures = pattern.full.captures(file_name(native_id));
    let created_at = captures
        .as_ref()
        .and_then(|c| c.name("created"))
        .and_then(|m| parse_token(m.as_str(), pattern));
    let sensor = captures
        .as_ref()
        .and_then(|c| c.name("sensor"))
        .map(|m| m.as_str().to_string());

    ParsedIdentity {
        product,
        track: extract_track(key, product),
        acquired_at: extract_acquired_at(key, product),
        created_at,
        sensor,
        canonical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_product_has_a_compiled_pattern() {
        for product in ProductType::ALL {
            let _ = pattern(product);
        }
        assert_eq!(PATTERNS.len(), ProductType::ALL.len());
    }

    #[test]
    fn file_name_strips_urls() {
        assert_eq!(
            file_name("s3://bucket/prefix/HLS.S30.T10TEM.2026001T183821.v2.0.B02.tif"),
            "HLS.S30.T10TEM.2026001T183821.v2.0.B02.tif"
        );
        assert_eq!(file_name("plain"), "plain");
    }

    #[test]
    fn unparsed_marker_is_not_doubled() {
        let first = normalize("garbage", ProductType::RtcS1);
        let second = normalize(&first.to_string(), ProductType::RtcS1);
        assert_eq!(first, second);
        assert_eq!(second.to_string(), "UNPARSED::garbage");
    }
}
