use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AuditError;

/// OPERA (and OPERA-input) product families the normalizer understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    Hls,
    RtcS1,
    CslcS1,
    DswxS1,
    DswxHls,
    DispS1,
    RtcS1Static,
    CslcS1Static,
    DistAlertHls,
    Tropo,
}

impl ProductType {
    pub const ALL: [ProductType; 10] = [
        ProductType::Hls,
        ProductType::RtcS1,
        ProductType::CslcS1,
        ProductType::DswxS1,
        ProductType::DswxHls,
        ProductType::DispS1,
        ProductType::RtcS1Static,
        ProductType::CslcS1Static,
        ProductType::DistAlertHls,
        ProductType::Tropo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Hls => "HLS",
            ProductType::RtcS1 => "RTC_S1",
            ProductType::CslcS1 => "CSLC_S1",
            ProductType::DswxS1 => "DSWX_S1",
            ProductType::DswxHls => "DSWX_HLS",
            ProductType::DispS1 => "DISP_S1",
            ProductType::RtcS1Static => "RTC_S1_STATIC",
            ProductType::CslcS1Static => "CSLC_S1_STATIC",
            ProductType::DistAlertHls => "DIST_ALERT_HLS",
            ProductType::Tropo => "TROPO",
        }
    }

    /// Sentinel-1 derived products encode the orbital track in the burst id.
    pub fn carries_track(&self) -> bool {
        matches!(
            self,
            ProductType::RtcS1
                | ProductType::CslcS1
                | ProductType::RtcS1Static
                | ProductType::CslcS1Static
        )
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductType {
    type Err = AuditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase().replace('-', "_");
        ProductType::ALL
            .into_iter()
            .find(|product| product.as_str() == normalized)
            .ok_or_else(|| AuditError::InvalidProductType(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum Venue {
    Prod,
    Uat,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Prod => write!(f, "PROD"),
            Venue::Uat => write!(f, "UAT"),
        }
    }
}

impl FromStr for Venue {
    type Err = AuditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "PROD" | "OPS" => Ok(Venue::Prod),
            "UAT" => Ok(Venue::Uat),
            _ => Err(AuditError::InvalidVenue(value.to_string())),
        }
    }
}

/// Bucket width used for per-period breakdowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hour,
    #[default]
    Day,
    Month,
    Year,
}

impl Period {
    pub fn label(&self, timestamp: &DateTime<Utc>) -> String {
        let format = match self {
            Period::Hour => "%Y-%m-%dT%H",
            Period::Day => "%Y-%m-%d",
            Period::Month => "%Y-%m",
            Period::Year => "%Y",
        };
        timestamp.format(format).to_string()
    }
}

impl FromStr for Period {
    type Err = AuditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "hour" => Ok(Period::Hour),
            "day" => Ok(Period::Day),
            "month" => Ok(Period::Month),
            "year" => Ok(Period::Year),
            _ => Err(AuditError::InvalidPeriod(value.to_string())),
        }
    }
}

/// Closed UTC interval sent to CMR as `temporal=start,end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TemporalRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TemporalRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AuditError> {
        if start > end {
            return Err(AuditError::InvalidTemporalRange(format!(
                "start {} is after end {}",
                format_cmr_time(&start),
                format_cmr_time(&end)
            )));
        }
        Ok(Self { start, end })
    }

    /// The `days` days ending at `end`.
    pub fn last_days(end: DateTime<Utc>, days: u32) -> Result<Self, AuditError> {
        let start = Duration::try_days(i64::from(days))
            .and_then(|span| end.checked_sub_signed(span))
            .ok_or_else(|| {
                AuditError::InvalidTemporalRange(format!(
                    "{days} days before {} is out of range",
                    format_cmr_time(&end)
                ))
            })?;
        Self::new(start, end)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn to_cmr_param(&self) -> String {
        format!(
            "{},{}",
            format_cmr_time(&self.start),
            format_cmr_time(&self.end)
        )
    }
}

impl fmt::Display for TemporalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cmr_param())
    }
}

impl FromStr for TemporalRange {
    type Err = AuditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (start, end) = value
            .split_once(',')
            .ok_or_else(|| AuditError::InvalidTemporalRange(value.to_string()))?;
        let start = parse_range_bound(start, false)
            .ok_or_else(|| AuditError::InvalidTemporalRange(value.to_string()))?;
        let end = parse_range_bound(end, true)
            .ok_or_else(|| AuditError::InvalidTemporalRange(value.to_string()))?;
        Self::new(start, end)
    }
}

/// Accepts RFC 3339 timestamps or bare `YYYY-MM-DD` dates. A bare end date
/// covers the whole day.
pub fn parse_range_bound(value: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Some(parsed) = parse_utc_timestamp(value) {
        return Some(parsed);
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        NaiveTime::from_hms_opt(23, 59, 59)?
    } else {
        NaiveTime::MIN
    };
    Some(NaiveDateTime::new(date, time).and_utc())
}

/// Parses CMR temporal values (`2026-01-01T18:38:21.000Z`, `+00:00` offsets,
/// or offset-less) and truncates to whole seconds.
pub fn parse_utc_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let parsed = DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })?;
    Some(truncate_to_second(parsed))
}

pub fn truncate_to_second(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(value.timestamp(), 0).unwrap_or(value)
}

pub fn format_cmr_time(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Spatial filter in CMR's `W,S,E,N` order. `west > east` crosses the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self, AuditError> {
        let lon_ok = |v: f64| (-180.0..=180.0).contains(&v);
        let lat_ok = |v: f64| (-90.0..=90.0).contains(&v);
        if !lon_ok(west) || !lon_ok(east) || !lat_ok(south) || !lat_ok(north) || south > north {
            return Err(AuditError::InvalidBoundingBox(format!(
                "{west},{south},{east},{north}"
            )));
        }
        Ok(Self {
            west,
            south,
            east,
            north,
        })
    }

    pub fn to_cmr_param(&self) -> String {
        format!("{},{},{},{}", self.west, self.south, self.east, self.north)
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cmr_param())
    }
}

impl FromStr for BoundingBox {
    type Err = AuditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| AuditError::InvalidBoundingBox(value.to_string()))?;
        match parts.as_slice() {
            [west, south, east, north] => Self::new(*west, *south, *east, *north),
            _ => Err(AuditError::InvalidBoundingBox(value.to_string())),
        }
    }
}

/// CMR collection concept id, e.g. `C2949811996-POCLOUD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CollectionId {
    type Err = AuditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let (number, provider) = normalized
            .strip_prefix('C')
            .and_then(|rest| rest.split_once('-'))
            .ok_or_else(|| AuditError::InvalidCollectionId(value.to_string()))?;
        let is_valid = !number.is_empty()
            && number.chars().all(|ch| ch.is_ascii_digit())
            && !provider.is_empty()
            && provider
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if !is_valid {
            return Err(AuditError::InvalidCollectionId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// One entry of a collection search page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GranuleRecord {
    pub native_id: String,
    pub concept_id: String,
    pub temporal_start: Option<DateTime<Utc>>,
    pub temporal_end: Option<DateTime<Utc>>,
    pub bounding_box: Option<BoundingBox>,
    pub platforms: Vec<String>,
    pub input_granules: Vec<String>,
}

impl GranuleRecord {
    /// Bare record for callers that only know the identifier.
    pub fn named(native_id: impl Into<String>) -> Self {
        let native_id = native_id.into();
        Self {
            concept_id: String::new(),
            native_id,
            temporal_start: None,
            temporal_end: None,
            bounding_box: None,
            platforms: Vec::new(),
            input_granules: Vec::new(),
        }
    }
}

/// Per-concept metadata. `input_manifest` is `None` when the field is absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GranuleDetail {
    pub concept_id: String,
    pub native_id: Option<String>,
    pub input_manifest: Option<Vec<String>>,
}

/// Flattens an `InputGranules` array whose items are plain strings or
/// objects carrying a `GranuleUR`/`name` field.
pub fn flatten_manifest(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    Some(items.iter().map(manifest_entry_name).collect())
}

fn manifest_entry_name(item: &Value) -> String {
    match item {
        Value::String(name) => name.clone(),
        Value::Object(map) => ["GranuleUR", "name", "Name"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .map(|name| name.to_string())
            .unwrap_or_else(|| item.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn product_type_accepts_dash_and_case_variants() {
        assert_eq!("rtc-s1".parse::<ProductType>().unwrap(), ProductType::RtcS1);
        assert_eq!(
            "DSWX_HLS".parse::<ProductType>().unwrap(),
            ProductType::DswxHls
        );
        assert_matches!(
            "SMAP".parse::<ProductType>(),
            Err(AuditError::InvalidProductType(_))
        );
    }

    #[test]
    fn flatten_mixed_manifest() {
        let value = json!([
            "a.tif",
            {"GranuleUR": "b"},
            {"name": "c"},
            {"other": 1}
        ]);
        let flat = flatten_manifest(&value).unwrap();
        assert_eq!(flat[..3], ["a.tif", "b", "c"]);
        assert_eq!(flat[3], r#"{"other":1}"#);
    }

    #[test]
    fn flatten_rejects_non_array() {
        assert!(flatten_manifest(&json!(null)).is_none());
    }
}
