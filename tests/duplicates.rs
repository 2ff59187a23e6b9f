use chrono::{TimeZone, Utc};

use opera_audit::domain::{GranuleRecord, Period, ProductType};
use opera_audit::duplicates::{DuplicateDetector, UNKNOWN_PERIOD, detect};
use opera_audit::finding::Rule;

fn named(ids: &[&str]) -> Vec<GranuleRecord> {
    ids.iter().map(|id| GranuleRecord::named(*id)).collect()
}

#[test]
fn scenario_a_identical_hls_granules() {
    let granules = named(&[
        "HLS.S30.T11SNT.2022335T182731.v2.0",
        "HLS.S30.T11SNT.2022335T182731.v2.0",
    ]);
    let report = detect(&granules, ProductType::Hls);
    assert_eq!(report.total, 2);
    assert_eq!(report.unique, 1);
    assert_eq!(report.duplicate_count, 1);
    assert_eq!(
        report.duplicate_identities,
        vec!["HLS.S30.T11SNT.2022335T182731".to_string()]
    );
    assert!(report.has_duplicates());
}

#[test]
fn reprocessed_outputs_are_duplicates_with_latest() {
    let granules = named(&[
        "OPERA_L3_DSWx-S1_T11SNT_20240101T000000Z_20240105T000000Z_S1A_30_v1.0",
        "OPERA_L3_DSWx-S1_T11SNT_20240101T000000Z_20240102T000000Z_S1A_30_v1.0",
        "OPERA_L3_DSWx-S1_T11SNU_20240101T000000Z_20240102T000000Z_S1A_30_v1.0",
    ]);
    let report = detect(&granules, ProductType::DswxS1);
    assert_eq!(report.total, 3);
    assert_eq!(report.unique, 2);

    let collision = &report.collisions["OPERA_L3_DSWx-S1_T11SNT_20240101T000000Z_S1A"];
    assert_eq!(
        collision.granules,
        vec![
            "OPERA_L3_DSWx-S1_T11SNT_20240101T000000Z_20240102T000000Z_S1A_30_v1.0".to_string(),
            "OPERA_L3_DSWx-S1_T11SNT_20240101T000000Z_20240105T000000Z_S1A_30_v1.0".to_string(),
        ]
    );
    assert_eq!(
        collision.latest.as_deref(),
        Some("OPERA_L3_DSWx-S1_T11SNT_20240101T000000Z_20240105T000000Z_S1A_30_v1.0")
    );

    let findings = report.findings();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings.count(Rule::DuplicateIdentity), 1);
}

#[test]
fn duplicate_count_is_total_minus_unique() {
    let granules = named(&[
        "HLS.S30.T11SNT.2022335T182731.v2.0",
        "HLS.S30.T11SNT.2022335T182731.v2.0",
        "HLS.S30.T11SNT.2022335T182731.v2.0",
        "HLS.L30.T11SNT.2022335T182731.v2.0",
        "HLS.S30.T12SNT.2022335T182731.v2.0",
        "junk",
        "junk",
    ]);
    let report = detect(&granules, ProductType::Hls);
    assert_eq!(report.total, 7);
    assert_eq!(report.unique, 4);
    assert_eq!(report.duplicate_count, report.total - report.unique);
    assert_eq!(report.unparsed, 2);
    assert!(
        report
            .duplicate_identities
            .contains(&"UNPARSED::junk".to_string())
    );
}

#[test]
fn result_does_not_depend_on_input_order() {
    let mut granules = named(&[
        "OPERA_L2_RTC-S1_T056-118754-IW2_20231101T123456Z_20231102T000000Z_S1A_30_v1.0",
        "OPERA_L2_RTC-S1_T056-118754-IW2_20231101T123456Z_20231103T000000Z_S1A_30_v1.0",
        "OPERA_L2_RTC-S1_T056-118755-IW3_20231101T123459Z_20231102T000000Z_S1A_30_v1.0",
        "OPERA_L2_RTC-S1_T056-118755-IW3_20231101T123459Z_20231104T000000Z_S1A_30_v1.0",
    ]);
    let forward = detect(&granules, ProductType::RtcS1);
    granules.reverse();
    let backward = detect(&granules, ProductType::RtcS1);
    assert_eq!(forward, backward);
    assert_eq!(forward.duplicate_identities.len(), 2);
}

#[test]
fn period_breakdown_uses_temporal_start() {
    let mut first = GranuleRecord::named("HLS.S30.T11SNT.2022335T182731.v2.0");
    first.temporal_start = Some(Utc.with_ymd_and_hms(2022, 12, 1, 18, 27, 31).unwrap());
    let second = first.clone();
    let mut third = GranuleRecord::named("HLS.S30.T11SNT.2022336T182731.v2.0");
    third.temporal_start = Some(Utc.with_ymd_and_hms(2022, 12, 2, 18, 27, 31).unwrap());
    let unknown = GranuleRecord::named("junk");

    let report = DuplicateDetector::new(ProductType::Hls, Period::Day)
        .detect([first, second, third, unknown]);
    let day_one = report.by_period["2022-12-01"];
    assert_eq!(day_one.total, 2);
    assert_eq!(day_one.unique, 1);
    assert_eq!(day_one.duplicate_count, 1);
    assert_eq!(report.by_period["2022-12-02"].duplicate_count, 0);
    assert_eq!(report.by_period[UNKNOWN_PERIOD].total, 1);
}

#[test]
fn empty_input_is_clean() {
    let report = detect(Vec::<GranuleRecord>::new(), ProductType::Hls);
    assert_eq!(report.total, 0);
    assert!(!report.has_duplicates());
    assert!(report.findings().is_empty());
}
