use std::sync::Mutex;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use opera_audit::cmr::{
    CmrHttpClient, ClientConfig, MetadataSource, Page, PageRequest, SearchQuery,
    detail_from_umm, parse_search_page,
};
use opera_audit::composite::{ValidatorConfig, check_manifest};
use opera_audit::domain::{CollectionId, GranuleDetail, GranuleRecord, TemporalRange};
use opera_audit::error::AuditError;

fn fixture(name: &str) -> Value {
    let path = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
    let content = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&content).unwrap()
}

fn query(page_size: usize, max_pages: usize) -> SearchQuery {
    SearchQuery::new(
        "C2617126679-POCLOUD".parse::<CollectionId>().unwrap(),
        "2025-04-01,2025-04-30".parse::<TemporalRange>().unwrap(),
        page_size,
        max_pages,
    )
    .unwrap()
}

/// Serves pre-built pages in order and records every request.
#[derive(Default)]
struct PagedSource {
    pages: Vec<Result<Page, u16>>,
    requests: Mutex<Vec<PageRequest>>,
}

impl PagedSource {
    fn sized(sizes: &[usize]) -> Self {
        let mut next = 0;
        let pages = sizes
            .iter()
            .enumerate()
            .map(|(index, size)| {
                let records = (0..*size)
                    .map(|_| {
                        next += 1;
                        GranuleRecord::named(format!("granule-{next}"))
                    })
                    .collect();
                Ok(Page {
                    records,
                    hits: None,
                    cursor: Some(format!("cursor-{}", index + 1)),
                    exhausted: false,
                })
            })
            .collect();
        Self {
            pages,
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl MetadataSource for PagedSource {
    fn fetch_page(&self, _query: &SearchQuery, request: &PageRequest) -> Result<Page, AuditError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.pages.get(request.page_num - 1) {
            Some(Ok(page)) => Ok(page.clone()),
            Some(Err(status)) => Err(AuditError::CmrStatus {
                status: *status,
                endpoint: "search".to_string(),
                message: "rejected".to_string(),
            }),
            None => Ok(Page::default()),
        }
    }

    fn fetch_detail(&self, concept_id: &str) -> Result<GranuleDetail, AuditError> {
        Err(AuditError::InvalidConceptId(concept_id.to_string()))
    }
}

#[test]
fn decodes_search_page_fixture() {
    let (records, hits) = parse_search_page(&fixture("granules_page.json")).unwrap();
    assert_eq!(hits, Some(3));
    assert_eq!(records.len(), 3);

    let first = &records[0];
    assert_eq!(first.concept_id, "G3051234567-POCLOUD");
    assert_eq!(
        first.native_id,
        "OPERA_L3_DSWx-HLS_T11SNT_20250410T180921Z_20250412T090807Z_S2A_30_v1.0"
    );
    assert_eq!(
        first.temporal_start,
        Some(Utc.with_ymd_and_hms(2025, 4, 10, 18, 9, 21).unwrap())
    );
    assert_eq!(
        first.temporal_end,
        Some(Utc.with_ymd_and_hms(2025, 4, 10, 18, 9, 33).unwrap())
    );
    let bbox = first.bounding_box.unwrap();
    assert_eq!(bbox.west, -118.1);
    assert_eq!(bbox.north, 34.2);
    assert_eq!(first.platforms, vec!["Sentinel-2A".to_string()]);
    assert_eq!(first.input_granules.len(), 2);

    let second = &records[1];
    assert_eq!(second.temporal_start, second.temporal_end);
    assert!(second.temporal_start.is_some());
    assert!(second.native_id.contains("T11SNU"));

    let third = &records[2];
    assert_eq!(third.native_id, "G3051234569-POCLOUD");
    assert!(third.temporal_start.is_none());
}

#[test]
fn page_without_items_is_a_decode_error() {
    assert!(parse_search_page(&serde_json::json!({"hits": 0})).is_err());
}

#[test]
fn detail_fixture_flattens_structured_manifest() {
    let detail = detail_from_umm("G1-ASF", &fixture("granule_detail.json"));
    let manifest = detail.input_manifest.unwrap();
    assert_eq!(manifest.len(), 3);
    assert_eq!(
        manifest[1],
        "OPERA_L2_RTC-S1_T071-151231-IW2_20250410T015435Z_20250410T080000Z_S1A_30_v1.0"
    );

    let check = check_manifest(
        &GranuleRecord::named("composite"),
        Some(manifest.as_slice()),
        &ValidatorConfig::default(),
    );
    assert_eq!(check.acquisitions.len(), 2);
    assert!(check.verdict.is_pass());
}

#[test]
fn detail_without_input_granules_has_no_manifest() {
    let detail = detail_from_umm("G2-ASF", &fixture("granule_detail_no_inputs.json"));
    assert!(detail.input_manifest.is_none());
    assert!(detail.native_id.is_some());
}

#[test]
fn search_walks_pages_until_short_page() {
    let source = PagedSource::sized(&[2, 2, 1]);
    let mut search = source.search(query(2, 50));
    let records = search.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(records.len(), 5);
    assert_eq!(search.pages_fetched(), 3);

    let requests = source.requests.lock().unwrap();
    assert_eq!(requests[0].cursor, None);
    assert_eq!(requests[1].cursor.as_deref(), Some("cursor-1"));
    assert_eq!(requests[2].page_num, 3);
}

#[test]
fn search_stops_at_max_pages() {
    let source = PagedSource::sized(&[2, 2, 2, 2]);
    let records = source
        .search(query(2, 2))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(source.requests.lock().unwrap().len(), 2);
}

#[test]
fn exhausted_page_ends_search() {
    let mut source = PagedSource::sized(&[2, 2]);
    if let Some(Ok(page)) = source.pages.first_mut() {
        page.exhausted = true;
    }
    let records = source
        .search(query(2, 50))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn error_page_ends_iteration_after_buffered_records() {
    let mut source = PagedSource::sized(&[2]);
    source.pages.push(Err(400));
    let mut search = source.search(query(2, 50));
    assert!(search.next().unwrap().is_ok());
    assert!(search.next().unwrap().is_ok());
    assert_matches!(
        search.next(),
        Some(Err(AuditError::CmrStatus { status: 400, .. }))
    );
    assert!(search.next().is_none());
}

#[test]
fn each_search_restarts_from_first_page() {
    let source = PagedSource::sized(&[1]);
    assert_eq!(source.search(query(2, 50)).count(), 1);
    assert_eq!(source.search(query(2, 50)).count(), 1);
    let requests = source.requests.lock().unwrap();
    assert!(requests.iter().all(|request| request.page_num == 1));
}

#[test]
fn query_rejects_page_size_out_of_range() {
    let collection = "C2617126679-POCLOUD".parse::<CollectionId>().unwrap();
    let temporal = "2025-04-01,2025-04-30".parse::<TemporalRange>().unwrap();
    assert_matches!(
        SearchQuery::new(collection.clone(), temporal, 0, 1),
        Err(AuditError::InvalidPageSize(0))
    );
    assert_matches!(
        SearchQuery::new(collection, temporal, 2001, 1),
        Err(AuditError::InvalidPageSize(2001))
    );
}

#[test]
fn detail_rejects_malformed_concept_id_without_network() {
    let client = CmrHttpClient::new(ClientConfig::default()).unwrap();
    assert_matches!(
        client.fetch_detail("../granules"),
        Err(AuditError::InvalidConceptId(_))
    );
    assert_matches!(client.fetch_detail("  "), Err(AuditError::InvalidConceptId(_)));
}
