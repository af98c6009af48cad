//! End-to-end gateway scenarios against a mock provider.

use std::sync::Arc;

use batch_core::common::BatchError;
use batch_core::kernel::keys::{KeyRegistry, MemoryQuotaStore};
use batch_core::kernel::{ConcurrencyGovernor, HttpExecutor, MemoryArchiveWriter};
use datago_client::{tour, ContentType, Provider};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Gateway {
    executor: HttpExecutor,
    keys: Arc<KeyRegistry>,
    archive: Arc<MemoryArchiveWriter>,
}

async fn gateway(server: &MockServer, secrets: &[&str], quota: u32) -> Gateway {
    let keys = Arc::new(
        KeyRegistry::new(
            chrono_tz::Asia::Seoul,
            Arc::new(MemoryQuotaStore::new()),
            vec![(
                Provider::Kto,
                secrets.iter().map(|s| s.to_string()).collect(),
                quota,
            )],
        )
        .await
        .unwrap(),
    );

    let governor = Arc::new(ConcurrencyGovernor::new(
        &[Provider::Kto],
        5,
        10,
        std::time::Duration::ZERO,
        std::time::Duration::from_millis(50),
    ));

    let archive = Arc::new(MemoryArchiveWriter::new());
    let executor = HttpExecutor::new(
        reqwest::Client::new(),
        keys.clone(),
        governor,
        archive.clone(),
        server.uri(),
        server.uri(),
    );

    Gateway {
        executor,
        keys,
        archive,
    }
}

fn page_body(page_no: i64, rows: usize, total: i64) -> serde_json::Value {
    let items: Vec<serde_json::Value> = (0..rows)
        .map(|i| {
            json!({
                "contentid": format!("{}", (page_no - 1) * 100 + i as i64 + 1),
                "title": format!("Attraction {i}"),
                "addr1": "Somewhere",
                "mapx": "126.97",
                "mapy": "37.56"
            })
        })
        .collect();
    json!({
        "response": {
            "header": { "resultCode": "00", "resultMsg": "OK" },
            "body": {
                "items": { "item": items },
                "numOfRows": 100,
                "pageNo": page_no,
                "totalCount": total
            }
        }
    })
}

fn rate_limit_body() -> serde_json::Value {
    json!({
        "response": {
            "header": {
                "resultCode": "22",
                "resultMsg": "LIMITED_NUMBER_OF_SERVICE_REQUESTS_EXCEEDS_ERROR"
            }
        }
    })
}

#[tokio::test]
async fn happy_harvest_pages_archive_and_rotate() {
    let server = MockServer::start().await;
    for page_no in 1..=3 {
        Mock::given(method("GET"))
            .and(path("/areaBasedList2"))
            .and(query_param("pageNo", page_no.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(page_no, 100, 300)))
            .mount(&server)
            .await;
    }

    let gw = gateway(&server, &["key-a", "key-b"], 1_000).await;
    let request = tour::area_based_list(ContentType::TouristAttraction, Some("1"), "Test");
    let mut harvest = gw
        .executor
        .paged(request, 100, CancellationToken::new());

    let mut fetched = 0usize;
    let mut pages = 0usize;
    while let Some(page) = harvest.next_page().await.unwrap() {
        assert!(page.raw_id.is_some());
        fetched += page.slice.items.len();
        pages += 1;
    }

    assert_eq!(pages, 3);
    assert_eq!(fetched, 300);
    // One archive row per outbound call, written before the next page.
    assert_eq!(gw.archive.len().await, 3);

    // Usage spread across both keys, difference at most one.
    let snapshot = gw.keys.snapshot().await;
    let usages: Vec<u32> = snapshot[0].keys.iter().map(|k| k.usage_today).collect();
    assert_eq!(usages.iter().sum::<u32>(), 3);
    assert!(usages.iter().max().unwrap() - usages.iter().min().unwrap() <= 1);
}

#[tokio::test]
async fn rate_limited_key_rotates_without_failing_the_call() {
    let server = MockServer::start().await;

    // key-0 always hits the daily ceiling; the other keys serve normally.
    Mock::given(method("GET"))
        .and(path("/areaBasedList2"))
        .and(query_param("serviceKey", "key-0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rate_limit_body()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/areaBasedList2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(1, 10, 10)))
        .mount(&server)
        .await;

    let gw = gateway(&server, &["key-0", "key-1", "key-2"], 1_000).await;
    let request = tour::area_based_list(ContentType::Restaurant, None, "Test");

    let response = gw
        .executor
        .call_rotating(&request, false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    let snapshot = gw.keys.snapshot().await;
    let key0 = snapshot[0]
        .keys
        .iter()
        .find(|k| k.usage_today == 0 && k.state == "cooling")
        .expect("key-0 should be cooling");
    assert!(key0.cooldown_until.is_some());

    // Subsequent calls keep succeeding on the remaining keys.
    for _ in 0..3 {
        gw.executor
            .call_rotating(&request, false, &CancellationToken::new())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn quota_exhaustion_fails_the_sixth_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/areaBasedList2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(1, 1, 1)))
        .mount(&server)
        .await;

    let gw = gateway(&server, &["only-key"], 5).await;
    let request = tour::area_based_list(ContentType::Shopping, None, "Test");

    for _ in 0..5 {
        gw.executor
            .call(&request, false, &CancellationToken::new())
            .await
            .unwrap();
    }

    let err = gw
        .executor
        .call(&request, false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::QuotaExhausted { .. }));
    assert_eq!(err.severity(), batch_core::Severity::Critical);
}

#[tokio::test]
async fn auth_failure_disables_the_key_and_surfaces_quota_exhaustion() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/areaBasedList2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {
                "header": {
                    "resultCode": "30",
                    "resultMsg": "SERVICE_KEY_IS_NOT_REGISTERED_ERROR"
                }
            }
        })))
        .mount(&server)
        .await;

    let gw = gateway(&server, &["bad-key"], 1_000).await;
    let request = tour::area_based_list(ContentType::Festival, None, "Test");

    // Rotation burns the only key on the auth error, then reports the
    // registry as dry.
    let err = gw
        .executor
        .call_rotating(&request, false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::QuotaExhausted { .. }));

    let snapshot = gw.keys.snapshot().await;
    assert_eq!(snapshot[0].keys[0].state, "disabled");
}

#[tokio::test]
async fn server_errors_are_archived_and_classified_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/areaBasedList2"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let gw = gateway(&server, &["key-a"], 1_000).await;
    let request = tour::area_based_list(ContentType::Accommodation, None, "Test");

    let err = gw
        .executor
        .call(&request, true, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::Transient { .. }));

    // The failed call still landed in the archive.
    let rows = gw.archive.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].call.response_status, 503);
    // The secret never reaches archival metadata.
    assert_eq!(rows[0].call.key_hash.len(), 12);
    assert!(!format!("{:?}", rows[0]).contains("key-a"));
}

#[tokio::test]
async fn empty_listing_terminates_after_one_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/areaBasedList2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {
                "header": { "resultCode": "00", "resultMsg": "OK" },
                "body": { "items": "", "numOfRows": 100, "pageNo": 1, "totalCount": 0 }
            }
        })))
        .mount(&server)
        .await;

    let gw = gateway(&server, &["key-a"], 1_000).await;
    let request = tour::area_based_list(ContentType::TravelCourse, None, "Test");
    let mut harvest = gw.executor.paged(request, 100, CancellationToken::new());

    let first = harvest.next_page().await.unwrap().unwrap();
    assert!(first.slice.is_empty());
    assert!(harvest.next_page().await.unwrap().is_none());
}
