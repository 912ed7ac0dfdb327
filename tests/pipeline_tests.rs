//! End-to-end pipeline runs against a scripted page source
//!
//! Every test drives `CatalogPipeline::run` over a catalog file in a
//! temporary directory; no browser is involved.

mod common;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{
    FAKE_PNG, STORE_A_URL, STORE_B_URL, ScriptedSource, acme_catalog, artifacts, navigation_timeout, pipeline, read_json,
    selector_timeout, write_catalog,
};
use price_tracker::crawling::{AcquisitionError, PipelineError};
use price_tracker::domain::{Catalog, CatalogLayout, ListingKey};
use price_tracker::infrastructure::CatalogStore;

fn parse_ts(value: &serde_json::Value) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value.as_str().unwrap()).unwrap().with_timezone(&Utc)
}

#[tokio::test]
async fn acme_scenario_records_one_price_and_one_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let diagnostics = dir.path().join("diagnostics");
    let path = write_catalog(dir.path(), &acme_catalog()).await;
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new()
        .price(STORE_A_URL, "  $45.990 ")
        .fail(STORE_B_URL, selector_timeout());

    let report = pipeline(&diagnostics, 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed(), 1);

    let document = read_json(&path).await;
    let stores = &document[0]["models"][0]["stores"];
    let history_a = stores[0]["history"].as_array().unwrap();
    assert_eq!(history_a.len(), 2);
    assert_eq!(history_a[1]["price"], json!(45990));
    assert_eq!(parse_ts(&history_a[1]["timestamp"]), report.batch_timestamp);
    assert_eq!(stores[1]["history"], json!([]));

    let failure = report
        .failure_for(&ListingKey::new("Acme", "X1", "Store B"))
        .unwrap();
    assert_eq!(failure.error.kind(), "selector_timeout");
    assert!(failure.artifact.is_some());

    let files = artifacts(&diagnostics);
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("error-Store-B-Acme-X1-"), "{}", files[0]);
    assert_eq!(std::fs::read(diagnostics.join(&files[0])).unwrap(), FAKE_PNG);
}

#[tokio::test]
async fn total_failure_leaves_catalog_bytes_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.json");
    let store = CatalogStore::new(&path);
    store
        .save(&Catalog::from_value(acme_catalog()).unwrap())
        .await
        .unwrap();
    let before = std::fs::read(&path).unwrap();

    for _ in 0..2 {
        let mut source = ScriptedSource::new()
            .fail(STORE_A_URL, navigation_timeout(STORE_A_URL))
            .fail(STORE_B_URL, selector_timeout());
        let report = pipeline(&dir.path().join("diagnostics"), 0)
            .run(&store, &mut source, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.succeeded, 0);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}

#[tokio::test]
async fn total_failure_keeps_hand_written_listings_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let document = json!([{
        "notes": "curated by hand",
        "brand": "Acme",
        "models": [{
            "image": "x1.png",
            "model": "X1",
            "stores": [
                { "notes": "n", "store": "Store A", "url": STORE_A_URL, "price_selector": ".p" },
                {
                    "price_selector": ".p",
                    "history": [{ "price": 49990, "timestamp": "2025-01-01T10:00:00Z", "source": "manual" }],
                    "url": STORE_B_URL,
                    "store": "Store B"
                }
            ]
        }]
    }]);
    let path = write_catalog(dir.path(), &document).await;
    let before = std::fs::read(&path).unwrap();
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new()
        .fail(STORE_A_URL, selector_timeout())
        .fail(STORE_B_URL, navigation_timeout(STORE_B_URL));

    let report = pipeline(&dir.path().join("diagnostics"), 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failed(), 2);
    assert_eq!(
        String::from_utf8(std::fs::read(&path).unwrap()).unwrap(),
        String::from_utf8(before).unwrap()
    );
}

#[tokio::test]
async fn first_deployment_catalog_is_updated_in_its_own_keys() {
    let dir = tempfile::tempdir().unwrap();
    let diagnostics = dir.path().join("diagnostics");
    let document = json!([
        {
            "marca": "Samsung",
            "modelo": "QN55",
            "imagen": "qn55.webp",
            "tiendas": [
                {
                    "tienda": "Falabella",
                    "url": STORE_A_URL,
                    "selector_precio": ".prices-0 span",
                    "historial_precios": [
                        { "fecha": "2025-01-01T10:00:00.000Z", "precio": 499990 },
                        { "fecha": "2025-01-02T10:00:00.000Z", "precio": null }
                    ]
                },
                {
                    "tienda": "Paris",
                    "url": STORE_B_URL,
                    "selector_precio": ".price"
                }
            ]
        },
        {
            "marca": "LG",
            "modelo": "C3",
            "tiendas": [
                { "tienda": "Ripley", "url": "https://ripley.example/c3", "selector_precio": ".p" }
            ]
        }
    ]);
    let path = write_catalog(dir.path(), &document).await;
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new()
        .price(STORE_A_URL, "$479.990")
        .fail(STORE_B_URL, selector_timeout())
        .price("https://ripley.example/c3", "$899.990");

    let report = pipeline(&diagnostics, 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.succeeded, 2);
    assert!(report.failure_for(&ListingKey::new("Samsung", "QN55", "Paris")).is_some());

    let saved = read_json(&path).await;
    let batch = price_tracker::domain::catalog::iso_millis::format(&report.batch_timestamp);

    let falabella = &saved[0]["tiendas"][0];
    assert_eq!(
        falabella["historial_precios"],
        json!([
            { "fecha": "2025-01-01T10:00:00.000Z", "precio": 499990 },
            { "fecha": "2025-01-02T10:00:00.000Z", "precio": null },
            { "fecha": batch, "precio": 479990 }
        ])
    );
    // failed listing is carried forward without gaining a history key
    assert_eq!(saved[0]["tiendas"][1], document[0]["tiendas"][1]);
    assert_eq!(saved[0]["imagen"], json!("qn55.webp"));
    assert_eq!(
        saved[1]["tiendas"][0]["historial_precios"],
        json!([{ "fecha": batch, "precio": 899990 }])
    );

    let rendered = std::fs::read_to_string(&path).unwrap();
    for english in ["\"brand\"", "\"stores\"", "\"history\"", "\"price\""] {
        assert!(!rendered.contains(english), "{english} leaked into {rendered}");
    }

    let files = artifacts(&diagnostics);
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("error-Paris-Samsung-QN55-"), "{}", files[0]);
}

#[tokio::test]
async fn every_listing_is_visited_once_in_catalog_order() {
    let dir = tempfile::tempdir().unwrap();
    let document = json!([
        {
            "brand": "Acme",
            "models": [
                { "model": "X1", "stores": [
                    { "store": "Store A", "url": "https://a.example/x1", "price_selector": ".p" },
                    { "store": "Store B", "url": "https://b.example/x1", "price_selector": ".p" }
                ]},
                { "model": "X2", "stores": [
                    { "store": "Store A", "url": "https://a.example/x2", "price_selector": ".p" }
                ]}
            ]
        },
        {
            "brand": "Globex",
            "models": [
                { "model": "G", "stores": [
                    { "store": "Store C", "url": "https://c.example/g", "price_selector": ".p" }
                ]}
            ]
        }
    ]);
    let path = write_catalog(dir.path(), &document).await;
    let store = CatalogStore::new(&path);
    let keys_before = Catalog::from_value(document).unwrap().listing_keys();

    let mut source = ScriptedSource::new()
        .price("https://a.example/x1", "$1.000")
        .fail("https://b.example/x1", AcquisitionError::browser("target crashed"))
        .price("https://a.example/x2", "$2.000")
        .price("https://c.example/g", "$3.000");

    let report = pipeline(&dir.path().join("diagnostics"), 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.total, 4);
    assert_eq!(report.succeeded + report.failed(), report.total);

    let log = source.log();
    assert_eq!(
        log.acquired,
        vec![
            "https://a.example/x1",
            "https://b.example/x1",
            "https://a.example/x2",
            "https://c.example/g",
        ]
    );
    assert_eq!(log.opened, log.closed);
    assert_eq!((log.started, log.stopped), (1, 1));

    let saved = store.load().await.unwrap();
    assert_eq!(saved.listing_keys(), keys_before);
    for key in &keys_before {
        let listing = saved.find_listing(key).unwrap();
        let expected = usize::from(report.failure_for(key).is_none());
        assert_eq!(listing.history.len(), expected, "{key}");
    }
}

#[tokio::test]
async fn successful_runs_append_monotonically() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_catalog(dir.path(), &acme_catalog()).await;
    let store = CatalogStore::new(&path);
    let diagnostics = dir.path().join("diagnostics");

    let mut last_batch = None;
    for price in ["$45.990", "$44.990"] {
        let mut source = ScriptedSource::new()
            .price(STORE_A_URL, price)
            .price(STORE_B_URL, price);
        let report = pipeline(&diagnostics, 0)
            .run(&store, &mut source, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_complete_success());
        last_batch = Some(report.batch_timestamp);
    }

    let saved = store.load().await.unwrap();
    let listing = saved
        .find_listing(&ListingKey::new("Acme", "X1", "Store A"))
        .unwrap();
    let prices: Vec<Option<u64>> = listing.history.iter().map(|o| o.price).collect();
    assert_eq!(prices, vec![Some(49990), Some(45990), Some(44990)]);

    let timestamps: Vec<_> = listing.history.iter().map(|o| o.timestamp).collect();
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(listing.history.newest_timestamp(), last_batch);
    assert!(artifacts(&diagnostics).is_empty());
}

#[tokio::test]
async fn navigation_timeout_does_not_affect_next_listing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_catalog(dir.path(), &acme_catalog()).await;
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new()
        .fail(STORE_A_URL, navigation_timeout(STORE_A_URL))
        .price(STORE_B_URL, "$39.990");

    let report = pipeline(&dir.path().join("diagnostics"), 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failures[0].error.kind(), "navigation_timeout");
    assert_eq!(report.failures[0].attempts, 1);

    let log = source.log();
    assert_eq!(log.opened, 2);
    assert_eq!(log.closed, 2);

    let saved = store.load().await.unwrap();
    let store_b = saved
        .find_listing(&ListingKey::new("Acme", "X1", "Store B"))
        .unwrap();
    assert_eq!(store_b.history.as_slice()[0].price, Some(39990));
}

#[tokio::test]
async fn retryable_failures_get_a_fresh_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_catalog(dir.path(), &acme_catalog()).await;
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new()
        .fail(STORE_A_URL, navigation_timeout(STORE_A_URL))
        .price(STORE_A_URL, "$45.990")
        .fail(STORE_B_URL, selector_timeout())
        .price(STORE_B_URL, "$1");

    let report = pipeline(&dir.path().join("diagnostics"), 1)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 1);
    let failure = report
        .failure_for(&ListingKey::new("Acme", "X1", "Store B"))
        .unwrap();
    assert_eq!(failure.error.kind(), "selector_timeout");
    assert_eq!(failure.attempts, 1);

    let log = source.log();
    assert_eq!(log.acquired, vec![STORE_A_URL, STORE_A_URL, STORE_B_URL]);
    assert_eq!(log.opened, 3);
    assert_eq!(log.closed, 3);
}

#[tokio::test]
async fn retries_stop_at_the_configured_limit() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_catalog(dir.path(), &acme_catalog()).await;
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new()
        .fail(STORE_A_URL, AcquisitionError::browser("net::ERR_CONNECTION_RESET"))
        .fail(STORE_A_URL, AcquisitionError::browser("net::ERR_CONNECTION_RESET"))
        .fail(STORE_A_URL, AcquisitionError::browser("net::ERR_CONNECTION_RESET"))
        .price(STORE_A_URL, "$45.990")
        .price(STORE_B_URL, "$1");

    let report = pipeline(&dir.path().join("diagnostics"), 2)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    let failure = report
        .failure_for(&ListingKey::new("Acme", "X1", "Store A"))
        .unwrap();
    assert_eq!(failure.error.kind(), "browser");
    assert_eq!(failure.attempts, 3);
    // Diagnostics only for the final attempt
    assert_eq!(source.log().snapshots, 1);
}

#[tokio::test]
async fn listing_with_future_history_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut document = acme_catalog();
    document[0]["models"][0]["stores"][1]["history"] =
        json!([{ "timestamp": "2999-01-01T00:00:00.000Z", "price": 1 }]);
    let path = write_catalog(dir.path(), &document).await;
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new()
        .price(STORE_A_URL, "$45.990")
        .price(STORE_B_URL, "$45.990");

    let report = pipeline(&dir.path().join("diagnostics"), 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    let failure = report
        .failure_for(&ListingKey::new("Acme", "X1", "Store B"))
        .unwrap();
    assert_eq!(failure.error.kind(), "out_of_order");
    assert_eq!(failure.attempts, 0);
    assert!(failure.artifact.is_none());
    assert_eq!(source.log().acquired, vec![STORE_A_URL]);

    let saved = read_json(&path).await;
    assert_eq!(
        saved[0]["models"][0]["stores"][1]["history"],
        json!([{ "timestamp": "2999-01-01T00:00:00.000Z", "price": 1 }])
    );
}

#[tokio::test]
async fn unknown_fields_survive_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut document = acme_catalog();
    document[0]["logo"] = json!("acme.svg");
    document[0]["models"][0]["image"] = json!({ "src": "x1.png", "alt": "Acme X1" });
    document[0]["models"][0]["stores"][0]["notes"] = json!("ships from Santiago");
    document[0]["models"][0]["stores"][0]["history"][0]["source"] = json!("manual");
    let path = write_catalog(dir.path(), &document).await;
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new()
        .price(STORE_A_URL, "$45.990")
        .price(STORE_B_URL, "$45.990");

    pipeline(&dir.path().join("diagnostics"), 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    let saved = read_json(&path).await;
    assert_eq!(saved[0]["logo"], json!("acme.svg"));
    assert_eq!(saved[0]["models"][0]["image"]["alt"], json!("Acme X1"));
    let listing = &saved[0]["models"][0]["stores"][0];
    assert_eq!(listing["notes"], json!("ships from Santiago"));
    assert_eq!(listing["history"][0]["source"], json!("manual"));
    assert_eq!(listing["history"][1]["price"], json!(45990));
}

#[tokio::test]
async fn flat_layout_is_written_back_flat() {
    let dir = tempfile::tempdir().unwrap();
    let document = json!([
        { "brand": "Acme", "model": "X1", "stores": [
            { "store": "Store A", "url": STORE_A_URL, "price_selector": ".p", "history": [] }
        ]},
        { "brand": "Acme", "model": "X2", "stores": [] }
    ]);
    let path = write_catalog(dir.path(), &document).await;
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new().price(STORE_A_URL, "$9.990");

    pipeline(&dir.path().join("diagnostics"), 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    let saved = store.load().await.unwrap();
    assert_eq!(saved.layout, CatalogLayout::Flat);
    let raw = read_json(&path).await;
    assert_eq!(raw.as_array().unwrap().len(), 2);
    assert_eq!(raw[0]["brand"], json!("Acme"));
    assert_eq!(raw[0]["stores"][0]["history"][0]["price"], json!(9990));
    assert!(raw[0].get("models").is_none());
}

#[tokio::test]
async fn missing_catalog_is_fatal_before_browser_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = CatalogStore::new(dir.path().join("absent.json"));
    let mut source = ScriptedSource::new();

    let result = pipeline(&dir.path().join("diagnostics"), 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(PipelineError::CatalogLoad(_))));
    assert_eq!(source.log().started, 0);
}

#[tokio::test]
async fn browser_start_failure_is_fatal_and_leaves_catalog_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_catalog(dir.path(), &acme_catalog()).await;
    let before = std::fs::read(&path).unwrap();
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new().failing_start();

    let result = pipeline(&dir.path().join("diagnostics"), 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(PipelineError::BrowserStart(_))));
    assert!(source.log().acquired.is_empty());
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn unwritable_catalog_is_fatal_after_processing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_catalog(dir.path(), &acme_catalog()).await;
    let store = CatalogStore::new(&path);
    // A directory squatting on the temp file name makes the write fail
    std::fs::create_dir(dir.path().join(".catalog.json.tmp")).unwrap();
    let mut source = ScriptedSource::new()
        .price(STORE_A_URL, "$45.990")
        .price(STORE_B_URL, "$45.990");

    let result = pipeline(&dir.path().join("diagnostics"), 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(PipelineError::CatalogSave(_))));
    assert_eq!(source.log().stopped, 1);
}

#[tokio::test]
async fn cancellation_before_start_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_catalog(dir.path(), &acme_catalog()).await;
    let before = std::fs::read(&path).unwrap();
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = pipeline(&dir.path().join("diagnostics"), 0)
        .run(&store, &mut source, &cancel)
        .await;

    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert_eq!(source.log().started, 0);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn cancellation_mid_run_stops_source_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_catalog(dir.path(), &acme_catalog()).await;
    let before = std::fs::read(&path).unwrap();
    let store = CatalogStore::new(&path);
    let cancel = CancellationToken::new();
    let mut source = ScriptedSource::new()
        .price(STORE_A_URL, "$45.990")
        .price(STORE_B_URL, "$45.990")
        .cancel_on_acquire(cancel.clone());

    let result = pipeline(&dir.path().join("diagnostics"), 0)
        .run(&store, &mut source, &cancel)
        .await;

    assert!(matches!(result, Err(PipelineError::Cancelled)));
    let log = source.log();
    assert_eq!(log.acquired, vec![STORE_A_URL]);
    assert_eq!((log.started, log.stopped), (1, 1));
    assert_eq!(log.opened, log.closed);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn failed_snapshot_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let diagnostics = dir.path().join("diagnostics");
    let path = write_catalog(dir.path(), &acme_catalog()).await;
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new()
        .price(STORE_A_URL, "Agotado")
        .price(STORE_B_URL, "$45.990")
        .failing_snapshots();

    let report = pipeline(&diagnostics, 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failures[0].error.kind(), "normalization_failure");
    assert!(report.failures[0].artifact.is_none());
    assert!(artifacts(&diagnostics).is_empty());
}

#[tokio::test]
async fn blank_price_text_is_empty_content_with_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let diagnostics = dir.path().join("diagnostics");
    let path = write_catalog(dir.path(), &acme_catalog()).await;
    let store = CatalogStore::new(&path);
    let mut source = ScriptedSource::new()
        .price(STORE_A_URL, "   ")
        .price(STORE_B_URL, "$45.990");

    let report = pipeline(&diagnostics, 0)
        .run(&store, &mut source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failures[0].error.kind(), "empty_content");
    assert_eq!(artifacts(&diagnostics).len(), 1);
}
