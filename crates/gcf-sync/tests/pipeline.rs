use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use gcf_adapters::{ProviderClient, SamGovClient, UsaSpendingClient};
use gcf_core::{DateWindow, Provider, RecordKind, RecordQuery, RetentionMode};
use gcf_storage::{HttpClientConfig, HttpFetcher, RecordStore};
use gcf_sync::{RunStatus, SyncPipeline};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixture(relative: &str) -> Value {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(relative);
    let text = std::fs::read_to_string(&path).expect("read fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

fn fixture_response(relative: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(fixture(relative))
}

fn window() -> DateWindow {
    DateWindow::trailing(NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(), 30)
}

async fn mount_sam(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/sam"))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn mount_usa(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/usa"))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn pipeline(
    server: &MockServer,
    store: RecordStore,
    retention: RetentionMode,
) -> SyncPipeline {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("gcf-test".into()),
    })
    .unwrap();
    let providers: Vec<Box<dyn ProviderClient>> = vec![
        Box::new(SamGovClient::new(format!("{}/sam", server.uri()), "test-key", 50)),
        Box::new(UsaSpendingClient::new(format!("{}/usa", server.uri()), 50)),
    ];
    SyncPipeline::with_providers(store, http, providers, retention)
}

#[tokio::test]
async fn repeated_runs_do_not_duplicate_records() {
    let server = MockServer::start().await;
    mount_sam(&server, fixture_response("sam-gov/opportunities.json")).await;
    mount_usa(&server, fixture_response("usaspending/awards.json")).await;

    let store = RecordStore::in_memory().await.unwrap();
    let pipeline = pipeline(&server, store.clone(), RetentionMode::AppendOnly).await;

    let first = pipeline.run_for_window(window()).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    let sam = first.report_for(Provider::SamGov).unwrap();
    assert_eq!((sam.fetched, sam.normalized, sam.rejected), (5, 4, 1));
    assert_eq!((sam.inserted, sam.duplicates), (3, 1));
    let usa = first.report_for(Provider::UsaSpending).unwrap();
    assert_eq!((usa.fetched, usa.inserted, usa.rejected), (4, 3, 1));

    let second = pipeline.run_for_window(window()).await.unwrap();
    assert_eq!(second.inserted(), 0);
    assert_eq!(store.count(RecordKind::Opportunity).await.unwrap(), 3);
    assert_eq!(store.count(RecordKind::Award).await.unwrap(), 3);

    // First occurrence wins; the later repost of ABC-1 is ignored.
    let widgets = store
        .query_opportunities(&RecordQuery {
            keyword: Some("widgets".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(widgets.len(), 1);
    assert_eq!(widgets[0].record.title, "Widgets");
    assert_eq!(widgets[0].record.link, "https://sam.gov/opp/xyz/view");
}

#[tokio::test]
async fn unparseable_date_still_stores_record() {
    let server = MockServer::start().await;
    mount_sam(&server, fixture_response("sam-gov/opportunities.json")).await;
    mount_usa(&server, ResponseTemplate::new(200).set_body_json(json!({"results": []}))).await;

    let store = RecordStore::in_memory().await.unwrap();
    pipeline(&server, store.clone(), RetentionMode::AppendOnly)
        .await
        .run_for_window(window())
        .await
        .unwrap();

    let janitorial = store
        .query_opportunities(&RecordQuery {
            classification_code: Some("561720".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(janitorial.len(), 1);
    assert_eq!(janitorial[0].record.posted_date, None);

    // Undated records sort after dated ones.
    let all = store.query_opportunities(&RecordQuery::default()).await.unwrap();
    assert_eq!(all.last().unwrap().record.solicitation_number, "GS-07P-25-0012");
}

#[tokio::test]
async fn failing_provider_does_not_block_the_other() {
    let server = MockServer::start().await;
    mount_sam(&server, fixture_response("sam-gov/opportunities.json")).await;
    mount_usa(&server, ResponseTemplate::new(502)).await;

    let store = RecordStore::in_memory().await.unwrap();
    let summary = pipeline(&server, store.clone(), RetentionMode::AppendOnly)
        .await
        .run_for_window(window())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::CompletedWithProviderErrors);
    let usa = summary.report_for(Provider::UsaSpending).unwrap();
    assert!(usa.error.as_deref().unwrap().contains("502"));
    assert_eq!(usa.inserted, 0);
    assert_eq!(store.count(RecordKind::Opportunity).await.unwrap(), 3);
    assert_eq!(store.count(RecordKind::Award).await.unwrap(), 0);
}

#[tokio::test]
async fn full_refresh_replaces_previous_records() {
    let server = MockServer::start().await;
    mount_sam(&server, fixture_response("sam-gov/opportunities.json")).await;
    mount_usa(&server, fixture_response("usaspending/awards.json")).await;

    let store = RecordStore::in_memory().await.unwrap();
    let pipeline = pipeline(&server, store.clone(), RetentionMode::FullRefresh).await;
    pipeline.run_for_window(window()).await.unwrap();
    assert_eq!(store.count(RecordKind::Opportunity).await.unwrap(), 3);

    server.reset().await;
    mount_sam(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "opportunitiesData": [{
                "noticeId": "n-9",
                "title": "Runway Repair",
                "solicitationNumber": "NEW-9",
                "departmentName": "DOT",
                "postedDate": "2025-01-30",
                "naics": {"code": "237310"}
            }]
        })),
    )
    .await;
    mount_usa(&server, ResponseTemplate::new(200).set_body_json(json!({"results": []}))).await;

    let summary = pipeline.run_for_window(window()).await.unwrap();
    let sam = summary.report_for(Provider::SamGov).unwrap();
    assert_eq!((sam.cleared, sam.inserted), (3, 1));
    assert_eq!(summary.report_for(Provider::UsaSpending).unwrap().cleared, 3);

    let stored = store.query_opportunities(&RecordQuery::default()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].record.solicitation_number, "NEW-9");
    assert_eq!(store.count(RecordKind::Award).await.unwrap(), 0);
}

#[tokio::test]
async fn full_refresh_keeps_data_when_provider_fails() {
    let server = MockServer::start().await;
    mount_sam(&server, fixture_response("sam-gov/opportunities.json")).await;
    mount_usa(&server, fixture_response("usaspending/awards.json")).await;

    let store = RecordStore::in_memory().await.unwrap();
    let pipeline = pipeline(&server, store.clone(), RetentionMode::FullRefresh).await;
    pipeline.run_for_window(window()).await.unwrap();

    server.reset().await;
    mount_sam(&server, ResponseTemplate::new(503)).await;
    mount_usa(&server, fixture_response("usaspending/awards.json")).await;

    let summary = pipeline.run_for_window(window()).await.unwrap();
    assert_eq!(summary.report_for(Provider::SamGov).unwrap().cleared, 0);
    assert_eq!(store.count(RecordKind::Opportunity).await.unwrap(), 3);
    assert_eq!(store.count(RecordKind::Award).await.unwrap(), 3);
}
