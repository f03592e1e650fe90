use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use resao_adapters::{HttpFeedScraper, ScrapeContext, ScrapeError, TenderScraper};
use resao_storage::{FeedFetchConfig, FeedFetcher, FetchError, RetryPolicy};
use serde_json::json;
use uuid::Uuid;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

fn scraper(url: String) -> HttpFeedScraper {
    let fetcher = FeedFetcher::new(FeedFetchConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("resao-test".into()),
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
    })
    .expect("client");
    HttpFeedScraper::new(url, fetcher)
}

async fn feed(headers: HeaderMap) -> Response {
    let accepts_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));
    if !accepts_json {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    Json(json!({
        "data": [
            {"Référence": "AO-12/2024", "Objet": "Voirie", "Montant": "1 000,00 DH"},
            {"reference": "AO-13/2024", "objet": "Éclairage public"}
        ]
    }))
    .into_response()
}

async fn busy_once(State(hits): State<Arc<AtomicUsize>>) -> Response {
    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, [(header::RETRY_AFTER, "0")], "busy")
            .into_response();
    }
    Json(json!([{"reference": "AO-14/2024"}])).into_response()
}

async fn gone(State(hits): State<Arc<AtomicUsize>>) -> StatusCode {
    hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::NOT_FOUND
}

#[tokio::test]
async fn feed_records_are_read_from_a_wrapped_payload() {
    let base = serve(Router::new().route("/feed", get(feed))).await;

    let records = scraper(format!("{base}/feed"))
        .scrape(&ScrapeContext::new(Uuid::new_v4()))
        .await
        .expect("scrape");

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].reference.as_deref(), Some("AO-12/2024"));
    assert_eq!(records[0].montant.as_deref(), Some("1 000,00 DH"));
    assert_eq!(records[1].objet.as_deref(), Some("Éclairage public"));
}

#[tokio::test]
async fn unavailable_feed_is_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/feed", get(busy_once))
        .with_state(Arc::clone(&hits));
    let base = serve(router).await;

    let records = scraper(format!("{base}/feed"))
        .scrape(&ScrapeContext::new(Uuid::new_v4()))
        .await
        .expect("scrape after retry");

    assert_eq!(records.len(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn missing_feed_fails_without_retrying() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/feed", get(gone))
        .with_state(Arc::clone(&hits));
    let base = serve(router).await;

    let err = scraper(format!("{base}/feed"))
        .scrape(&ScrapeContext::new(Uuid::new_v4()))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ScrapeError::Fetch(FetchError::HttpStatus { status: 404, .. })
    ));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
