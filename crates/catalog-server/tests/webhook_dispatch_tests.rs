//! Webhook fan-out against mock HTTP targets

use catalog_server::import::notifier::{WebhookDispatcher, WebhookEvent};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;
use wiremock::{
    matchers::{body_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn dispatcher() -> WebhookDispatcher {
    WebhookDispatcher::with_timeout(Duration::from_millis(500), 4).unwrap()
}

fn completed(job_id: Uuid) -> WebhookEvent {
    WebhookEvent::ImportCompleted {
        job_id,
        filename: "catalog.csv".into(),
        total_rows: 2500,
        created: 2400,
        updated: 100,
    }
}

#[tokio::test]
async fn test_posts_event_envelope() {
    let server = MockServer::start().await;
    let job_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/hooks/catalog"))
        .and(body_json(json!({
            "event": "import.completed",
            "data": {
                "job_id": job_id,
                "filename": "catalog.csv",
                "total_rows": 2500,
                "created": 2400,
                "updated": 100
            }
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let report = dispatcher()
        .dispatch(&[format!("{}/hooks/catalog", server.uri())], &completed(job_id))
        .await;

    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn test_failed_target_does_not_block_others() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let urls = vec![
        format!("{}/ok", server.uri()),
        format!("{}/broken", server.uri()),
        format!("{}/ok", server.uri()),
    ];
    let report = dispatcher()
        .dispatch(
            &urls,
            &WebhookEvent::ImportFailed {
                job_id: Uuid::new_v4(),
                error: "worker lease expired".into(),
            },
        )
        .await;

    assert_eq!(report.attempted, 3);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_slow_target_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let report = dispatcher()
        .dispatch(&[server.uri()], &completed(Uuid::new_v4()))
        .await;

    assert_eq!(report.delivered, 0);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_unreachable_target_counts_as_failed() {
    let report = dispatcher()
        .dispatch(
            &["http://127.0.0.1:9/unreachable".to_string()],
            &WebhookEvent::ProductCreated {
                id: Uuid::new_v4(),
                sku: "abc-1".into(),
                name: "Widget".into(),
                description: None,
                active: true,
            },
        )
        .await;

    assert_eq!(report.attempted, 1);
    assert_eq!(report.failed, 1);
}
