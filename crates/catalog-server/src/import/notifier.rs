//! Lifecycle webhooks
//!
//! Events are delivered with at most one attempt per registered target.
//! Delivery never fails the caller; outcomes are only logged and counted.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WebhookConfig;

/// Event delivered to webhook targets as `{"event": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum WebhookEvent {
    #[serde(rename = "import.started")]
    ImportStarted { job_id: Uuid, filename: String },

    #[serde(rename = "import.completed")]
    ImportCompleted {
        job_id: Uuid,
        filename: String,
        total_rows: i64,
        created: i64,
        updated: i64,
    },

    #[serde(rename = "import.failed")]
    ImportFailed { job_id: Uuid, error: String },

    #[serde(rename = "product.created")]
    ProductCreated {
        id: Uuid,
        sku: String,
        name: String,
        description: Option<String>,
        active: bool,
    },
}

impl WebhookEvent {
    /// Event name as stored in `webhooks.event_type`.
    pub fn name(&self) -> &'static str {
        match self {
            WebhookEvent::ImportStarted { .. } => "import.started",
            WebhookEvent::ImportCompleted { .. } => "import.completed",
            WebhookEvent::ImportFailed { .. } => "import.failed",
            WebhookEvent::ProductCreated { .. } => "product.created",
        }
    }
}

#[async_trait]
pub trait LifecycleNotifier: Send + Sync {
    async fn notify(&self, event: WebhookEvent);
}

/// Outcome counts of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Posts events to a set of URLs with bounded concurrency.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    max_concurrency: usize,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        Self::with_timeout(config.timeout(), config.max_concurrency)
    }

    pub fn with_timeout(timeout: Duration, max_concurrency: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("catalog-server/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            max_concurrency: max_concurrency.max(1),
        })
    }

    pub async fn dispatch(&self, urls: &[String], event: &WebhookEvent) -> DispatchReport {
        let delivered = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        stream::iter(urls)
            .for_each_concurrent(self.max_concurrency, |url| {
                let delivered = &delivered;
                let failed = &failed;
                async move {
                    let result = self
                        .client
                        .post(url)
                        .json(event)
                        .send()
                        .await
                        .and_then(|response| response.error_for_status());

                    match result {
                        Ok(response) => {
                            debug!(url = %url, status = %response.status(), "Webhook delivered");
                            delivered.fetch_add(1, Ordering::Relaxed);
                        },
                        Err(e) => {
                            warn!(url = %url, event = event.name(), error = %e, "Webhook delivery failed");
                            failed.fetch_add(1, Ordering::Relaxed);
                        },
                    }
                }
            })
            .await;

        DispatchReport {
            attempted: urls.len(),
            delivered: delivered.into_inner(),
            failed: failed.into_inner(),
        }
    }
}

/// Notifier that resolves targets from the `webhooks` table.
#[derive(Clone)]
pub struct WebhookNotifier {
    pool: PgPool,
    dispatcher: WebhookDispatcher,
}

impl WebhookNotifier {
    pub fn new(pool: PgPool, dispatcher: WebhookDispatcher) -> Self {
        Self { pool, dispatcher }
    }

    async fn targets(&self, event_type: &str) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT url FROM webhooks WHERE enabled AND event_type = $1")
            .bind(event_type)
            .fetch_all(&self.pool)
            .await
    }
}

#[async_trait]
impl LifecycleNotifier for WebhookNotifier {
    async fn notify(&self, event: WebhookEvent) {
        let urls = match self.targets(event.name()).await {
            Ok(urls) => urls,
            Err(e) => {
                warn!(event = event.name(), error = %e, "Failed to load webhook targets");
                return;
            },
        };
        if urls.is_empty() {
            return;
        }

        let report = self.dispatcher.dispatch(&urls, &event).await;
        info!(
            event = event.name(),
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            "Webhooks dispatched"
        );
    }
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl LifecycleNotifier for NoopNotifier {
    async fn notify(&self, event: WebhookEvent) {
        debug!(event = event.name(), "Webhooks disabled, event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payload_shape() {
        let job_id = Uuid::nil();
        let json = serde_json::to_value(WebhookEvent::ImportCompleted {
            job_id,
            filename: "catalog.csv".into(),
            total_rows: 3,
            created: 2,
            updated: 1,
        })
        .unwrap();

        assert_eq!(json["event"], "import.completed");
        assert_eq!(json["data"]["filename"], "catalog.csv");
        assert_eq!(json["data"]["created"], 2);
        assert_eq!(json["data"]["job_id"], job_id.to_string());
    }

    #[test]
    fn test_event_names_match_wire_tags() {
        let events = [
            WebhookEvent::ImportStarted {
                job_id: Uuid::nil(),
                filename: "a.csv".into(),
            },
            WebhookEvent::ImportFailed {
                job_id: Uuid::nil(),
                error: "boom".into(),
            },
        ];

        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_no_targets() {
        let dispatcher = WebhookDispatcher::with_timeout(Duration::from_secs(1), 4).unwrap();
        let report = dispatcher
            .dispatch(
                &[],
                &WebhookEvent::ImportFailed {
                    job_id: Uuid::nil(),
                    error: "x".into(),
                },
            )
            .await;
        assert_eq!(report, DispatchReport::default());
    }
}
