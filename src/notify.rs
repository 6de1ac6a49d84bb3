//! Owner notifications: one aggregated message per reconciliation batch.
//!
//! Delivery is best-effort. Callers log failures and move on; a broken
//! notification channel must never fail a sweep.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_owner(&self, org_id: &str, summary: &str) -> Result<()>;
}

/// Posts batch summaries to a configured webhook as JSON.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: Client,
    endpoint: Url,
}

impl WebhookNotifier {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid notify webhook URL")?;
        let http = Client::builder()
            .user_agent("postline/0.1")
            .build()
            .context("reqwest client")?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_owner(&self, org_id: &str, summary: &str) -> Result<()> {
        // Deduplication key so a retried delivery is not shown twice.
        let body = json!({
            "id": Uuid::new_v4().to_string(),
            "organization_id": org_id,
            "message": summary,
        });
        debug!(url = %self.endpoint, %org_id, "sending owner notification");
        let res = self
            .http
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .context("failed to reach notify webhook")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("notify webhook error {}: {}", status, body));
        }
        Ok(())
    }
}

/// Notifier that drops everything. Used when no webhook is configured and in
/// tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_owner(&self, _org_id: &str, _summary: &str) -> Result<()> {
        Ok(())
    }
}
