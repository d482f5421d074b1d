use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::listing::Item;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    NewItem {
        owner_id: i64,
        task_id: i64,
        task_name: String,
        item: Item,
    },
    SubscriptionExpired {
        user_id: i64,
        expired_at: DateTime<Utc>,
    },
}

/// Delivery of notifications to users. Failures are reported, never retried.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

pub fn create_notifier(webhook_url: Option<&str>) -> Result<Box<dyn Notifier>> {
    match webhook_url {
        Some(url) => Ok(Box::new(WebhookNotifier::new(url)?)),
        None => Ok(Box::new(LogNotifier)),
    }
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::NewItem {
                owner_id,
                task_name,
                item,
                ..
            } => tracing::info!(
                owner_id,
                item_id = item.id,
                "[{task_name}] {} | {}",
                item.price,
                item.location
            ),
            Notification::SubscriptionExpired {
                user_id,
                expired_at,
            } => tracing::info!(user_id, %expired_at, "Subscription expired"),
        }
        Ok(())
    }
}

/// POSTs each notification as JSON to a fixed URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let resp = self.client.post(&self.url).json(notification).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("Webhook error: {} {}", resp.status(), resp.text().await?);
        }
        Ok(())
    }
}
