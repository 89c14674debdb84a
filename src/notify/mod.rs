// pgvault/src/notify/mod.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backup::{BackupRun, RunStatus};
use crate::errors::{AppError, Result};
use crate::restore::RestoreOutcome;
use crate::snapshot::human_size;

const COLOR_SUCCESS: u32 = 0x2ECC71;
const COLOR_FAILURE: u32 = 0xE74C3C;
/// Chat embeds reject long field values.
const MAX_FIELD_LEN: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Presentation-neutral message; the webhook backend maps it to a JSON embed.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<Field>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    fn field(mut self, name: &str, value: impl Into<String>, inline: bool) -> Self {
        let mut value: String = value.into();
        if value.len() > MAX_FIELD_LEN {
            let mut cut = MAX_FIELD_LEN;
            while !value.is_char_boundary(cut) {
                cut -= 1;
            }
            value.truncate(cut);
            value.push('…');
        }
        self.fields.push(Field {
            name: name.to_string(),
            value,
            inline,
        });
        self
    }

    pub fn field_value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "embeds": [{
                "title": self.title,
                "description": self.description,
                "color": self.color,
                "fields": self.fields,
                "timestamp": self.timestamp.to_rfc3339(),
            }]
        })
    }
}

pub fn backup_message(run: &BackupRun) -> Notification {
    let success = run.status == RunStatus::Success;
    let mut message = Notification {
        title: if success {
            "✅ Database backup succeeded".to_string()
        } else {
            "❌ Database backup failed".to_string()
        },
        description: match &run.snapshot {
            Some(s) if success => format!("Snapshot `{}` uploaded.", s.name),
            _ => "No new snapshot was stored. Existing snapshots were left untouched.".to_string(),
        },
        color: if success { COLOR_SUCCESS } else { COLOR_FAILURE },
        fields: Vec::new(),
        timestamp: run.finished_at.unwrap_or(run.started_at),
    }
    .field("Outcome", format!("{:?}", run.status), true)
    .field(
        "Snapshot",
        run.snapshot.as_ref().map_or("-".to_string(), |s| s.name.clone()),
        true,
    )
    .field(
        "Size",
        run.snapshot
            .as_ref()
            .map_or("-".to_string(), |s| human_size(s.size_bytes)),
        true,
    )
    .field(
        "Total snapshots",
        run.total_snapshot_count
            .map_or("unknown".to_string(), |n| n.to_string()),
        true,
    )
    .field("Retention", format!("{} days", run.retention_days), true)
    .field("Pruned", run.deleted_count.to_string(), true)
    .field("Run", run.run_id.to_string(), false);

    if let Some(duration) = run.duration() {
        message = message.field("Duration", format!("{}s", duration.num_seconds()), true);
    }
    if let Some(error) = &run.error_detail {
        message = message.field("Error", error.clone(), false);
    }
    message
}

pub fn restore_message(outcome: &RestoreOutcome) -> Notification {
    let success = outcome.error_detail.is_none();
    let mut message = Notification {
        title: if success {
            "✅ Database restore completed".to_string()
        } else {
            "❌ Database restore failed".to_string()
        },
        description: match &outcome.snapshot {
            Some(s) => format!("Snapshot `{}`", s.name),
            None => "No snapshot resolved.".to_string(),
        },
        color: if success { COLOR_SUCCESS } else { COLOR_FAILURE },
        fields: Vec::new(),
        timestamp: Utc::now(),
    }
    .field("Final state", format!("{:?}", outcome.final_state), true)
    .field(
        "Databases",
        if outcome.databases.is_empty() {
            "-".to_string()
        } else {
            outcome.databases.join(", ")
        },
        true,
    )
    .field("Run", outcome.run_id.to_string(), false);
    if let Some(error) = &outcome.error_detail {
        message = message.field("Error", error.clone(), false);
    }
    message
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Posts an embed payload to a chat webhook (Discord/Slack-compatible).
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("pgvault/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Notification(e.to_string()))?;
        Ok(WebhookNotifier {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&notification.to_payload())
            .send()
            .await
            .map_err(|e| AppError::Notification(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Notification(format!(
                "webhook returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Used when no webhook URL is configured.
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        debug!("Notifications disabled, dropping: {}", notification.title);
        Ok(())
    }
}

pub fn build_notifier(webhook_url: Option<&str>, timeout: Duration) -> Box<dyn Notifier> {
    match webhook_url.map(|url| WebhookNotifier::new(url, timeout)) {
        Some(Ok(notifier)) => Box::new(notifier),
        Some(Err(e)) => {
            warn!("Webhook notifier unavailable, continuing without it: {}", e);
            Box::new(DisabledNotifier)
        }
        None => Box::new(DisabledNotifier),
    }
}

/// Best-effort delivery: a lost notification is logged and never turns a
/// successful run into a failed one. Returns whether it was delivered.
pub async fn deliver(notifier: &dyn Notifier, notification: &Notification) -> bool {
    match notifier.send(notification).await {
        Ok(()) => {
            info!("Notification sent: {}", notification.title);
            true
        }
        Err(e) => {
            warn!("Failed to send notification ({}): {}", notification.title, e);
            false
        }
    }
}

pub async fn notify_backup(notifier: &dyn Notifier, run: &BackupRun) -> bool {
    deliver(notifier, &backup_message(run)).await
}

pub async fn notify_restore(notifier: &dyn Notifier, outcome: &RestoreOutcome) -> bool {
    deliver(notifier, &restore_message(outcome)).await
}
