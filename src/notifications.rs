//! Operator notifications for background lifecycle events.
//!
//! The reaper and the orphan detector report what they did through a
//! `Notifier`. Each event kind maps to one configured target:
//! `"webhook:<url>"`, a bare http(s) URL, `"desktop"`, or `"none"`.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::process::Command;
use tracing::{debug, warn};

use crate::config::NotificationConfig;

/// Notification event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotificationEvent {
    /// The idle reaper paused or destroyed sessions.
    Reaped,
    /// The orphan detector found unmanaged instances.
    Orphans,
}

impl NotificationEvent {
    fn as_str(self) -> &'static str {
        match self {
            Self::Reaped => "reaped",
            Self::Orphans => "orphans",
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::Reaped => "leasehold: sessions reaped",
            Self::Orphans => "leasehold: orphaned instances",
        }
    }
}

/// Sends notifications based on configuration.
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    config: NotificationConfig,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn target(&self, event: NotificationEvent) -> Option<&str> {
        match event {
            NotificationEvent::Reaped => self.config.on_reap.as_deref(),
            NotificationEvent::Orphans => self.config.on_orphan.as_deref(),
        }
    }

    /// Fire-and-forget: failures are logged, never returned.
    pub async fn notify(&self, event: NotificationEvent, details: &NotificationDetails) {
        let Some(target) = self.target(event) else {
            return;
        };
        match parse_target(target) {
            Target::Webhook(url) => {
                if let Err(e) = self.send_webhook(url, event, details).await {
                    warn!("Failed to send {} webhook: {}", event.as_str(), e);
                }
            }
            Target::Desktop => {
                if let Err(e) = send_desktop_notification(event.title(), &details.message) {
                    warn!("Failed to send desktop notification: {}", e);
                }
            }
            Target::Disabled => {}
            Target::Invalid => warn!("Ignoring unrecognized notification target '{}'", target),
        }
    }

    /// POSTs the event, retrying 5xx and 429 with exponential backoff.
    #[allow(tail_expr_drop_order)]
    async fn send_webhook(
        &self,
        url: &str,
        event: NotificationEvent,
        details: &NotificationDetails,
    ) -> Result<()> {
        let payload = json!({
            "event": event.as_str(),
            "message": details.message,
            "timestamp": details.timestamp,
            "context": details.context,
        });
        debug!("Sending webhook to {}: {:?}", url, payload);

        let max_attempts = 3;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay_secs = 1u64 << attempt;
                debug!("Webhook retry attempt {} after {}s", attempt + 1, delay_secs);
                tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
            }

            match self.client.post(url).json(&payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!("Webhook sent");
                        return Ok(());
                    }
                    let body = response.text().await.unwrap_or_default();
                    if status.is_server_error() || status.as_u16() == 429 {
                        last_error = Some(format!("Webhook returned {status}: {body}"));
                        continue;
                    }
                    anyhow::bail!("Webhook returned error status {status}: {body}");
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        anyhow::bail!(
            "Webhook failed after {max_attempts} attempts: {}",
            last_error.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Target<'a> {
    Webhook(&'a str),
    Desktop,
    Disabled,
    Invalid,
}

fn parse_target(value: &str) -> Target<'_> {
    if let Some(url) = value.strip_prefix("webhook:") {
        if url.is_empty() {
            Target::Invalid
        } else {
            Target::Webhook(url)
        }
    } else if value.starts_with("http://") || value.starts_with("https://") {
        Target::Webhook(value)
    } else if value == "desktop" {
        Target::Desktop
    } else if value == "none" || value.is_empty() {
        Target::Disabled
    } else {
        Target::Invalid
    }
}

fn send_desktop_notification(title: &str, body: &str) -> Result<()> {
    if Command::new("notify-send")
        .args([title, body])
        .output()
        .is_ok()
    {
        return Ok(());
    }

    if Command::new("osascript")
        .args([
            "-e",
            &format!(
                "display notification \"{}\" with title \"{}\"",
                body.replace('"', "\\\""),
                title.replace('"', "\\\"")
            ),
        ])
        .output()
        .is_ok()
    {
        return Ok(());
    }

    anyhow::bail!("No desktop notification command available (tried notify-send, osascript)");
}

/// Payload of one notification.
#[derive(Debug, Clone)]
pub(crate) struct NotificationDetails {
    pub message: String,
    pub timestamp: String,
    pub context: Option<serde_json::Value>,
}

impl NotificationDetails {
    pub fn reaped(paused: usize, destroyed: usize) -> Self {
        Self {
            message: format!("Reaper paused {paused} and destroyed {destroyed} sessions"),
            timestamp: Utc::now().to_rfc3339(),
            context: Some(json!({ "paused": paused, "destroyed": destroyed })),
        }
    }

    pub fn orphans(provider: &str, instance_ids: &[String]) -> Self {
        Self {
            message: format!(
                "{} unmanaged {} instance(s): {}",
                instance_ids.len(),
                provider,
                instance_ids.join(", ")
            ),
            timestamp: Utc::now().to_rfc3339(),
            context: Some(json!({ "provider": provider, "instances": instance_ids })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("webhook:https://example.com/hook"),
            Target::Webhook("https://example.com/hook")
        );
        assert_eq!(
            parse_target("https://example.com/hook"),
            Target::Webhook("https://example.com/hook")
        );
        assert_eq!(parse_target("desktop"), Target::Desktop);
        assert_eq!(parse_target("none"), Target::Disabled);
        assert_eq!(parse_target("webhook:"), Target::Invalid);
        assert_eq!(parse_target("pager"), Target::Invalid);
    }

    #[test]
    fn test_details_reaped() {
        let details = NotificationDetails::reaped(2, 1);
        assert_eq!(details.message, "Reaper paused 2 and destroyed 1 sessions");
        assert_eq!(details.context.unwrap()["destroyed"], 1);
    }

    #[test]
    fn test_details_orphans() {
        let ids = vec!["c1".to_string(), "c2".to_string()];
        let details = NotificationDetails::orphans("docker", &ids);
        assert!(details.message.starts_with("2 unmanaged docker"));
        assert_eq!(details.context.unwrap()["instances"][1], "c2");
    }

    #[test]
    fn test_target_per_event() {
        let notifier = Notifier::new(NotificationConfig {
            on_reap: Some("none".to_string()),
            on_orphan: None,
        });
        assert_eq!(notifier.target(NotificationEvent::Reaped), Some("none"));
        assert_eq!(notifier.target(NotificationEvent::Orphans), None);
    }

    #[tokio::test]
    async fn test_notify_unconfigured_is_noop() {
        let notifier = Notifier::new(NotificationConfig::default());
        notifier
            .notify(NotificationEvent::Reaped, &NotificationDetails::reaped(0, 0))
            .await;
    }

    #[tokio::test]
    async fn test_notify_invalid_target_does_not_panic() {
        let notifier = Notifier::new(NotificationConfig {
            on_reap: Some("webhook:".to_string()),
            on_orphan: None,
        });
        notifier
            .notify(NotificationEvent::Reaped, &NotificationDetails::reaped(1, 0))
            .await;
    }
}
