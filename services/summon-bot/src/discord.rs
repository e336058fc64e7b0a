//! Discord error-webhook notification sink
//!
//! Every notification is logged and counted like `LogSink`; warnings and
//! critical events are also posted to the webhook as a single embed. The
//! POST runs on its own task and delivery failures are only logged.

use common::{LogSink, Notification, NotificationSink, Secret, Severity};
use serde_json::json;
use tracing::{debug, warn};

/// Discord rejects embed field values longer than 1024 characters
const MAX_FIELD_CHARS: usize = 1000;

pub struct DiscordSink {
    client: reqwest::Client,
    webhook_url: Secret<String>,
}

impl DiscordSink {
    pub fn new(client: reqwest::Client, webhook_url: Secret<String>) -> Self {
        Self {
            client,
            webhook_url,
        }
    }
}

fn color(severity: Severity) -> u32 {
    match severity {
        Severity::Info => 0x00FF00,
        Severity::Warning => 0xFFD700,
        Severity::Critical => 0xE74C3C,
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_FIELD_CHARS {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(MAX_FIELD_CHARS).collect();
    out.push('…');
    out
}

/// Webhook payload for one notification.
pub fn embed_payload(notification: &Notification) -> serde_json::Value {
    let mut fields = vec![json!({
        "name": "Component",
        "value": notification.component,
        "inline": true,
    })];
    if let Some(detail) = &notification.detail {
        fields.push(json!({
            "name": "Details",
            "value": truncate(detail),
            "inline": false,
        }));
    }
    json!({
        "username": "summon-bot",
        "embeds": [{
            "title": format!("[{}] summon-bot", notification.severity.label().to_uppercase()),
            "description": truncate(&notification.message),
            "color": color(notification.severity),
            "fields": fields,
        }],
    })
}

impl NotificationSink for DiscordSink {
    fn notify(&self, notification: Notification) {
        if notification.severity == Severity::Info {
            LogSink.notify(notification);
            return;
        }
        let payload = embed_payload(&notification);
        LogSink.notify(notification);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, discord notification dropped");
            return;
        };
        let client = self.client.clone();
        let url = self.webhook_url.expose().clone();
        runtime.spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => debug!("discord notification delivered"),
                Ok(resp) => warn!(status = resp.status().as_u16(), "discord webhook rejected notification"),
                Err(e) => warn!(error = %e, "discord webhook unreachable"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::routing::post;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn start_webhook_stub() -> (String, mpsc::Receiver<serde_json::Value>) {
        let (tx, rx) = mpsc::channel(8);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/api/webhooks/1/token",
            post(move |Json(body): Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    tx.send(body).await.unwrap();
                    axum::http::StatusCode::NO_CONTENT
                }
            }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}/api/webhooks/1/token"), rx)
    }

    #[test]
    fn embed_carries_severity_component_and_detail() {
        let n = Notification::critical("chat-supervisor", "persistent reconnect failure")
            .with_detail("chat login rejected: Login authentication failed");
        let payload = embed_payload(&n);
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "[CRITICAL] summon-bot");
        assert_eq!(embed["description"], "persistent reconnect failure");
        assert_eq!(embed["color"], 0xE74C3C);
        assert_eq!(embed["fields"][0]["value"], "chat-supervisor");
        assert_eq!(
            embed["fields"][1]["value"],
            "chat login rejected: Login authentication failed"
        );
    }

    #[test]
    fn long_detail_is_truncated() {
        let n = Notification::warning("credential-store", "refresh failed").with_detail("x".repeat(5000));
        let payload = embed_payload(&n);
        let value = payload["embeds"][0]["fields"][1]["value"].as_str().unwrap();
        assert_eq!(value.chars().count(), MAX_FIELD_CHARS + 1);
    }

    #[tokio::test]
    async fn critical_notification_is_posted() {
        let (url, mut rx) = start_webhook_stub().await;
        let sink = DiscordSink::new(reqwest::Client::new(), Secret::new(url));

        sink.notify(Notification::critical("chat-supervisor", "chat down"));

        let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("webhook called")
            .unwrap();
        assert_eq!(body["embeds"][0]["description"], "chat down");
    }

    #[tokio::test]
    async fn info_notification_is_not_posted() {
        let (url, mut rx) = start_webhook_stub().await;
        let sink = DiscordSink::new(reqwest::Client::new(), Secret::new(url));

        sink.notify(Notification::new(Severity::Info, "summon-bot", "started"));

        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "info must stay out of the webhook");
    }

    #[tokio::test]
    async fn unreachable_webhook_is_swallowed() {
        let sink = DiscordSink::new(
            reqwest::Client::new(),
            Secret::new("http://127.0.0.1:1/api/webhooks/1/token".to_owned()),
        );
        sink.notify(Notification::warning("credential-store", "refresh failed"));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
