//! Notifier backends.

use async_trait::async_trait;
use buildfarm_core::notify::{BuildNotification, Notifier};
use buildfarm_core::worker::Worker;
use buildfarm_core::{Error, Result};
use serde::Serialize;
use tracing::{error, info};

/// Writes notifications to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &BuildNotification) -> Result<()> {
        info!(build_id = %n.build_id, status = %n.status, title = %n.title, "Build notification");
        Ok(())
    }

    async fn worker_disabled(&self, worker: &Worker, reason: &str) -> Result<()> {
        error!(worker = %worker.name, reason, "Worker disabled");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WebhookEvent<'a> {
    BuildStatus(&'a BuildNotification),
    WorkerDisabled { worker: &'a str, reason: &'a str },
}

/// POSTs notifications as JSON to a webhook, and logs them.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    log: LogNotifier,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            log: LogNotifier,
        }
    }

    async fn post(&self, event: &WebhookEvent<'_>) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("webhook {}: {}", self.url, e)))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "webhook {} returned {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: &BuildNotification) -> Result<()> {
        self.log.notify(n).await?;
        self.post(&WebhookEvent::BuildStatus(n)).await
    }

    async fn worker_disabled(&self, worker: &Worker, reason: &str) -> Result<()> {
        self.log.worker_disabled(worker, reason).await?;
        self.post(&WebhookEvent::WorkerDisabled {
            worker: &worker.name,
            reason,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use buildfarm_core::BuildId;
    use buildfarm_core::build::BuildStatus;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_webhook_posts_build_event() {
        let seen = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));
        let sink = Arc::clone(&seen);
        let router = Router::new().route(
            "/hook",
            post(move |Json(body): Json<serde_json::Value>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(body);
                    "ok"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let notifier = WebhookNotifier::new(format!("http://{}/hook", addr));
        let notification = BuildNotification {
            build_id: BuildId::new(42),
            title: "i386 build of hello 2.10-1 in primary noble".to_string(),
            status: BuildStatus::ChrootWait,
            dependencies: None,
            log_url: None,
        };
        notifier.notify(&notification).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["event"], "build_status");
        assert_eq!(seen[0]["status"], "CHROOTWAIT");
        assert_eq!(seen[0]["build_id"], 42);
    }
}
