//! Alert egress boundary.
//!
//! Delivery (SMTP, push, chat) belongs to an external collaborator behind
//! the [`Notifier`] trait. The kernel only decides *whether* an alert goes
//! out: [`AlertGate`] suppresses repeats of the same incident inside a
//! cooldown window, so a job that fails every five minutes pages once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

use crate::common::Severity;

/// Structured alert handed to the delivery collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub job_id: String,
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Default sink: structured log lines only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        warn!(
            severity = %alert.severity,
            job_id = %alert.job_id,
            execution_id = %alert.execution_id,
            title = %alert.title,
            body = %alert.body,
            "alert"
        );
        Ok(())
    }
}

/// Collecting sink for tests.
#[derive(Default)]
pub struct CollectingNotifier {
    pub alerts: Mutex<Vec<Alert>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        self.alerts.lock().await.push(alert.clone());
        Ok(())
    }
}

/// At-most-once-per-incident gate in front of a [`Notifier`].
///
/// An incident is identified by (job id, title); repeats inside the
/// cooldown window are dropped.
pub struct AlertGate {
    notifier: std::sync::Arc<dyn Notifier>,
    cooldown: Duration,
    recent: Mutex<HashMap<(String, String), Instant>>,
}

impl AlertGate {
    pub fn new(notifier: std::sync::Arc<dyn Notifier>, cooldown: Duration) -> Self {
        Self {
            notifier,
            cooldown,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Raise an alert unless the same incident fired within the cooldown.
    /// Returns whether the alert was delivered.
    pub async fn raise(&self, alert: Alert) -> bool {
        let key = (alert.job_id.clone(), alert.title.clone());
        {
            let mut recent = self.recent.lock().await;
            let now = Instant::now();
            if let Some(last) = recent.get(&key) {
                if now.duration_since(*last) < self.cooldown {
                    return false;
                }
            }
            recent.insert(key, now);
            recent.retain(|_, t| now.duration_since(*t) < self.cooldown);
        }

        if let Err(err) = self.notifier.deliver(&alert).await {
            error!(error = %err, job_id = %alert.job_id, "alert delivery failed");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn alert(job_id: &str, title: &str) -> Alert {
        Alert {
            severity: Severity::High,
            title: title.into(),
            body: "details".into(),
            job_id: job_id.into(),
            execution_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn repeats_inside_the_cooldown_are_dropped() {
        let sink = Arc::new(CollectingNotifier::new());
        let gate = AlertGate::new(sink.clone(), Duration::from_secs(60));

        assert!(gate.raise(alert("job-a", "failed")).await);
        assert!(!gate.raise(alert("job-a", "failed")).await);
        assert_eq!(sink.alerts.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn distinct_incidents_pass_independently() {
        let sink = Arc::new(CollectingNotifier::new());
        let gate = AlertGate::new(sink.clone(), Duration::from_secs(60));

        assert!(gate.raise(alert("job-a", "failed")).await);
        assert!(gate.raise(alert("job-b", "failed")).await);
        assert!(gate.raise(alert("job-a", "timed out")).await);
        assert_eq!(sink.alerts.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn incidents_fire_again_after_the_cooldown() {
        let sink = Arc::new(CollectingNotifier::new());
        let gate = AlertGate::new(sink.clone(), Duration::from_millis(10));

        assert!(gate.raise(alert("job-a", "failed")).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.raise(alert("job-a", "failed")).await);
    }
}
