//! Best-effort refresh signal to the cluster reconciler.
//!
//! Reconcilers poll the manifest repository on their own schedule, so a
//! missed signal only delays convergence. Failures are reported as warnings
//! and never fail a run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::Environment;

/// The application set a refresh is requested for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterTarget {
    pub application_set: String,
    pub environment: Environment,
}

impl ClusterTarget {
    pub fn new(application_set: impl Into<String>, environment: Environment) -> Self {
        Self {
            application_set: application_set.into(),
            environment,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("reconciler unreachable: {0}")]
    Transport(String),

    #[error("reconciler answered {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("reconciler did not answer within {secs}s")]
    Timeout { secs: u64 },
}

/// The external cluster reconciler.
#[async_trait]
pub trait ClusterReconciler: Send + Sync {
    async fn refresh(&self, target: &ClusterTarget) -> Result<(), ReconcileError>;
}

/// Outcome of a refresh attempt. There is no failure variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum ReconcileStatus {
    Signalled,
    Warned(String),
}

/// Sends one refresh signal under a short timeout.
#[derive(Clone)]
pub struct ReconciliationNotifier {
    reconciler: Arc<dyn ClusterReconciler>,
    timeout: Duration,
}

impl ReconciliationNotifier {
    pub fn new(reconciler: Arc<dyn ClusterReconciler>, timeout: Duration) -> Self {
        Self {
            reconciler,
            timeout,
        }
    }

    /// Single attempt, no retry.
    pub async fn notify(&self, target: &ClusterTarget) -> ReconcileStatus {
        let result = match tokio::time::timeout(self.timeout, self.reconciler.refresh(target)).await
        {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        };

        match result {
            Ok(()) => {
                info!(application_set = %target.application_set, "reconciler refresh signalled");
                ReconcileStatus::Signalled
            }
            Err(e) => {
                warn!(
                    application_set = %target.application_set,
                    error = %e,
                    "reconciler refresh failed; cluster will converge on its next poll"
                );
                ReconcileStatus::Warned(e.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP adapter
// ---------------------------------------------------------------------------

/// Requests an application-set refresh over the reconciler's HTTP API.
pub struct HttpReconciler {
    endpoint: String,
    token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpReconciler {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: None,
            http_client: reqwest::Client::new(),
        }
    }

    /// Set bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn refresh_url(&self, target: &ClusterTarget) -> String {
        format!(
            "{}/api/v1/applicationsets/{}/refresh",
            self.endpoint, target.application_set
        )
    }
}

#[async_trait]
impl ClusterReconciler for HttpReconciler {
    async fn refresh(&self, target: &ClusterTarget) -> Result<(), ReconcileError> {
        let mut request = self
            .http_client
            .post(self.refresh_url(target))
            .json(&serde_json::json!({ "environment": target.environment }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReconcileError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ReconcileError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target() -> ClusterTarget {
        ClusterTarget::new("ice-pulse", Environment::Staging)
    }

    #[tokio::test]
    async fn test_refresh_posts_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/applicationsets/ice-pulse/refresh"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reconciler = HttpReconciler::new(format!("{}/", server.uri())).with_token("s3cret");
        let notifier = ReconciliationNotifier::new(Arc::new(reconciler), Duration::from_secs(5));
        assert_eq!(notifier.notify(&target()).await, ReconcileStatus::Signalled);
    }

    #[tokio::test]
    async fn test_rejection_is_a_warning() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let notifier = ReconciliationNotifier::new(
            Arc::new(HttpReconciler::new(server.uri())),
            Duration::from_secs(5),
        );
        match notifier.notify(&target()).await {
            ReconcileStatus::Warned(message) => {
                assert!(message.contains("503"));
                assert!(message.contains("maintenance"));
            }
            other => panic!("expected warning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_reconciler_times_out_as_warning() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let notifier = ReconciliationNotifier::new(
            Arc::new(HttpReconciler::new(server.uri())),
            Duration::from_millis(100),
        );
        assert!(matches!(
            notifier.notify(&target()).await,
            ReconcileStatus::Warned(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_reconciler_is_a_warning() {
        let notifier = ReconciliationNotifier::new(
            Arc::new(HttpReconciler::new("http://127.0.0.1:1")),
            Duration::from_secs(2),
        );
        assert!(matches!(
            notifier.notify(&target()).await,
            ReconcileStatus::Warned(_)
        ));
    }
}
