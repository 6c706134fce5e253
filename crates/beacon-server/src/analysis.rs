//! Analysis trigger: where correlation bundles go after an error arrives.

use beacon_insight::CorrelationBundle;

/// Fire-and-forget consumer of correlation bundles. `submit` must return
/// promptly; slow work belongs on a spawned task.
pub trait AnalysisSink: Send + Sync {
    fn submit(&self, bundle: CorrelationBundle);
}

/// Logs a one-line summary of each bundle.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAnalysisSink;

impl AnalysisSink for LogAnalysisSink {
    fn submit(&self, bundle: CorrelationBundle) {
        let latest = bundle
            .errors
            .first()
            .map(|c| c.kind.as_str())
            .unwrap_or("none");
        tracing::info!(
            subject = %bundle.subject,
            errors = bundle.errors.len(),
            skipped = bundle.skipped,
            has_critical = bundle.has_critical,
            latest,
            "correlation bundle ready for analysis"
        );
    }
}

/// POSTs each bundle as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookAnalysisSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAnalysisSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl AnalysisSink for WebhookAnalysisSink {
    fn submit(&self, bundle: CorrelationBundle) {
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let subject = bundle.subject.clone();
            match client.post(&url).json(&bundle).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(subject = %subject, "analysis webhook accepted bundle");
                }
                Ok(response) => {
                    tracing::warn!(
                        subject = %subject,
                        status = %response.status(),
                        "analysis webhook rejected bundle"
                    );
                }
                Err(e) => {
                    tracing::warn!(subject = %subject, error = %e, "analysis webhook unreachable");
                }
            }
        });
    }
}
