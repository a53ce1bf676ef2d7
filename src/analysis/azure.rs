//! Azure Document Intelligence provider (REST analyze + operation polling).

use super::{AnalyzeResult, DocumentAnalyzer};
use crate::config::AnalysisSettings;
use crate::routing::ModelRoute;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const OPERATION_LOCATION: &str = "Operation-Location";

pub struct AzureAnalyzer {
    client: reqwest::Client,
    settings: AnalysisSettings,
}

impl AzureAnalyzer {
    pub fn new(client: reqwest::Client, settings: AnalysisSettings) -> Self {
        Self { client, settings }
    }

    fn analyze_url(&self, route: &ModelRoute) -> String {
        format!(
            "{}/formrecognizer/documentModels/{}:analyze?api-version={}",
            route.endpoint, route.model_id, self.settings.api_version
        )
    }
}

// ── Operation polling types ─────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationStatus {
    status: String,
    #[serde(default)]
    error: Option<ServiceError>,
    #[serde(default)]
    analyze_result: Option<AnalyzeResult>,
}

#[derive(Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

// ── Provider implementation ─────────────────────────────────────────────────

#[async_trait::async_trait]
impl DocumentAnalyzer for AzureAnalyzer {
    fn name(&self) -> &str {
        "azure_document_intelligence"
    }

    async fn analyze(
        &self,
        route: &ModelRoute,
        filename: &str,
        data: &[u8],
    ) -> Result<AnalyzeResult> {
        info!(
            "AzureAnalyzer: submitting {} ({} bytes) to model {}",
            filename,
            data.len(),
            route.model_id
        );

        let resp = self
            .client
            .post(self.analyze_url(route))
            .header(KEY_HEADER, &route.api_key)
            .header(CONTENT_TYPE, content_type_for(filename))
            .body(data.to_vec())
            .send()
            .await
            .context("Analyze request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Analysis service error ({}): {}", status, text);
        }

        let operation_url = resp
            .headers()
            .get(OPERATION_LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .context("Analysis service did not return an Operation-Location header")?;

        debug!("AzureAnalyzer: polling {}", operation_url);
        self.wait_for_result(route, &operation_url).await
    }
}

impl AzureAnalyzer {
    /// Poll the operation until it succeeds, fails, or the poll budget runs out.
    async fn wait_for_result(&self, route: &ModelRoute, operation_url: &str) -> Result<AnalyzeResult> {
        for attempt in 1..=self.settings.max_polls {
            let resp = self
                .client
                .get(operation_url)
                .header(KEY_HEADER, &route.api_key)
                .send()
                .await
                .context("Failed to query analysis operation")?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!("Analysis operation query failed ({}): {}", status, text);
            }

            let delay = retry_after(resp.headers()).unwrap_or(self.settings.poll_interval);
            let op: OperationStatus = resp
                .json()
                .await
                .context("Failed to parse analysis operation status")?;

            match op.status.as_str() {
                "succeeded" => {
                    let result = op
                        .analyze_result
                        .context("Analysis succeeded without an analyzeResult")?;
                    info!(
                        "AzureAnalyzer: model {} returned {} document(s) after {} poll(s)",
                        route.model_id,
                        result.documents.len(),
                        attempt
                    );
                    return Ok(result);
                }
                "failed" | "canceled" => {
                    let (code, message) = op
                        .error
                        .map(|e| (e.code, e.message))
                        .unwrap_or_default();
                    anyhow::bail!(
                        "Analysis with model {} {}: {} {}",
                        route.model_id,
                        op.status,
                        code,
                        message
                    );
                }
                "notStarted" | "running" => {
                    debug!("Operation is {}... waiting", op.status);
                }
                other => {
                    warn!("Unexpected operation status: {}", other);
                }
            }

            tokio::time::sleep(delay).await;
        }

        anyhow::bail!(
            "Timed out waiting for model {} after {} polls",
            route.model_id,
            self.settings.max_polls
        )
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn content_type_for(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    if lower.ends_with(".pdf") {
        "application/pdf"
    } else if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".tif") || lower.ends_with(".tiff") {
        "image/tiff"
    } else if lower.ends_with(".bmp") {
        "image/bmp"
    } else {
        "application/octet-stream"
    }
}
