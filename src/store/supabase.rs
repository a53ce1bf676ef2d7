//! Supabase (PostgREST) backed store. Schema: `migrations/001_billing.sql`.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    billing_period_end, month_key, ApiCallRecord, DocumentRecord, DocumentStatus, NewApiCall,
    NewDocument, StatisticsDelta, Store, StoreError, StoreResult, UserStatistic,
};
use crate::config::SupabaseSettings;

const INCREMENT_RPC: &str = "increment_user_statistics";
const MERGE_STATUS_RPC: &str = "merge_document_status";

/// PostgREST `eq.` filter operand, percent-encoded so the value cannot
/// introduce extra query parameters, operators or a fragment.
fn eq(value: &str) -> String {
    format!("eq.{}", urlencoding::encode(value))
}

#[derive(Clone)]
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseStore {
    pub fn new(client: Client, settings: &SupabaseSettings) -> Self {
        Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            service_role_key: settings.service_role_key.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let resp = self
            .authorized(self.client.get(self.url(path)))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Supabase GET {} failed: {} - {}", path, status, text));
        }

        Ok(resp.json().await?)
    }

    /// POST (insert or RPC) without reading the response body.
    async fn post_json(&self, path: &str, body: &Value) -> anyhow::Result<()> {
        let resp = self
            .authorized(self.client.post(self.url(path)))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Supabase POST {} failed: {} - {}", path, status, text));
        }

        Ok(())
    }

    /// Call a database function and read its result rows.
    async fn rpc_json<T: DeserializeOwned>(&self, function: &str, params: &Value) -> anyhow::Result<T> {
        let path = format!("rpc/{}", function);
        let resp = self
            .authorized(self.client.post(self.url(&path)))
            .header("Content-Type", "application/json")
            .json(params)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Supabase RPC {} failed: {} - {}", function, status, text));
        }

        Ok(resp.json().await?)
    }
}

fn document_row(id: &str, doc: &NewDocument, now: DateTime<Utc>) -> Value {
    json!({
        "id": id,
        "user_id": doc.user_id,
        "document_name": doc.document_name,
        "processing_timestamp": now,
        "status": doc.status,
        "size": doc.size,
        "type": doc.doc_type,
        "number_of_pages": doc.number_of_pages,
        "processing_duration": doc.processing_duration,
        "content_hash": doc.content_hash,
        "form_id": doc.form_id,
    })
}

/// Arguments of the `merge_document_status` database function.
fn merge_params(
    user_id: &str,
    document_id: Uuid,
    status: DocumentStatus,
    processing_duration: f64,
) -> Value {
    json!({
        "p_document_id": document_id,
        "p_user_id": user_id,
        "p_status": status,
        "p_duration": processing_duration,
    })
}

/// Arguments of the `increment_user_statistics` database function.
fn increment_params(user_id: &str, delta: StatisticsDelta, now: DateTime<Utc>) -> Value {
    json!({
        "p_user_id": user_id,
        "p_month": month_key(now),
        "p_period_start": now,
        "p_period_end": billing_period_end(now),
        "p_documents": delta.documents,
        "p_api_calls": delta.api_calls,
    })
}

#[async_trait::async_trait]
impl Store for SupabaseStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn insert_document(&self, doc: NewDocument) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        debug!("Inserting document: {}", id);
        self.post_json("documents", &document_row(&id, &doc, Utc::now()))
            .await
            .context("Failed to insert document")?;
        Ok(id)
    }

    async fn update_document(
        &self,
        user_id: &str,
        document_id: &str,
        status: DocumentStatus,
        processing_duration: f64,
    ) -> StoreResult<DocumentRecord> {
        let id = Uuid::parse_str(document_id)
            .map_err(|_| StoreError::DocumentNotFound(document_id.to_string()))?;

        // merge and duration add happen in one UPDATE on the database side
        let rows: Vec<DocumentRecord> = self
            .rpc_json(
                MERGE_STATUS_RPC,
                &merge_params(user_id, id, status, processing_duration),
            )
            .await
            .context("Failed to update document")?;

        let record = rows
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::DocumentNotFound(document_id.to_string()))?;
        info!("Document {} status now {}", document_id, record.status.as_str());
        Ok(record)
    }

    async fn log_api_call(&self, call: NewApiCall) -> StoreResult<()> {
        let body = json!({
            "id": Uuid::new_v4().to_string(),
            "document_id": call.document_id,
            "user_id": call.user_id,
            "api_endpoint": call.api_endpoint,
            "timestamp": Utc::now(),
            "status": call.status,
            "api_calls_count": 1,
        });
        self.post_json("api_calls", &body)
            .await
            .context("Failed to log API call")?;
        Ok(())
    }

    async fn log_audit(&self, user_id: &str, event_type: &str, event_details: &str) -> StoreResult<()> {
        let body = json!({
            "id": Uuid::new_v4().to_string(),
            "user_id": user_id,
            "event_type": event_type,
            "event_details": event_details,
            "timestamp": Utc::now(),
        });
        self.post_json("audit_logs", &body)
            .await
            .context("Failed to write audit log")?;
        Ok(())
    }

    async fn increment_statistics(
        &self,
        user_id: &str,
        delta: StatisticsDelta,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.post_json(
            &format!("rpc/{}", INCREMENT_RPC),
            &increment_params(user_id, delta, now),
        )
        .await
        .context("Failed to increment user statistics")?;
        Ok(())
    }

    async fn latest_statistics(&self, user_id: &str) -> StoreResult<Option<UserStatistic>> {
        let rows: Vec<UserStatistic> = self
            .get_json(&format!(
                "user_statistics?user_id={}&order=month.desc&limit=1",
                eq(user_id)
            ))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_documents(&self, user_id: &str, limit: usize) -> StoreResult<Vec<DocumentRecord>> {
        Ok(self
            .get_json(&format!(
                "documents?user_id={}&order=processing_timestamp.desc&limit={}",
                eq(user_id),
                limit
            ))
            .await?)
    }

    async fn list_api_calls(&self, user_id: &str, limit: usize) -> StoreResult<Vec<ApiCallRecord>> {
        Ok(self
            .get_json(&format!(
                "api_calls?user_id={}&order=timestamp.desc&limit={}",
                eq(user_id),
                limit
            ))
            .await?)
    }
}
