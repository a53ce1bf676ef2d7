//! Processing and billing records.
//!
//! [`Store`] is implemented by [`memory::MemoryStore`] (tests, local runs)
//! and [`supabase::SupabaseStore`] (PostgREST). Statistics increments must be
//! atomic in the backing store; callers never read-modify-write totals.

pub mod memory;
pub mod supabase;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Processing outcome of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Processing,
    Processed,
    Failed,
    PartiallyProcessed,
}

impl DocumentStatus {
    /// Status after applying `new` on top of `prior`: one success and one
    /// failure make a partial result; otherwise the new status wins.
    pub fn merge(prior: DocumentStatus, new: DocumentStatus) -> DocumentStatus {
        use DocumentStatus::*;
        match (prior, new) {
            (Processed, Failed) | (Failed, Processed) => PartiallyProcessed,
            (_, new) => new,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::PartiallyProcessed => "partially_processed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiCallStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub user_id: String,
    pub document_name: String,
    pub processing_timestamp: DateTime<Utc>,
    pub status: DocumentStatus,
    pub size: u64,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub number_of_pages: u32,
    /// Seconds spent in the analysis service, accumulated across passes.
    pub processing_duration: f64,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub form_id: Option<u8>,
}

/// Fields supplied when a document is first recorded.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub user_id: String,
    pub document_name: String,
    pub status: DocumentStatus,
    pub size: u64,
    pub doc_type: String,
    pub number_of_pages: u32,
    pub processing_duration: f64,
    pub content_hash: Option<String>,
    pub form_id: Option<u8>,
}

impl NewDocument {
    pub fn into_record(self, id: String, now: DateTime<Utc>) -> DocumentRecord {
        DocumentRecord {
            id,
            user_id: self.user_id,
            document_name: self.document_name,
            processing_timestamp: now,
            status: self.status,
            size: self.size,
            doc_type: self.doc_type,
            number_of_pages: self.number_of_pages,
            processing_duration: self.processing_duration,
            content_hash: self.content_hash,
            form_id: self.form_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallRecord {
    pub id: String,
    pub document_id: Option<String>,
    pub user_id: String,
    pub api_endpoint: String,
    pub timestamp: DateTime<Utc>,
    pub status: ApiCallStatus,
    #[serde(default = "one")]
    pub api_calls_count: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct NewApiCall {
    pub user_id: String,
    pub document_id: Option<String>,
    pub api_endpoint: String,
    pub status: ApiCallStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub user_id: String,
    pub event_type: String,
    pub event_details: String,
    pub timestamp: DateTime<Utc>,
}

/// Monthly usage totals for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatistic {
    pub user_id: String,
    /// `YYYY-MM`
    pub month: String,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub total_documents_processed: i64,
    pub total_api_calls: i64,
}

/// Amounts added to a user's monthly totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsDelta {
    pub documents: i64,
    pub api_calls: i64,
}

impl StatisticsDelta {
    pub fn new(documents: i64, api_calls: i64) -> Self {
        Self {
            documents,
            api_calls,
        }
    }
}

/// `YYYY-MM` of `now`.
pub fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// 23:59:59 UTC on the last day of `now`'s month.
pub fn billing_period_end(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let last_day = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first_of_next| first_of_next.pred_opt())
        .unwrap_or_else(|| now.date_naive());
    let end = last_day.and_hms_opt(23, 59, 59).unwrap_or_default();
    Utc.from_utc_datetime(&end)
}

/// Persistence operations used by the HTTP handlers.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    /// Record a processed document; returns its id.
    async fn insert_document(&self, doc: NewDocument) -> StoreResult<String>;

    /// Apply another processing pass to an existing document: the status is
    /// merged and the duration added.
    async fn update_document(
        &self,
        user_id: &str,
        document_id: &str,
        status: DocumentStatus,
        processing_duration: f64,
    ) -> StoreResult<DocumentRecord>;

    async fn log_api_call(&self, call: NewApiCall) -> StoreResult<()>;

    async fn log_audit(&self, user_id: &str, event_type: &str, event_details: &str) -> StoreResult<()>;

    /// Atomically add `delta` to the user's totals for `now`'s month,
    /// creating the month's row if needed.
    async fn increment_statistics(
        &self,
        user_id: &str,
        delta: StatisticsDelta,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Most recent month's statistics.
    async fn latest_statistics(&self, user_id: &str) -> StoreResult<Option<UserStatistic>>;

    async fn list_documents(&self, user_id: &str, limit: usize) -> StoreResult<Vec<DocumentRecord>>;

    async fn list_api_calls(&self, user_id: &str, limit: usize) -> StoreResult<Vec<ApiCallRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use DocumentStatus::*;

    #[test]
    fn test_status_merge_table() {
        assert_eq!(DocumentStatus::merge(Processed, Failed), PartiallyProcessed);
        assert_eq!(DocumentStatus::merge(Failed, Processed), PartiallyProcessed);
        assert_eq!(DocumentStatus::merge(Processed, Processed), Processed);
        for s in [Processing, Processed, Failed, PartiallyProcessed] {
            assert_eq!(DocumentStatus::merge(s, s), s);
        }
        assert_eq!(DocumentStatus::merge(Processing, Failed), Failed);
        assert_eq!(DocumentStatus::merge(PartiallyProcessed, Processed), Processed);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&PartiallyProcessed).unwrap(),
            "\"partially_processed\""
        );
        assert_eq!(PartiallyProcessed.as_str(), "partially_processed");
    }

    #[test]
    fn test_billing_period_end() {
        let feb = Utc.with_ymd_and_hms(2024, 2, 10, 8, 0, 0).unwrap();
        assert_eq!(
            billing_period_end(feb),
            Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap()
        );

        let dec = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(
            billing_period_end(dec),
            Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap()
        );
        assert_eq!(month_key(dec), "2026-12");
    }

    #[test]
    fn test_document_record_uses_type_key() {
        let record = NewDocument {
            user_id: "u1".to_string(),
            document_name: "a.pdf".to_string(),
            status: Processed,
            size: 10,
            doc_type: "application/pdf".to_string(),
            number_of_pages: 1,
            processing_duration: 0.5,
            content_hash: None,
            form_id: Some(2),
        }
        .into_record("d1".to_string(), Utc::now());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "application/pdf");
        assert_eq!(value["status"], "processed");
    }
}
