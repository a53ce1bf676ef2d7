//! In-process store for tests and runs without Supabase.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    billing_period_end, month_key, ApiCallRecord, AuditRecord, DocumentRecord, DocumentStatus,
    NewApiCall, NewDocument, StatisticsDelta, Store, StoreError, StoreResult, UserStatistic,
};

#[derive(Debug, Default)]
struct Tables {
    documents: HashMap<String, DocumentRecord>,
    api_calls: Vec<ApiCallRecord>,
    audit: Vec<AuditRecord>,
    /// Keyed by `(user_id, month)`.
    statistics: HashMap<(String, String), UserStatistic>,
}

/// All tables behind one lock, so every write (including statistics
/// increments) is a single critical section.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend(anyhow!("memory store lock poisoned")))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend(anyhow!("memory store lock poisoned")))
    }
}

/// Inspection helpers for handler tests.
#[cfg(test)]
impl MemoryStore {
    pub fn document(&self, id: &str) -> Option<DocumentRecord> {
        self.read().ok()?.documents.get(id).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.read().map(|t| t.documents.len()).unwrap_or_default()
    }

    pub fn audit_events(&self, user_id: &str) -> Vec<AuditRecord> {
        self.read()
            .map(|t| {
                t.audit
                    .iter()
                    .filter(|a| a.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_document(&self, doc: NewDocument) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        let record = doc.into_record(id.clone(), Utc::now());
        self.write()?.documents.insert(id.clone(), record);
        tracing::debug!("MemoryStore: inserted document {}", id);
        Ok(id)
    }

    async fn update_document(
        &self,
        user_id: &str,
        document_id: &str,
        status: DocumentStatus,
        processing_duration: f64,
    ) -> StoreResult<DocumentRecord> {
        let mut tables = self.write()?;
        let record = tables
            .documents
            .get_mut(document_id)
            .filter(|d| d.user_id == user_id)
            .ok_or_else(|| StoreError::DocumentNotFound(document_id.to_string()))?;

        record.status = DocumentStatus::merge(record.status, status);
        record.processing_duration += processing_duration;
        record.processing_timestamp = Utc::now();
        Ok(record.clone())
    }

    async fn log_api_call(&self, call: NewApiCall) -> StoreResult<()> {
        let record = ApiCallRecord {
            id: Uuid::new_v4().to_string(),
            document_id: call.document_id,
            user_id: call.user_id,
            api_endpoint: call.api_endpoint,
            timestamp: Utc::now(),
            status: call.status,
            api_calls_count: 1,
        };
        self.write()?.api_calls.push(record);
        Ok(())
    }

    async fn log_audit(&self, user_id: &str, event_type: &str, event_details: &str) -> StoreResult<()> {
        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            event_type: event_type.to_string(),
            event_details: event_details.to_string(),
            timestamp: Utc::now(),
        };
        self.write()?.audit.push(record);
        Ok(())
    }

    async fn increment_statistics(
        &self,
        user_id: &str,
        delta: StatisticsDelta,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let month = month_key(now);
        let mut tables = self.write()?;
        let row = tables
            .statistics
            .entry((user_id.to_string(), month.clone()))
            .or_insert_with(|| UserStatistic {
                user_id: user_id.to_string(),
                month,
                billing_period_start: now,
                billing_period_end: billing_period_end(now),
                total_documents_processed: 0,
                total_api_calls: 0,
            });
        row.total_documents_processed += delta.documents;
        row.total_api_calls += delta.api_calls;
        Ok(())
    }

    async fn latest_statistics(&self, user_id: &str) -> StoreResult<Option<UserStatistic>> {
        let tables = self.read()?;
        Ok(tables
            .statistics
            .values()
            .filter(|s| s.user_id == user_id)
            .max_by(|a, b| a.month.cmp(&b.month))
            .cloned())
    }

    async fn list_documents(&self, user_id: &str, limit: usize) -> StoreResult<Vec<DocumentRecord>> {
        let tables = self.read()?;
        let mut docs: Vec<DocumentRecord> = tables
            .documents
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.processing_timestamp.cmp(&a.processing_timestamp));
        docs.truncate(limit);
        Ok(docs)
    }

    async fn list_api_calls(&self, user_id: &str, limit: usize) -> StoreResult<Vec<ApiCallRecord>> {
        let tables = self.read()?;
        Ok(tables
            .api_calls
            .iter()
            .rev()
            .filter(|c| c.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ApiCallStatus;
    use chrono::TimeZone;

    fn new_doc(user: &str, status: DocumentStatus) -> NewDocument {
        NewDocument {
            user_id: user.to_string(),
            document_name: "scan.pdf".to_string(),
            status,
            size: 2048,
            doc_type: "application/pdf".to_string(),
            number_of_pages: 2,
            processing_duration: 1.5,
            content_hash: None,
            form_id: Some(1),
        }
    }

    #[tokio::test]
    async fn test_update_merges_status_and_adds_duration() {
        let store = MemoryStore::new();
        let id = store
            .insert_document(new_doc("u1", DocumentStatus::Processed))
            .await
            .unwrap();

        let updated = store
            .update_document("u1", &id, DocumentStatus::Failed, 0.5)
            .await
            .unwrap();
        assert_eq!(updated.status, DocumentStatus::PartiallyProcessed);
        assert!((updated.processing_duration - 2.0).abs() < 1e-9);

        let again = store
            .update_document("u1", &id, DocumentStatus::Processed, 0.0)
            .await
            .unwrap();
        assert_eq!(again.status, DocumentStatus::Processed);
    }

    #[tokio::test]
    async fn test_update_unknown_or_foreign_document() {
        let store = MemoryStore::new();
        let id = store
            .insert_document(new_doc("owner", DocumentStatus::Processed))
            .await
            .unwrap();

        let missing = store
            .update_document("owner", "nope", DocumentStatus::Processed, 0.0)
            .await;
        assert!(matches!(missing, Err(StoreError::DocumentNotFound(_))));

        let foreign = store
            .update_document("intruder", &id, DocumentStatus::Failed, 0.0)
            .await;
        assert!(matches!(foreign, Err(StoreError::DocumentNotFound(_))));
        assert_eq!(store.document(&id).unwrap().status, DocumentStatus::Processed);
    }

    #[tokio::test]
    async fn test_statistics_accumulate_per_month() {
        let store = MemoryStore::new();
        let jan = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        store.increment_statistics("u1", StatisticsDelta::new(1, 1), jan).await.unwrap();
        store.increment_statistics("u1", StatisticsDelta::new(0, 1), jan).await.unwrap();
        store.increment_statistics("u1", StatisticsDelta::new(1, 1), feb).await.unwrap();

        let latest = store.latest_statistics("u1").await.unwrap().unwrap();
        assert_eq!(latest.month, "2026-02");
        assert_eq!(latest.total_documents_processed, 1);
        assert_eq!(latest.total_api_calls, 1);
        assert_eq!(
            latest.billing_period_end,
            Utc.with_ymd_and_hms(2026, 2, 28, 23, 59, 59).unwrap()
        );

        assert!(store.latest_statistics("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_increments_sum() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let delta = if i % 2 == 0 {
                    StatisticsDelta::new(1, 1)
                } else {
                    StatisticsDelta::new(0, 1)
                };
                store.increment_statistics("u1", delta, now).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = store.latest_statistics("u1").await.unwrap().unwrap();
        assert_eq!(stats.total_documents_processed, 16);
        assert_eq!(stats.total_api_calls, 32);
    }

    #[tokio::test]
    async fn test_listings_are_scoped_and_limited() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .insert_document(new_doc("u1", DocumentStatus::Processed))
                .await
                .unwrap();
            store
                .log_api_call(NewApiCall {
                    user_id: "u1".to_string(),
                    document_id: None,
                    api_endpoint: "/upload/".to_string(),
                    status: ApiCallStatus::Success,
                })
                .await
                .unwrap();
        }
        store
            .insert_document(new_doc("u2", DocumentStatus::Failed))
            .await
            .unwrap();

        assert_eq!(store.list_documents("u1", 100).await.unwrap().len(), 3);
        assert_eq!(store.list_documents("u1", 2).await.unwrap().len(), 2);
        assert_eq!(store.list_api_calls("u1", 100).await.unwrap().len(), 3);
        assert!(store.list_api_calls("u2", 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_log() {
        let store = MemoryStore::new();
        store
            .log_audit("u1", "document_processed", "Processed document scan.pdf")
            .await
            .unwrap();
        let events = store.audit_events("u1");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "document_processed");
    }
}
