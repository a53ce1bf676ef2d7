//! Usage reports priced from stored documents and API calls.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::BillingRates;
use crate::store::{ApiCallRecord, ApiCallStatus, DocumentRecord, UserStatistic};

/// Maximum documents and API calls listed in one report.
pub const REPORT_LIMIT: usize = 100;

pub fn document_charge(size: u64, rates: &BillingRates) -> f64 {
    size as f64 / 1024.0 * rates.document_rate_per_kb
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentCharge {
    pub document_id: String,
    pub document_name: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub size: u64,
    pub number_of_pages: u32,
    pub processing_timestamp: DateTime<Utc>,
    pub charges: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiCallCharge {
    pub api_request_id: String,
    pub timestamp: DateTime<Utc>,
    pub api_endpoint: String,
    pub status: ApiCallStatus,
    pub charges: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingReport {
    pub total_documents_processed: i64,
    pub total_api_calls: i64,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub total_charges: f64,
    pub documents: Vec<DocumentCharge>,
    pub api_calls: Vec<ApiCallCharge>,
}

impl BillingReport {
    /// Totals come from the statistics row; charges from the listed records.
    pub fn build(
        stats: &UserStatistic,
        documents: &[DocumentRecord],
        api_calls: &[ApiCallRecord],
        rates: &BillingRates,
    ) -> Self {
        let documents: Vec<DocumentCharge> = documents
            .iter()
            .take(REPORT_LIMIT)
            .map(|doc| DocumentCharge {
                document_id: doc.id.clone(),
                document_name: doc.document_name.clone(),
                doc_type: doc.doc_type.clone(),
                size: doc.size,
                number_of_pages: doc.number_of_pages,
                processing_timestamp: doc.processing_timestamp,
                charges: document_charge(doc.size, rates),
            })
            .collect();

        let api_calls: Vec<ApiCallCharge> = api_calls
            .iter()
            .take(REPORT_LIMIT)
            .map(|call| ApiCallCharge {
                api_request_id: call.id.clone(),
                timestamp: call.timestamp,
                api_endpoint: call.api_endpoint.clone(),
                status: call.status,
                charges: rates.api_call_rate,
            })
            .collect();

        let total_charges = documents.iter().map(|d| d.charges).sum::<f64>()
            + api_calls.iter().map(|c| c.charges).sum::<f64>();

        Self {
            total_documents_processed: stats.total_documents_processed,
            total_api_calls: stats.total_api_calls,
            billing_period_start: stats.billing_period_start,
            billing_period_end: stats.billing_period_end,
            total_charges,
            documents,
            api_calls,
        }
    }
}

pub fn status_label(status: ApiCallStatus) -> &'static str {
    match status {
        ApiCallStatus::Success => "success",
        ApiCallStatus::Error => "error",
    }
}

/// One row per API call: endpoint, date, time, status, charge.
pub fn to_csv(report: &BillingReport) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["API Endpoint", "Date", "Time", "Status", "Charges (Rs.)"])?;

    for call in &report.api_calls {
        writer.write_record([
            call.api_endpoint.clone(),
            call.timestamp.format("%Y-%m-%d").to_string(),
            call.timestamp.format("%H:%M:%S").to_string(),
            status_label(call.status).to_string(),
            format!("{:.2}", call.charges),
        ])?;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV export: {}", e.error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocumentStatus;
    use chrono::TimeZone;

    fn stats() -> UserStatistic {
        UserStatistic {
            user_id: "u1".to_string(),
            month: "2026-03".to_string(),
            billing_period_start: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
            billing_period_end: Utc.with_ymd_and_hms(2026, 3, 31, 23, 59, 59).unwrap(),
            total_documents_processed: 2,
            total_api_calls: 3,
        }
    }

    fn doc(id: &str, size: u64) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            user_id: "u1".to_string(),
            document_name: format!("{}.pdf", id),
            processing_timestamp: Utc.with_ymd_and_hms(2026, 3, 3, 10, 0, 0).unwrap(),
            status: DocumentStatus::Processed,
            size,
            doc_type: "application/pdf".to_string(),
            number_of_pages: 3,
            processing_duration: 1.0,
            content_hash: None,
            form_id: Some(2),
        }
    }

    fn call(endpoint: &str, status: ApiCallStatus) -> ApiCallRecord {
        ApiCallRecord {
            id: format!("call-{}", endpoint),
            document_id: None,
            user_id: "u1".to_string(),
            api_endpoint: endpoint.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 3, 10, 15, 30).unwrap(),
            status,
            api_calls_count: 1,
        }
    }

    #[test]
    fn test_document_charge_per_kb() {
        let rates = BillingRates::default();
        assert!((document_charge(204_800, &rates) - 4.0).abs() < 1e-9);
        assert!((document_charge(512, &rates) - 0.01).abs() < 1e-9);
        assert_eq!(document_charge(0, &rates), 0.0);
    }

    #[test]
    fn test_report_totals() {
        let rates = BillingRates::default();
        let report = BillingReport::build(
            &stats(),
            &[doc("a", 204_800), doc("b", 1024)],
            &[
                call("/upload/", ApiCallStatus::Success),
                call("/get_signature/", ApiCallStatus::Error),
            ],
            &rates,
        );

        assert_eq!(report.total_documents_processed, 2);
        assert_eq!(report.total_api_calls, 3);
        assert_eq!(report.documents.len(), 2);
        assert!((report.total_charges - (4.0 + 0.02 + 0.05 + 0.05)).abs() < 1e-9);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["documents"][0]["type"], "application/pdf");
        assert_eq!(json["api_calls"][1]["status"], "error");
    }

    #[test]
    fn test_report_lists_at_most_limit() {
        let rates = BillingRates::default();
        let docs: Vec<DocumentRecord> = (0..150).map(|i| doc(&i.to_string(), 1024)).collect();
        let report = BillingReport::build(&stats(), &docs, &[], &rates);
        assert_eq!(report.documents.len(), REPORT_LIMIT);
    }

    #[test]
    fn test_csv_splits_timestamp() {
        let rates = BillingRates::default();
        let report = BillingReport::build(
            &stats(),
            &[],
            &[call("/upload/", ApiCallStatus::Success)],
            &rates,
        );

        let text = String::from_utf8(to_csv(&report).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "API Endpoint,Date,Time,Status,Charges (Rs.)");
        assert_eq!(lines[1], "/upload/,2026-03-03,10:15:30,success,0.05");
        assert_eq!(lines.len(), 2);
    }
}
