//! HTTP surface: upload, signature crop and billing endpoints.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderName, HeaderValue},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::DocumentAnalyzer;
use crate::auth::AuthUser;
use crate::billing::{self, BillingReport, REPORT_LIMIT};
use crate::config::Settings;
use crate::error::ApiError;
use crate::extraction;
use crate::forms::{FormId, FormRegistry};
use crate::invoice;
use crate::pdf;
use crate::routing::{ModelRoute, ModelVariant, RoutingTable};
use crate::signature;
use crate::store::{
    ApiCallStatus, DocumentStatus, NewApiCall, NewDocument, StatisticsDelta, Store,
};

const UPLOAD_ENDPOINT: &str = "/upload/";
const SIGNATURE_ENDPOINT: &str = "/get_signature/";
const DOCUMENT_ID_HEADER: &str = "x-document-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<FormRegistry>,
    pub routes: Arc<RoutingTable>,
    pub analyzer: Arc<dyn DocumentAnalyzer>,
    pub store: Arc<dyn Store>,
}

impl AppState {
    fn route_for(&self, form: FormId, variant: ModelVariant) -> Result<ModelRoute, ApiError> {
        self.routes
            .route(form, variant)
            .cloned()
            .ok_or(ApiError::FormUnavailable(form))
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.max_upload_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/upload/", post(upload))
        .route("/get_signature/", post(get_signature))
        .route("/billing/", get(billing_report))
        .route("/billing/pdf/", get(billing_pdf))
        .route("/billing/csv/", get(billing_csv))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Multipart input
// ============================================================================

#[derive(Debug, Default)]
struct UploadRequest {
    filename: String,
    content_type: String,
    data: Vec<u8>,
    form_number: Option<String>,
    document_id: Option<String>,
}

impl UploadRequest {
    fn form_id(&self) -> Result<FormId, ApiError> {
        self.form_number
            .as_deref()
            .ok_or_else(|| ApiError::InvalidRequest("Missing form_number".to_string()))?
            .parse()
            .map_err(ApiError::InvalidRequest)
    }

    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        format!("{:x}", hasher.finalize())
    }
}

fn multipart_error(e: impl std::fmt::Display) -> ApiError {
    ApiError::InvalidRequest(format!("Multipart error: {}", e))
}

async fn read_upload(mut multipart: Multipart) -> Result<UploadRequest, ApiError> {
    let mut request = UploadRequest::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                request.filename = field.file_name().unwrap_or("document").to_string();
                request.content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                request.data = field.bytes().await.map_err(multipart_error)?.to_vec();
            }
            Some("form_number") => {
                request.form_number = Some(field.text().await.map_err(multipart_error)?);
            }
            Some("document_id") => {
                let id = field.text().await.map_err(multipart_error)?;
                let id = id.trim();
                if !id.is_empty() {
                    let id = Uuid::parse_str(id).map_err(|_| {
                        ApiError::InvalidRequest(format!("Invalid document_id: {:?}", id))
                    })?;
                    request.document_id = Some(id.to_string());
                }
            }
            _ => {}
        }
    }

    if request.data.is_empty() {
        return Err(ApiError::InvalidRequest("No file uploaded".to_string()));
    }
    Ok(request)
}

fn attachment(content_type: &str, filename: &str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
        .into_response()
}

/// Failure bookkeeping. Errors here are logged and do not replace the
/// original failure.
async fn record_failure(
    state: &AppState,
    user: &AuthUser,
    endpoint: &str,
    filename: &str,
    document_id: Option<&str>,
    elapsed: f64,
) {
    let call = NewApiCall {
        user_id: user.id().to_string(),
        document_id: document_id.map(str::to_string),
        api_endpoint: endpoint.to_string(),
        status: ApiCallStatus::Error,
    };
    if let Err(e) = state.store.log_api_call(call).await {
        warn!("Failed to log API call error: {}", e);
    }

    let details = format!("Failed to process document {}", filename);
    if let Err(e) = state
        .store
        .log_audit(user.id(), "document_processing_failed", &details)
        .await
    {
        warn!("Failed to write audit event: {}", e);
    }

    if let Some(id) = document_id {
        if let Err(e) = state
            .store
            .update_document(user.id(), id, DocumentStatus::Failed, elapsed)
            .await
        {
            warn!("Failed to mark document {} as failed: {}", id, e);
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

/// Extract form fields and return them as `output.json`.
async fn upload(
    State(state): State<AppState>,
    user: AuthUser,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let request = read_upload(multipart).await?;
    let form_id = request.form_id()?;
    let route = state.route_for(form_id, ModelVariant::Extraction)?;

    info!(
        "Upload from {}: {} ({} bytes) for {}",
        user.id(),
        request.filename,
        request.data.len(),
        form_id
    );

    let started = Instant::now();
    match process_upload(&state, &user, form_id, &route, &request).await {
        Ok(response) => Ok(response),
        Err(err) => {
            record_failure(
                &state,
                &user,
                UPLOAD_ENDPOINT,
                &request.filename,
                request.document_id.as_deref(),
                started.elapsed().as_secs_f64(),
            )
            .await;
            Err(err)
        }
    }
}

async fn process_upload(
    state: &AppState,
    user: &AuthUser,
    form_id: FormId,
    route: &ModelRoute,
    request: &UploadRequest,
) -> Result<Response, ApiError> {
    let pages = pdf::page_count(&request.data)?;
    let form = state.registry.get(form_id);

    let started = Instant::now();
    let output = extraction::extract_fields(
        state.analyzer.as_ref(),
        route,
        form,
        &request.filename,
        &request.data,
    )
    .await?;
    let duration = started.elapsed().as_secs_f64();
    let body = extraction::to_pretty_json(&output)?;

    let document_id = match &request.document_id {
        Some(id) => {
            let record = state
                .store
                .update_document(user.id(), id, DocumentStatus::Processed, duration)
                .await?;
            info!("Document {} reprocessed, status {}", id, record.status.as_str());
            record.id
        }
        None => {
            state
                .store
                .insert_document(NewDocument {
                    user_id: user.id().to_string(),
                    document_name: request.filename.clone(),
                    status: DocumentStatus::Processed,
                    size: request.data.len() as u64,
                    doc_type: request.content_type.clone(),
                    number_of_pages: pages,
                    processing_duration: duration,
                    content_hash: Some(request.content_hash()),
                    form_id: Some(form_id.number()),
                })
                .await?
        }
    };

    state
        .store
        .log_api_call(NewApiCall {
            user_id: user.id().to_string(),
            document_id: Some(document_id.clone()),
            api_endpoint: UPLOAD_ENDPOINT.to_string(),
            status: ApiCallStatus::Success,
        })
        .await?;
    state
        .store
        .log_audit(user.id(), "document_processed", &request.filename)
        .await?;
    state
        .store
        .log_audit(user.id(), "API_call_made", UPLOAD_ENDPOINT)
        .await?;
    state
        .store
        .increment_statistics(user.id(), StatisticsDelta::new(1, 1), Utc::now())
        .await?;

    info!(
        "Processed {} as document {} in {:.2}s",
        request.filename, document_id, duration
    );

    let mut response = attachment("application/json", "output.json", body.into_bytes());
    if let Ok(value) = HeaderValue::from_str(&document_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(DOCUMENT_ID_HEADER), value);
    }
    Ok(response)
}

/// Crop the first page to the detected signature and return it as `output.pdf`.
async fn get_signature(
    State(state): State<AppState>,
    user: AuthUser,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let request = read_upload(multipart).await?;
    let form_id = request.form_id()?;
    let route = state.route_for(form_id, ModelVariant::Signature)?;

    info!(
        "Signature request from {}: {} for {}",
        user.id(),
        request.filename,
        form_id
    );

    let started = Instant::now();
    match process_signature(&state, &user, form_id, &route, &request).await {
        Ok(response) => Ok(response),
        Err(err) => {
            record_failure(
                &state,
                &user,
                SIGNATURE_ENDPOINT,
                &request.filename,
                None,
                started.elapsed().as_secs_f64(),
            )
            .await;
            Err(err)
        }
    }
}

async fn process_signature(
    state: &AppState,
    user: &AuthUser,
    form_id: FormId,
    route: &ModelRoute,
    request: &UploadRequest,
) -> Result<Response, ApiError> {
    let pages = pdf::page_count(&request.data)?;

    let started = Instant::now();
    let points = signature::locate_signature(
        state.analyzer.as_ref(),
        route,
        &request.filename,
        &request.data,
    )
    .await?;
    let duration = started.elapsed().as_secs_f64();

    let cropped = pdf::crop_to_signature(&request.data, &points)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("{}", e)))?;
    let body = tokio::fs::read(cropped.path())
        .await
        .context("Failed to read cropped PDF")?;
    drop(cropped);

    let document_id = state
        .store
        .insert_document(NewDocument {
            user_id: user.id().to_string(),
            document_name: request.filename.clone(),
            status: DocumentStatus::Processed,
            size: request.data.len() as u64,
            doc_type: "pdf".to_string(),
            number_of_pages: pages,
            processing_duration: duration,
            content_hash: Some(request.content_hash()),
            form_id: Some(form_id.number()),
        })
        .await?;

    state
        .store
        .log_api_call(NewApiCall {
            user_id: user.id().to_string(),
            document_id: Some(document_id),
            api_endpoint: SIGNATURE_ENDPOINT.to_string(),
            status: ApiCallStatus::Success,
        })
        .await?;
    state
        .store
        .log_audit(user.id(), "API_call_made", SIGNATURE_ENDPOINT)
        .await?;
    state
        .store
        .increment_statistics(user.id(), StatisticsDelta::new(0, 1), Utc::now())
        .await?;

    Ok(attachment("application/pdf", "output.pdf", body))
}

async fn load_report(state: &AppState, user: &AuthUser) -> Result<BillingReport, ApiError> {
    let stats = state
        .store
        .latest_statistics(user.id())
        .await?
        .ok_or(ApiError::StatisticsNotFound)?;
    let documents = state.store.list_documents(user.id(), REPORT_LIMIT).await?;
    let api_calls = state.store.list_api_calls(user.id(), REPORT_LIMIT).await?;

    Ok(BillingReport::build(
        &stats,
        &documents,
        &api_calls,
        &state.settings.rates,
    ))
}

async fn billing_report(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<BillingReport>, ApiError> {
    Ok(Json(load_report(&state, &user).await?))
}

async fn billing_pdf(State(state): State<AppState>, user: AuthUser) -> Result<Response, ApiError> {
    let report = load_report(&state, &user).await?;
    let bytes = invoice::render(&report, user.email(), Utc::now().date_naive())?;
    Ok(attachment("application/pdf", "billing_invoice.pdf", bytes))
}

async fn billing_csv(State(state): State<AppState>, user: AuthUser) -> Result<Response, ApiError> {
    let report = load_report(&state, &user).await?;
    let bytes = billing::to_csv(&report)?;
    Ok(attachment("text/csv", "billing_report.csv", bytes))
}
