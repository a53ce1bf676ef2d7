//! Runtime settings.
//!
//! Everything is read from the environment once at startup (after `.env` is
//! loaded) and shared with handlers through `AppState`.

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Endpoint and key pair for one analysis-service resource.
#[derive(Debug, Clone)]
pub struct TenantCredentials {
    pub endpoint: String,
    pub api_key: String,
}

/// Per-unit billing rates.
#[derive(Debug, Clone, Copy)]
pub struct BillingRates {
    pub document_rate_per_kb: f64,
    pub api_call_rate: f64,
}

impl Default for BillingRates {
    fn default() -> Self {
        Self {
            document_rate_per_kb: 0.02,
            api_call_rate: 0.05,
        }
    }
}

/// Polling behaviour for long-running analysis operations.
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub api_version: String,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            api_version: "2023-07-31".to_string(),
            poll_interval: Duration::from_millis(1000),
            max_polls: 120,
        }
    }
}

/// Hosted store credentials. Absent means the in-memory store is used.
#[derive(Debug, Clone)]
pub struct SupabaseSettings {
    pub url: String,
    pub service_role_key: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    /// HS256 secret used to verify bearer tokens.
    pub secret_key: String,
    pub primary: TenantCredentials,
    pub secondary: Option<TenantCredentials>,
    pub analysis: AnalysisSettings,
    pub supabase: Option<SupabaseSettings>,
    pub rates: BillingRates,
    pub max_upload_bytes: usize,
    pub forms_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let secret_key = required("SECRET_KEY")?;

        let primary = TenantCredentials {
            endpoint: required("ENDPOINT")?,
            api_key: required("KEY")?,
        };

        let secondary = match (optional("ENDPOINT2"), optional("KEY2")) {
            (Some(endpoint), Some(api_key)) => Some(TenantCredentials { endpoint, api_key }),
            _ => None,
        };

        let supabase = match (optional("SUPABASE_URL"), optional("SUPABASE_SERVICE_ROLE_KEY")) {
            (Some(url), Some(service_role_key)) => Some(SupabaseSettings {
                url,
                service_role_key,
            }),
            _ => None,
        };

        let defaults = AnalysisSettings::default();
        let analysis = AnalysisSettings {
            api_version: optional("ANALYSIS_API_VERSION").unwrap_or(defaults.api_version),
            poll_interval: Duration::from_millis(parsed("ANALYSIS_POLL_INTERVAL_MS", 1000)?),
            max_polls: parsed("ANALYSIS_MAX_POLLS", defaults.max_polls)?,
        };

        let default_rates = BillingRates::default();
        let rates = BillingRates {
            document_rate_per_kb: parsed("DOCUMENT_RATE_PER_KB", default_rates.document_rate_per_kb)?,
            api_call_rate: parsed("API_CALL_RATE", default_rates.api_call_rate)?,
        };

        let bind_addr = optional("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8000".to_string())
            .parse()
            .context("BIND_ADDR is not a valid socket address")?;

        Ok(Self {
            bind_addr,
            secret_key,
            primary,
            secondary,
            analysis,
            supabase,
            rates,
            max_upload_bytes: parsed("MAX_UPLOAD_BYTES", 50 * 1024 * 1024)?,
            forms_dir: optional("FORMS_DIR").map(PathBuf::from),
        })
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{} environment variable not set", name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", name, raw, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
impl Settings {
    /// Settings for handler tests: both tenants configured, nothing read from the environment.
    pub fn for_tests(secret_key: &str) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            secret_key: secret_key.to_string(),
            primary: TenantCredentials {
                endpoint: "https://primary.example.test".to_string(),
                api_key: "primary-key".to_string(),
            },
            secondary: Some(TenantCredentials {
                endpoint: "https://secondary.example.test".to_string(),
                api_key: "secondary-key".to_string(),
            }),
            analysis: AnalysisSettings::default(),
            supabase: None,
            rates: BillingRates::default(),
            max_upload_bytes: 10 * 1024 * 1024,
            forms_dir: None,
        }
    }
}
