//! Form Intake - field extraction, signature cropping and usage billing server.

mod analysis;
mod auth;
mod billing;
mod config;
mod error;
mod extraction;
mod forms;
mod invoice;
mod pdf;
mod routes;
mod routing;
mod signature;
mod store;

use std::sync::Arc;

use analysis::azure::AzureAnalyzer;
use config::Settings;
use forms::FormRegistry;
use routes::AppState;
use routing::RoutingTable;
use store::memory::MemoryStore;
use store::supabase::SupabaseStore;
use store::Store;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "form_intake=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;

    let registry = match &settings.forms_dir {
        Some(dir) => FormRegistry::load_from_dir(dir)?,
        None => FormRegistry::builtin()?,
    };
    info!(
        "Loaded {} forms: {:?}",
        registry.iter().count(),
        registry.iter().map(|f| f.name.as_str()).collect::<Vec<_>>()
    );

    let routes = RoutingTable::build(&registry, &settings);

    let client = reqwest::Client::new();
    let analyzer = AzureAnalyzer::new(client.clone(), settings.analysis.clone());
    info!(
        "Analysis client initialized (api-version {})",
        settings.analysis.api_version
    );

    let store: Arc<dyn Store> = match &settings.supabase {
        Some(supabase) => {
            info!("Using Supabase store at {}", supabase.url);
            Arc::new(SupabaseStore::new(client, supabase))
        }
        None => {
            warn!("SUPABASE_URL not set; records are kept in memory and lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    info!("Record store: {}", store.name());

    let bind_addr = settings.bind_addr;
    let state = AppState {
        settings: Arc::new(settings),
        registry: Arc::new(registry),
        routes: Arc::new(routes),
        analyzer: Arc::new(analyzer),
        store,
    };

    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
