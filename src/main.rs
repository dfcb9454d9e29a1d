use std::sync::Arc;

use freight_intake::booking::{
    BookingApiConfig, BookingService, HttpBookingService, Materializer, UnconfiguredBookingService,
};
use freight_intake::config::{HttpConfig, PipelineConfig};
use freight_intake::connector::{GmailConfig, GmailConnector, MailboxConnector};
use freight_intake::extract::FieldExtractor;
use freight_intake::http::{AppState, AuthTokens, intake_routes};
use freight_intake::llm::{LlmConfig, create_provider};
use freight_intake::pipeline::Orchestrator;
use freight_intake::store::{IntakeStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let http_config = HttpConfig::from_env();
    let pipeline_config = PipelineConfig::from_env();

    eprintln!("📦 Freight Intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}/api", http_config.bind_addr);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("INTAKE_DB_PATH").unwrap_or_else(|_| "./data/freight-intake.db".to_string());
    let store: Arc<dyn IntakeStore> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open database at {db_path}: {e}"))?,
    );
    eprintln!("   Database: {}", db_path);

    // ── Mailbox connector ────────────────────────────────────────────────
    let connector: Arc<dyn MailboxConnector> = Arc::new(GmailConnector::new(
        GmailConfig::from_env(),
        Arc::clone(&store),
    ));
    eprintln!(
        "   Mailbox: gmail ({})",
        if connector.is_configured() {
            "configured"
        } else {
            "not configured — set GMAIL_CLIENT_ID / GMAIL_CLIENT_SECRET"
        }
    );

    // ── Extraction engine ────────────────────────────────────────────────
    let llm = match LlmConfig::from_env() {
        Some(config) => {
            eprintln!("   Extractor LLM: {} @ {}", config.model, config.base_url);
            Some(create_provider(&config)?)
        }
        None => {
            eprintln!("   Extractor LLM: disabled (set EXTRACTOR_API_KEY) — regex pass only");
            None
        }
    };
    let extractor = Arc::new(FieldExtractor::new(llm));

    // ── Booking capability ───────────────────────────────────────────────
    let bookings: Arc<dyn BookingService> = match BookingApiConfig::from_env() {
        Some(config) => {
            eprintln!("   Booking API: {}", config.base_url);
            Arc::new(HttpBookingService::new(config))
        }
        None => {
            eprintln!("   Booking API: not configured — auto-create attempts will fail");
            Arc::new(UnconfiguredBookingService)
        }
    };
    let materializer = Arc::new(Materializer::new(bookings));

    // ── Orchestrator + HTTP ──────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        extractor,
        materializer,
        Arc::clone(&connector),
        pipeline_config.clone(),
    ));

    let auth = AuthTokens::from(&http_config);
    if auth.admin.is_none() {
        tracing::warn!("INTAKE_ADMIN_TOKEN not set — admin routes will deny all requests");
    }

    let app = intake_routes(AppState {
        orchestrator,
        store,
        connector,
        defaults: pipeline_config,
        auth,
    });

    let listener = tokio::net::TcpListener::bind(&http_config.bind_addr).await?;
    tracing::info!(addr = %http_config.bind_addr, "Intake API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
