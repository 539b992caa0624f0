//! convoflow demo driver
//!
//! Loads flow documents from the paths given as arguments, then treats each
//! stdin line as one user message of a single session and prints every turn
//! result as a JSON line.

use convoflow::config::{EngineConfig, LlmConfig};
use convoflow::db::Database;
use convoflow::flow::{FlowCatalog, FlowDocument, FlowLibrary, GuardEvaluator};
use convoflow::llm::{AnthropicService, LoggingService, DEFAULT_MODEL};
use convoflow::runtime::{DatabaseStorage, InboundMessage, TurnDisposition, TurnRunner};
use convoflow::tools::{ActionRegistry, WebhookExecutor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging; stdout carries turn results
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoflow=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        return Err("usage: convoflow <flow.json>...".into());
    }

    let evaluator = Arc::new(GuardEvaluator::new());
    let catalog = load_catalog(&paths, &evaluator)?;

    // Configuration
    let config = EngineConfig::from_env();
    let llm_config = LlmConfig::from_env();
    if !llm_config.is_usable() {
        tracing::warn!("No LLM credentials configured. Set ANTHROPIC_API_KEY or LLM_GATEWAY.");
    }
    let model = llm_config
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let service = AnthropicService::new(
        llm_config.anthropic_api_key.clone().unwrap_or_default(),
        model,
        llm_config.gateway.as_deref(),
        config.llm_timeout,
    )?;
    let llm = LoggingService::new(Arc::new(service));

    let actions = webhook_actions(&std::env::var("CONVOFLOW_WEBHOOKS").unwrap_or_default());

    // Initialize database
    let db_path = std::env::var("CONVOFLOW_DB_PATH").unwrap_or_else(|_| "convoflow.db".to_string());
    if let Some(parent) = PathBuf::from(&db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %db_path, "Opening database");
    let storage = DatabaseStorage::new(Database::open(&db_path)?);
    let purged = storage.inner().purge_expired_locks()?;
    if purged > 0 {
        tracing::info!(purged, "Removed expired session locks");
    }

    let runner = TurnRunner::new(
        Arc::new(catalog),
        evaluator,
        llm,
        storage.clone(),
        storage,
        config,
    )
    .with_actions(actions);

    let user_id = std::env::var("CONVOFLOW_USER_ID").unwrap_or_else(|_| "local".to_string());
    let session_id =
        std::env::var("CONVOFLOW_SESSION_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    tracing::info!(user_id = %user_id, session_id = %session_id, "Session ready, reading stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let message = InboundMessage::new(&user_id, &session_id, text)
            .with_message_id(uuid::Uuid::new_v4().to_string());
        match runner.handle_message(message).await {
            Ok(TurnDisposition::Completed(result)) => {
                println!("{}", serde_json::to_string(&result)?);
            }
            Ok(other) => tracing::info!(disposition = ?other, "Turn produced no reply"),
            Err(e) => tracing::error!(error = %e, "Turn failed"),
        }
    }

    tracing::info!(session_id = %session_id, "Input closed, shutting down");
    Ok(())
}

/// Parse and compile every flow document, reporting all validation errors
fn load_catalog(paths: &[String], evaluator: &GuardEvaluator) -> Result<FlowCatalog, Box<dyn std::error::Error>> {
    let mut library = FlowLibrary::new();
    for path in paths {
        let text = std::fs::read_to_string(path)?;
        let document = FlowDocument::parse(&text).map_err(|e| format!("{path}: {e}"))?;
        tracing::info!(path = %path, flow = %document.id, "Loaded flow document");
        library.insert(document);
    }
    FlowCatalog::compile(&library, evaluator).map_err(|errors| {
        for e in &errors {
            tracing::error!(error = %e, "Invalid flow");
        }
        format!("{} validation error(s)", errors.len()).into()
    })
}

/// Webhook executors from `name=url,name=url`
fn webhook_actions(raw: &str) -> ActionRegistry {
    let mut actions = ActionRegistry::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((name, url)) = entry.split_once('=') else {
            tracing::warn!(entry = %entry, "Ignoring webhook entry without '='");
            continue;
        };
        tracing::info!(action = %name, url = %url, "Registered webhook action");
        actions.register(Arc::new(WebhookExecutor::new(name.trim(), url.trim())));
    }
    actions
}
