//! API Service - upload buffer and background runs for the clinic pipeline
//!
//! Endpoints:
//! - GET /health - Health check
//! - POST /upload_single_file/ - Buffer one file (multipart `file` + `filename`)
//! - POST /trigger_processing_and_save/ - Run the buffered batch in the background
//! - GET /runs/last - Report of the last finished run
//! - GET /admin/reset_memory/ - Clear the upload buffer
//! - POST /ask_sherlock/ - Relay a Slack question to the assistant webhook

use std::sync::{Arc, Mutex};

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Form, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

use pipeline::batch::{BufferStatus, FileRole};
use pipeline::config::Settings;
use pipeline::logging::init_tracing;
use pipeline::profile::ProfileSpec;
use pipeline::{
    persist_tables, run, Batch, CalamineSource, InboundBuffer, InboundFile, PgSink, RunOptions,
    RunReport, WarningLog,
};

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

// ============================================================================
// State
// ============================================================================

struct AppState {
    /// None when DB_URL is unset; uploads still work, runs are refused.
    pool: Option<PgPool>,
    buffer: InboundBuffer,
    settings: Settings,
    profiles: Vec<ProfileSpec>,
    http: reqwest::Client,
    last_run: Mutex<Option<RunReport>>,
}

impl AppState {
    fn new(pool: Option<PgPool>, settings: Settings, profiles: Vec<ProfileSpec>) -> Self {
        Self {
            pool,
            buffer: InboundBuffer::new(settings.index_file_name.clone()),
            settings,
            profiles,
            http: reqwest::Client::new(),
            last_run: Mutex::new(None),
        }
    }

    fn run_options(&self) -> RunOptions {
        RunOptions::new(self.settings.today()).with_profiles(self.profiles.clone())
    }

    fn store_report(&self, report: RunReport) {
        *self.last_run.lock().unwrap_or_else(|p| p.into_inner()) = Some(report);
    }
}

type SharedState = Arc<AppState>;

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct UploadResponse {
    filename: String,
    role: FileRole,
    buffer: BufferStatus,
}

#[derive(Serialize)]
struct TriggerResponse {
    run_id: Uuid,
    index: String,
    data_files: Vec<String>,
    message: &'static str,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

/// Slack-style reply body.
#[derive(Serialize)]
struct SlackReply {
    text: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn slack_reply(status: StatusCode, text: impl Into<String>) -> axum::response::Response {
    (status, Json(SlackReply { text: text.into() })).into_response()
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Deserialize)]
struct SherlockForm {
    text: Option<String>,
    user_id: Option<String>,
    channel_id: Option<String>,
}

#[derive(Serialize)]
struct SherlockPayload<'a> {
    user_question: &'a str,
    user_id: Option<&'a str>,
    channel_id: Option<&'a str>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn upload_handler(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut declared_name: Option<String> = None;
    let mut upload: Option<(Option<String>, Vec<u8>)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        };
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("filename") => match field.text().await {
                Ok(text) => declared_name = Some(text),
                Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
            },
            Some("file") => {
                let file_name = field.file_name().map(str::to_string);
                match field.bytes().await {
                    Ok(bytes) => upload = Some((file_name, bytes.to_vec())),
                    Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
                }
            }
            _ => {}
        }
    }

    let Some((file_name, bytes)) = upload else {
        return error_response(StatusCode::BAD_REQUEST, "missing 'file' field");
    };
    let name = declared_name
        .or(file_name)
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    let Some(name) = name else {
        return error_response(StatusCode::BAD_REQUEST, "missing 'filename' field");
    };

    let role = state.buffer.add(InboundFile::new(name.clone(), bytes));
    Json(UploadResponse {
        filename: name,
        role,
        buffer: state.buffer.status(),
    })
    .into_response()
}

async fn trigger_handler(State(state): State<SharedState>) -> impl IntoResponse {
    // Checked before the buffer is taken so a refused run keeps the uploads.
    let Some(pool) = state.pool.clone() else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "database not configured (DB_URL)",
        );
    };

    let batch = match state.buffer.take_batch() {
        Ok(batch) => batch,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let run_id = Uuid::new_v4();
    let response = TriggerResponse {
        run_id,
        index: batch.index.name.clone(),
        data_files: batch.data.iter().map(|f| f.name.clone()).collect(),
        message: "processing started",
    };

    let options = state.run_options();
    tokio::spawn(
        process_batch(state.clone(), pool, batch, options)
            .instrument(tracing::info_span!("run", %run_id)),
    );

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

/// Background unit of work: run the pipeline off the async workers, then
/// replace the output tables in Postgres.
async fn process_batch(state: SharedState, pool: PgPool, batch: Batch, options: RunOptions) {
    let result = tokio::task::spawn_blocking(move || run(&batch, &CalamineSource, &options)).await;
    let result = match result {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "pipeline task panicked");
            return;
        }
    };

    let mut report = RunReport::from_result(&result);
    match result {
        Ok(output) => {
            let mut persist_warnings = WarningLog::new();
            let written =
                persist_tables(&PgSink::new(pool), &output.tables, &mut persist_warnings).await;
            tracing::info!(
                written,
                total = output.tables.len(),
                warnings = report.warnings.len() + persist_warnings.len(),
                "run complete"
            );
            report.warnings.extend(persist_warnings.into_vec());
        }
        Err(failure) => {
            tracing::error!(
                error = %failure.error,
                warnings = failure.warnings.len(),
                "pipeline run failed"
            );
        }
    }
    state.store_report(report);
}

async fn last_run_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let report = state.last_run.lock().unwrap_or_else(|p| p.into_inner()).clone();
    match report {
        Some(report) => Json(report).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no run has finished yet"),
    }
}

async fn reset_handler(State(state): State<SharedState>) -> Json<MessageResponse> {
    state.buffer.reset();
    tracing::info!("upload buffer cleared by admin");
    Json(MessageResponse {
        message: "upload buffer cleared",
    })
}

async fn ask_sherlock_handler(
    State(state): State<SharedState>,
    Form(form): Form<SherlockForm>,
) -> impl IntoResponse {
    let question = form.text.as_deref().map(str::trim).unwrap_or_default();
    if question.is_empty() {
        return slack_reply(
            StatusCode::OK,
            "Lo siento, no recibí tu pregunta. Por favor, intenta de nuevo.",
        );
    }
    let Some(url) = state.settings.sherlock_webhook_url.as_deref() else {
        tracing::error!("SHERLOCK_WEBHOOK_URL not configured");
        return slack_reply(StatusCode::INTERNAL_SERVER_ERROR, "Sherlock no está configurado.");
    };

    let payload = SherlockPayload {
        user_question: question,
        user_id: form.user_id.as_deref(),
        channel_id: form.channel_id.as_deref(),
    };
    let sent = state
        .http
        .post(url)
        .json(&payload)
        .send()
        .await
        .and_then(|r| r.error_for_status());

    match sent {
        Ok(_) => slack_reply(
            StatusCode::OK,
            format!("Pregunta recibida: '{}'. Sherlock procesando...", question),
        ),
        Err(e) => {
            tracing::error!(error = %e, "assistant webhook call failed");
            slack_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error al enviar tu pregunta a Sherlock.",
            )
        }
    }
}

// ============================================================================
// Router
// ============================================================================

fn app(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/upload_single_file/", post(upload_handler))
        .route("/trigger_processing_and_save/", post(trigger_handler))
        .route("/runs/last", get(last_run_handler))
        .route("/admin/reset_memory/", get(reset_handler))
        .route("/ask_sherlock/", post(ask_sherlock_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let settings = Settings::from_env().context("Invalid configuration")?;
    let profiles = settings.profiles().context("Failed to load profiles")?;

    let pool = match &settings.db_url {
        Some(db_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(db_url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("database connected");
            Some(pool)
        }
        None => {
            tracing::warn!("DB_URL not set; processing runs will be refused");
            None
        }
    };

    let bind = settings.api_bind.clone();
    let state = Arc::new(AppState::new(pool, settings, profiles));

    println!("Clinic pipeline API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET  /health");
    println!("  POST /upload_single_file/  (multipart: file, filename)");
    println!("  POST /trigger_processing_and_save/");
    println!("  GET  /runs/last");
    println!("  GET  /admin/reset_memory/");
    println!("  POST /ask_sherlock/  (form: text, user_id, channel_id)");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}
