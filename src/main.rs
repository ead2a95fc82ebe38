//! # Speech Studio Backend - Main Application Entry Point
//!
//! Actix-web server exposing speech-to-text over two transports: a realtime
//! WebSocket session for live microphone audio and a batch HTTP endpoint for
//! whole files, plus an interview library that records uploads and
//! transcribes them in the background.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared application state, model cache handle, metrics
//! - **device**: Compute device selection for model inference
//! - **audio**: PCM/WAV codecs, voice activity detection, segmentation
//! - **models**: Model cache, Whisper engine, batch NDJSON adapter
//! - **websocket**: The realtime streaming transcription session
//! - **interviews**: Interview records, SQLite store, background worker
//! - **handlers**: HTTP request handlers for the REST endpoints
//! - **middleware**: Request logging and per-endpoint metrics
//! - **health**: Health check and system statistics endpoints
//! - **error**: Service error type and HTTP error responses

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod interviews;
mod middleware;
mod models;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use device::create_device_from_string;
use interviews::InterviewStore;
use models::{ModelCache, WhisperLoader};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag, set by the signal handler task and polled by main.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// Loads configuration, prepares the compute device and storage, then runs
/// the HTTP server until a shutdown signal arrives.
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;
    config.ensure_storage_dirs()?;

    info!("Starting speech-studio-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let device = create_device_from_string(&config.models.device);
    info!(
        "Compute device: {}",
        device::DeviceManager::get_device_info(&device)
    );

    let model_cache = Arc::new(ModelCache::new(Box::new(WhisperLoader::new(device.clone()))));
    let interview_store = Arc::new(InterviewStore::open(&config.storage.database_path)?);

    let app_state = AppState::new(config.clone(), device, model_cache, interview_store);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // Permissive CORS: the browser frontend is served from a different origin
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::EndpointMetrics)
            .wrap(middleware::RequestLogger)
            .route("/health", web::get().to(health::health_check))
            .route(
                "/ws/transcriptions",
                web::get().to(websocket::transcription_websocket),
            )
            .service(
                web::scope("/v1")
                    .route(
                        "/audio/transcriptions",
                        web::post().to(handlers::transcribe_upload),
                    )
                    .route("/models", web::get().to(handlers::list_models))
                    .route("/models", web::delete().to(handlers::release_model))
                    .route("/interviews", web::post().to(handlers::create_interview))
                    .route("/interviews", web::get().to(handlers::list_interviews))
                    .route("/interviews/{id}", web::get().to(handlers::get_interview))
                    .route(
                        "/interviews/{id}/transcript",
                        web::get().to(handlers::get_interview_transcript),
                    )
                    .route(
                        "/interviews/{id}",
                        web::delete().to(handlers::delete_interview),
                    )
                    .route("/system/stats", web::get().to(health::system_stats)),
            )
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Race the server against the shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) subscriber.
///
/// `RUST_LOG` controls verbosity; without it the server logs its own modules
/// at debug and actix at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_studio_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag; returns once shutdown has been requested.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
