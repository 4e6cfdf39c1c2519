//! # Voice Relay Bridge - Main Application Entry Point
//!
//! Relays phone calls between Twilio Media Streams and a conversational voice agent. Twilio
//! opens a WebSocket to `/twilio` for each call; the bridge opens a second WebSocket to the
//! agent and shuttles audio both ways until either side hangs up.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared configuration, call slots and bridge counters
//! - **health**: banner, health and metrics endpoints
//! - **handlers**: runtime configuration API
//! - **websocket**: the Twilio-facing WebSocket actor
//! - **bridge**: one call session and its three concurrent duties
//! - **telephony / agent / audio**: wire formats of the two legs and the audio batching
//! - **error**: HTTP error responses and per-call bridge errors

mod agent;
mod audio;
mod bridge;
mod config;
mod error;
mod handlers;
mod health;
mod state;
mod telephony;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use error::AppError;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ## Startup Sequence:
/// 1. Load `.env` and set up structured logging
/// 2. Load and validate configuration
/// 3. Build shared state and the HTTP server
/// 4. Serve until the server fails or SIGINT/SIGTERM arrives, then drain gracefully
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    // TLS for the outbound agent connection; a second install attempt is harmless
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!("Starting voice-relay-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, agent {}",
        config.server.host, config.server.port, config.agent.url
    );
    if config.agent.api_key.is_empty() {
        warn!("DEEPGRAM_API_KEY is not set; the agent will reject every call");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().error_handler(|err, _req| {
                AppError::BadRequest(err.to_string()).into()
            }))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/twilio", web::get().to(websocket::twilio_websocket))
            .route("/", web::get().to(health::index))
            .default_service(web::to(not_found))
    })
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        signal = wait_for_shutdown() => {
            signal?;
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls verbosity; defaults to `voice_relay_bridge=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialise tracing")?;

    Ok(())
}

/// Resolves on the first SIGTERM or SIGINT.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C");
    Ok(())
}

async fn not_found(req: actix_web::HttpRequest) -> error::AppResult<actix_web::HttpResponse> {
    Err(AppError::NotFound(format!("No route for {} {}", req.method(), req.path())))
}
