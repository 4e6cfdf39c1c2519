//! # Health and Metrics Endpoints
//!
//! - `GET /` returns a plain-text banner
//! - `GET /health` and `GET /api/v1/health` return service status and call load
//! - `GET /api/v1/metrics` returns the bridge counters

use crate::config::AppConfig;
use crate::state::{AppState, BridgeMetrics};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(concat!(
            "voice-relay-bridge v",
            env!("CARGO_PKG_VERSION"),
            ": Twilio media streams are accepted on /twilio\n"
        ))
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "agent": {
            "url": config.agent.url,
            "api_key_configured": !config.agent.api_key.is_empty()
        },
        "sessions": {
            "active": metrics.active_sessions,
            "total": metrics.total_sessions,
            "failed": metrics.failed_sessions
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "active": metrics.active_sessions,
            "total": metrics.total_sessions,
            "completed": metrics.completed_sessions,
            "failed": metrics.failed_sessions,
            "rejected": metrics.rejected_sessions,
            "protocol_violations": metrics.protocol_violations,
            "upstream_failures": metrics.upstream_failures,
            "calls_per_minute": if uptime_seconds > 0 {
                metrics.total_sessions as f64 * 60.0 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "audio": {
            "blocks_forwarded": metrics.blocks_forwarded,
            "bytes_forwarded": metrics.audio_bytes_forwarded,
            "media_events_sent": metrics.media_events_sent,
            "bytes_returned": metrics.audio_bytes_returned,
            "barge_ins": metrics.barge_ins
        },
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "audio_queue_capacity": config.performance.audio_queue_capacity,
            "block_size_bytes": config.audio.block_size()
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let field_bytes = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };

            return json!({
                "resident_memory_bytes": field_bytes("VmRSS:"),
                "virtual_memory_bytes": field_bytes("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "pid": process::id(),
        "available": false
    })
}

/// Load classification from slot usage.
fn get_system_status(config: &AppConfig, metrics: &BridgeMetrics) -> serde_json::Value {
    let session_usage = if config.performance.max_concurrent_sessions > 0 {
        metrics.active_sessions as f64 / config.performance.max_concurrent_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "at_capacity"
    } else if session_usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": config.performance.max_concurrent_sessions,
        "current_sessions": metrics.active_sessions
    })
}
