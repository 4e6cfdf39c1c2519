use crate::{config::AppConfig, error::AppResult, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Configuration as exposed over HTTP. The agent API key is never echoed back.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "agent": {
            "url": config.agent.url,
            "api_key": if config.agent.api_key.is_empty() { "" } else { "***" },
            "connect_timeout_ms": config.agent.connect_timeout_ms
        },
        "audio": {
            "encoding": config.audio.encoding,
            "sample_rate": config.audio.sample_rate,
            "container": config.audio.container,
            "inbound_frame_bytes": config.audio.inbound_frame_bytes,
            "frames_per_block": config.audio.frames_per_block,
            "block_size": config.audio.block_size()
        },
        "session": config.session,
        "performance": config.performance
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Partial update of the per-call settings. New values apply to calls that start afterwards.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};

    fn app_state() -> AppState {
        let mut config = AppConfig::default();
        config.agent.api_key = "secret-key".to_string();
        AppState::new(config)
    }

    #[actix_web::test]
    async fn test_get_config_redacts_api_key() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state()))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["agent"]["api_key"], "***");
        assert_eq!(body["config"]["audio"]["block_size"], 3200);
        assert!(!body.to_string().contains("secret-key"));
    }

    #[actix_web::test]
    async fn test_update_config_applies_valid_changes() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"session": {"greeting": "Hi there"}, "performance": {"max_concurrent_sessions": 3}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let config = state.get_config();
        assert_eq!(config.session.greeting, "Hi there");
        assert_eq!(config.performance.max_concurrent_sessions, 3);
    }

    #[actix_web::test]
    async fn test_update_config_rejects_invalid_values() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"performance": {"audio_queue_capacity": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().performance.audio_queue_capacity, 256);
    }
}
