use axum::{
    routing::{get, post},
    Router,
};

pub fn router() -> Router<crate::core::AppState> {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/rebalance/session", get(rebalance::session))
        .route("/api/rebalance/start", post(rebalance::start))
        .route("/api/rebalance/retry", post(rebalance::retry))
        .route("/api/rebalance/cancel", post(rebalance::cancel))
        .route("/api/rebalance/dismiss", post(rebalance::dismiss))
}

mod health {
    use axum::{extract::State, Json};
    use serde_json::json;

    use crate::core::AppState;

    pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
        Json(json!({
            "status": "ok",
            "backend": state.config.backend_api_url,
            "has_rebalanced": state.flag.has_rebalanced(),
        }))
    }
}

mod rebalance {
    use axum::{extract::State, http::StatusCode, Json};

    use crate::{
        core::{AppError, AppState},
        rebalance::SessionSnapshot,
    };

    type ApiResult = Result<Json<SessionSnapshot>, (StatusCode, String)>;

    pub async fn session(State(state): State<AppState>) -> Json<SessionSnapshot> {
        Json(state.session.snapshot())
    }

    pub async fn start(State(state): State<AppState>) -> ApiResult {
        state.session.start().await.map(Json).map_err(into_response)
    }

    pub async fn retry(State(state): State<AppState>) -> ApiResult {
        state.session.retry().await.map(Json).map_err(into_response)
    }

    pub async fn cancel(State(state): State<AppState>) -> ApiResult {
        state.session.cancel().await.map(Json).map_err(into_response)
    }

    pub async fn dismiss(State(state): State<AppState>) -> ApiResult {
        state.session.dismiss().await.map(Json).map_err(into_response)
    }

    fn into_response(e: AppError) -> (StatusCode, String) {
        match e {
            AppError::Session(e) => (StatusCode::CONFLICT, e.to_string()),
            other => (StatusCode::SERVICE_UNAVAILABLE, other.to_string()),
        }
    }
}
