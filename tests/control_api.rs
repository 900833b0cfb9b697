use axum::{routing::post, Json, Router};
use rebalance_client::api;
use rebalance_client::backend::BackendClient;
use rebalance_client::core::{AppConfig, AppState};
use rebalance_client::rebalance::driver;
use rebalance_client::store::FlagStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

async fn serve(app: Router) -> std::net::SocketAddr {
    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

async fn control_surface() -> String {
    // Already-processed backend without a progress endpoint: the stream
    // fails, the trigger response still settles the session.
    let backend_app = Router::new().route(
        "/api/trading/rebalance",
        post(|| async {
            Json(json!({"success": true, "message": "Already rebalanced this month"}))
        }),
    );
    let backend_addr = serve(backend_app).await;
    let backend_url = format!("http://{backend_addr}/api");

    let state_file = std::env::temp_dir().join(format!(
        "rebalance-control-{}.json",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&state_file);

    let config = AppConfig {
        server_addr: "127.0.0.1:0".to_string(),
        backend_api_url: backend_url.clone(),
        state_file: state_file.clone(),
        trigger_timeout: Duration::from_secs(10),
        log_json: false,
    };
    let flag = Arc::new(FlagStore::open(&state_file));
    let backend = Arc::new(BackendClient::new(&backend_url).unwrap());
    let (session, _task) = driver::spawn(backend, flag.clone(), config.trigger_timeout);

    let state = AppState {
        config: Arc::new(config),
        flag,
        session,
    };
    let addr = serve(api::router(state)).await;
    format!("http://{addr}/api")
}

#[tokio::test]
async fn control_surface_drives_a_session() {
    let base = control_surface().await;
    let http = reqwest::Client::new();

    let health: Value = http
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["has_rebalanced"], false);

    let idle: Value = http
        .get(format!("{base}/rebalance/session"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(idle["state"], "idle");
    assert_eq!(idle["start_label"], "Run first rebalance");

    let early_dismiss = http
        .post(format!("{base}/rebalance/dismiss"))
        .send()
        .await
        .unwrap();
    assert_eq!(early_dismiss.status(), reqwest::StatusCode::CONFLICT);

    let started = http
        .post(format!("{base}/rebalance/start"))
        .send()
        .await
        .unwrap();
    assert!(started.status().is_success());

    let mut settled = Value::Null;
    for _ in 0..100 {
        settled = http
            .get(format!("{base}/rebalance/session"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if settled["can_dismiss"] == true {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(settled["state"], "succeeded");
    assert_eq!(settled["notice"], "already_processed");
    assert_eq!(settled["has_rebalanced"], true);

    let dismissed: Value = http
        .post(format!("{base}/rebalance/dismiss"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dismissed["state"], "idle");
    assert_eq!(dismissed["start_label"], "Run monthly rebalance");
}
