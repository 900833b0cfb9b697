use super::error::AppError;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BACKEND_API_URL: &str = "http://localhost:8080/api";
const DEFAULT_TRIGGER_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub backend_api_url: String,
    pub state_file: PathBuf,

    /// Upper bound on the rebalance trigger call. The backend keeps its
    /// progress emitters open for 60s, so anything much longer is pointless.
    pub trigger_timeout: Duration,

    pub log_json: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let server_addr = std::env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8090".into());
        let backend_api_url = std::env::var("BACKEND_API_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_BACKEND_API_URL.to_string());

        if reqwest::Url::parse(&backend_api_url).is_err() {
            return Err(AppError::InvalidConfig {
                key: "BACKEND_API_URL",
                reason: format!("not an absolute URL: {backend_api_url}"),
            });
        }

        let state_file = std::env::var("REBALANCE_STATE_FILE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("rebalance_state.json"));

        let trigger_timeout = match std::env::var("REBALANCE_TRIGGER_TIMEOUT_SECS") {
            Ok(v) => parse_timeout_secs(&v)?,
            Err(_) => Duration::from_secs(DEFAULT_TRIGGER_TIMEOUT_SECS),
        };

        let log_json = parse_bool_env("LOG_JSON").unwrap_or(false);

        Ok(Self {
            server_addr,
            backend_api_url,
            state_file,
            trigger_timeout,
            log_json,
        })
    }
}

fn parse_timeout_secs(raw: &str) -> Result<Duration, AppError> {
    let secs = raw
        .trim()
        .parse::<u64>()
        .map_err(|e| AppError::InvalidConfig {
            key: "REBALANCE_TRIGGER_TIMEOUT_SECS",
            reason: e.to_string(),
        })?;
    if secs == 0 {
        return Err(AppError::InvalidConfig {
            key: "REBALANCE_TRIGGER_TIMEOUT_SECS",
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_bool_env(key: &str) -> Option<bool> {
    let v = std::env::var(key).ok()?;
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    Some(matches!(v, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON"))
}
