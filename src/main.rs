use chrono::{Local, TimeZone};
use rebalance_client::backend::BackendClient;
use rebalance_client::core::{AppConfig, AppError, AppState};
use rebalance_client::rebalance::driver;
use rebalance_client::rebalance::session::Notice;
use rebalance_client::rebalance::SessionSnapshot;
use rebalance_client::store::FlagStore;
use rebalance_client::{api, bootstrap};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
        r#"Usage:
    cargo run -- serve
    cargo run -- rebalance
    cargo run -- status

Env:
    BACKEND_API_URL (default http://localhost:8080/api)
    REBALANCE_TRIGGER_TIMEOUT_SECS (default 60)
    REBALANCE_STATE_FILE (default rebalance_state.json)
    SERVER_ADDR (serve only; default 127.0.0.1:8090)

Optional:
    RUST_LOG (default info for serve, warn otherwise)
    LOG_JSON (1/true switches log output to JSON lines)
"#
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let cmd = args.next().unwrap_or_else(|| "serve".to_string());
    if let Some(extra) = args.next() {
        eprintln!("Unexpected argument: {extra}\n\n{}", usage());
        std::process::exit(2);
    }

    let config = AppConfig::from_env()?;

    match cmd.as_str() {
        "serve" => {
            init_tracing(&config, "info");
            run_server(config).await?
        }
        "rebalance" => {
            init_tracing(&config, "warn");
            run_rebalance(config).await?
        }
        "status" => {
            let flag = FlagStore::open(&config.state_file);
            let status = serde_json::json!({
                "backend_api_url": config.backend_api_url,
                "state_file": config.state_file.display().to_string(),
                "trigger_timeout_secs": config.trigger_timeout.as_secs(),
                "has_rebalanced": flag.has_rebalanced(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        _ => {
            eprintln!("Unknown command: {}\n\n{}", cmd, usage());
            std::process::exit(2);
        }
    }

    Ok(())
}

fn init_tracing(config: &AppConfig, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_server(config: AppConfig) -> Result<(), AppError> {
    let addr: std::net::SocketAddr =
        config
            .server_addr
            .parse()
            .map_err(|e| AppError::InvalidConfig {
                key: "SERVER_ADDR",
                reason: format!("{e}"),
            })?;

    let flag = Arc::new(FlagStore::open(&config.state_file));
    let backend = Arc::new(BackendClient::new(&config.backend_api_url)?);
    let (session, _driver) = driver::spawn(backend, flag.clone(), config.trigger_timeout);

    let state = AppState {
        config: Arc::new(config),
        flag,
        session,
    };

    bootstrap::initialize_on_startup(&state).await?;

    let app = api::router(state);
    println!("Listening on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| AppError::Backend(e.to_string()))?;
    Ok(())
}

/// Run one session in the foreground and print each displayed step.
async fn run_rebalance(config: AppConfig) -> Result<(), AppError> {
    let flag = Arc::new(FlagStore::open(&config.state_file));
    let backend = Arc::new(BackendClient::new(&config.backend_api_url)?);
    let (session, _driver) = driver::spawn(backend, flag, config.trigger_timeout);

    println!("{}...", session.snapshot().start_label);
    session.start().await?;

    let mut updates = session.subscribe();
    let mut printed = 0usize;
    let settled = loop {
        let snap = updates.borrow_and_update().clone();
        for entry in snap.events.iter().skip(printed) {
            println!(
                "[{:>3}%] {} {}",
                entry.displayed_percentage,
                clock(entry.event.timestamp),
                entry.event.message
            );
        }
        printed = snap.events.len();
        if snap.state.is_terminal() {
            break snap;
        }

        tokio::select! {
            changed = updates.changed() => changed.map_err(|_| AppError::SessionClosed)?,
            _ = tokio::signal::ctrl_c() => {
                session.cancel().await?;
                println!("Stopped watching. The backend may still finish this rebalance.");
                return Ok(());
            }
        }
    };

    // The stream can finish before the trigger response lands; give the
    // outcome a moment to attach so the summary has counts.
    let settled = if settled.outcome.is_none() && settled.failure.is_none() {
        tokio::time::timeout(
            Duration::from_secs(5),
            session.wait_for(|s| s.outcome.is_some()),
        )
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or(settled)
    } else {
        settled
    };

    if !report(&settled) {
        std::process::exit(1);
    }
    Ok(())
}

/// Print the final summary. Returns `false` for a failed session.
fn report(snap: &SessionSnapshot) -> bool {
    match snap.notice {
        Some(Notice::AlreadyProcessed) => {
            let reason = snap
                .outcome
                .as_ref()
                .and_then(|o| o.skipped_reason.clone())
                .unwrap_or_default();
            println!("Already rebalanced this month. {reason}");
            true
        }
        Some(Notice::Completed) => {
            match &snap.outcome {
                Some(o) => println!(
                    "Rebalance complete: {} trades, {} new positions{}",
                    o.trades_executed,
                    o.new_positions_opened,
                    if o.selected_symbols.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", o.selected_symbols.join(", "))
                    }
                ),
                None => println!("Rebalance complete."),
            }
            true
        }
        _ => {
            let message = snap
                .failure
                .as_ref()
                .map(|f| f.message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            eprintln!("Rebalance failed ({:?}): {message}", snap.state);
            eprintln!("Run `rebalance` again to retry.");
            false
        }
    }
}

fn clock(timestamp_ms: i64) -> String {
    Local
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .filter(|_| timestamp_ms > 0)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}
