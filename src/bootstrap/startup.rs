use crate::core::{AppError, AppState};
use tracing::{info, warn};

/// Report what the process loaded before it starts taking commands.
///
/// The first-rebalance flag is read exactly once, when the store is opened;
/// this only logs the result so first-run copy is explainable from the logs.
pub async fn initialize_on_startup(state: &AppState) -> Result<(), AppError> {
    info!(
        backend = %state.config.backend_api_url,
        trigger_timeout_secs = state.config.trigger_timeout.as_secs(),
        state_file = %state.flag.path().display(),
        has_rebalanced = state.flag.has_rebalanced(),
        "startup"
    );

    if !state.flag.has_rebalanced() {
        info!("no completed rebalance recorded; first-run mode");
    }

    let snapshot = state.session.snapshot();
    if !snapshot.can_start {
        warn!(state = ?snapshot.state, "session not idle at startup");
    }

    Ok(())
}
