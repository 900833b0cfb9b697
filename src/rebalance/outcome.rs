use crate::backend::types::RebalanceResponse;
use serde::Serialize;

/// Substrings the backend uses when a month has already been rebalanced.
///
/// Free-text matching is fragile; the backend should expose a status enum.
/// Until it does, keep this list short and lower-case.
const ALREADY_PROCESSED_MARKERS: &[&str] = &["already rebalanced", "already executed"];

/// Result of one completed trigger call, mapped from [`RebalanceResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceOutcome {
    pub succeeded: bool,
    /// Set when the backend reported the period as already processed.
    pub skipped_reason: Option<String>,
    pub trades_executed: u32,
    pub new_positions_opened: u32,
    pub missed_months: u32,
    pub selected_symbols: Vec<String>,
    /// Backend `endTime`, passed through untouched.
    pub completed_at: String,
    pub message: String,
}

impl RebalanceOutcome {
    pub fn from_response(resp: &RebalanceResponse) -> Self {
        let succeeded = resp.success.unwrap_or(false);

        let message = resp
            .message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .or(resp.error_message.as_deref())
            .unwrap_or_default()
            .to_string();

        let skipped = succeeded
            && (resp.skipped.unwrap_or(false) || is_already_processed_message(&message));

        let first = resp.monthly_results.as_ref().and_then(|m| m.first());

        Self {
            succeeded,
            skipped_reason: skipped.then(|| message.clone()),
            trades_executed: non_negative(resp.total_transactions),
            new_positions_opened: non_negative(first.and_then(|m| m.stocks_purchased)),
            missed_months: non_negative(resp.missed_months),
            selected_symbols: first
                .and_then(|m| m.selected_stocks.clone())
                .unwrap_or_default(),
            completed_at: resp.end_time.clone().unwrap_or_default(),
            message,
        }
    }

    pub fn is_already_processed(&self) -> bool {
        self.skipped_reason.is_some()
    }

    /// Text to show when the backend refused the rebalance.
    pub fn failure_message(&self) -> String {
        if self.message.is_empty() {
            "Rebalance failed".to_string()
        } else {
            self.message.clone()
        }
    }
}

pub fn is_already_processed_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ALREADY_PROCESSED_MARKERS.iter().any(|m| lower.contains(m))
}

fn non_negative(v: Option<i64>) -> u32 {
    v.unwrap_or(0).clamp(0, u32::MAX as i64) as u32
}
