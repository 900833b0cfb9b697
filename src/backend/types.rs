use serde::{Deserialize, Serialize};

/// Body of `POST /trading/rebalance`.
///
/// Every field is optional: the backend omits nulls inconsistently and an
/// internal-error response can come back with an empty object.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub skipped: Option<bool>,
    #[serde(default)]
    pub total_transactions: Option<i64>,
    #[serde(default)]
    pub missed_months: Option<i64>,
    #[serde(default)]
    pub monthly_results: Option<Vec<MonthlyResult>>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyResult {
    #[serde(default)]
    pub rebalance_date: Option<String>,
    #[serde(default)]
    pub selected_stocks: Option<Vec<String>>,
    #[serde(default)]
    pub stocks_purchased: Option<i64>,
    #[serde(default)]
    pub total_invested: Option<String>,
}

/// JSON payload of a `progress` server-sent event.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProgressPayload {
    #[serde(rename = "type", alias = "kind", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebalance_response_tolerates_nulls_and_missing_fields() {
        let body = r#"{"success":true,"totalTransactions":null,"monthlyResults":null}"#;
        let resp: RebalanceResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.success, Some(true));
        assert!(resp.total_transactions.is_none());
        assert!(resp.monthly_results.is_none());
        assert!(resp.end_time.is_none());

        let empty: RebalanceResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.success.is_none());
    }

    #[test]
    fn progress_payload_accepts_type_or_kind() {
        let a: ProgressPayload =
            serde_json::from_str(r#"{"type":"buying","message":"m","percentage":60,"timestamp":1}"#)
                .unwrap();
        assert_eq!(a.kind.as_deref(), Some("buying"));
        assert_eq!(a.percentage, Some(60.0));

        let b: ProgressPayload = serde_json::from_str(r#"{"kind":"complete"}"#).unwrap();
        assert_eq!(b.kind.as_deref(), Some("complete"));
        assert!(b.message.is_none());
    }
}
