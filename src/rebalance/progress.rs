use crate::backend::types::ProgressPayload;
use serde::Serialize;

/// Named SSE event the backend uses for rebalance progress.
pub const PROGRESS_EVENT_NAME: &str = "progress";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Deposit,
    Screening,
    FetchingPrices,
    Buying,
    GeneratingInsights,
    Complete,
    Error,
    /// A step this client does not know yet. Never terminal.
    Unknown(String),
}

impl ProgressKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "deposit" => Self::Deposit,
            "screening" => Self::Screening,
            "fetching_prices" => Self::FetchingPrices,
            "buying" => Self::Buying,
            "generating_insights" => Self::GeneratingInsights,
            "complete" => Self::Complete,
            "error" => Self::Error,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub message: String,
    /// Raw value as sent, clamped into 0..=100.
    pub percentage: u8,
    /// Epoch milliseconds from the backend. Display only.
    pub timestamp: i64,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, message: impl Into<String>, percentage: u8) -> Self {
        Self {
            kind,
            message: message.into(),
            percentage: percentage.min(100),
            timestamp: 0,
        }
    }

    /// Decode the JSON `data` of a `progress` event.
    ///
    /// A payload without a `type` is rejected; everything else falls back to
    /// defaults.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        let payload: ProgressPayload = serde_json::from_str(data)?;
        let Some(kind) = payload.kind.as_deref() else {
            return Err(<serde_json::Error as serde::de::Error>::missing_field("type"));
        };
        let percentage = payload
            .percentage
            .filter(|p| p.is_finite())
            .map(|p| p.round().clamp(0.0, 100.0) as u8)
            .unwrap_or(0);

        Ok(Self {
            kind: ProgressKind::parse(kind),
            message: payload.message.unwrap_or_default(),
            percentage,
            timestamp: payload.timestamp.unwrap_or(0),
        })
    }
}

/// One applied event together with the percentage that was displayed for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEntry {
    pub event: ProgressEvent,
    pub displayed_percentage: u8,
}

/// Keeps the displayed percentage from ever moving backwards.
///
/// The backend does not promise monotonic percentages. Non-terminal events
/// can only raise the display, `complete` pins it to 100, and `error`
/// freezes whatever was last shown.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    displayed: u8,
}

impl ProgressTracker {
    pub fn displayed(&self) -> u8 {
        self.displayed
    }

    pub fn apply(&mut self, event: &ProgressEvent) -> u8 {
        match event.kind {
            ProgressKind::Complete => self.displayed = 100,
            ProgressKind::Error => {}
            _ => self.displayed = self.displayed.max(event.percentage),
        }
        self.displayed
    }

    pub fn complete(&mut self) {
        self.displayed = 100;
    }

    pub fn reset(&mut self) {
        self.displayed = 0;
    }
}
