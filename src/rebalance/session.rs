use crate::backend::sse::SseMessage;
use crate::backend::types::RebalanceResponse;
use crate::rebalance::outcome::RebalanceOutcome;
use crate::rebalance::progress::{
    ProgressEntry, ProgressEvent, ProgressKind, ProgressTracker, PROGRESS_EVENT_NAME,
};
use crate::rebalance::subscription::Subscription;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Succeeded,
    Failed,
    FailedToStart,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Streaming)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::FailedToStart)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::FailedToStart)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Non-2xx status, unreadable body, or `success=false`.
    TriggerRejected,
    TriggerTimedOut,
    /// Transport failure on the progress stream after events arrived.
    StreamError,
    /// The backend reported an `error` step on the progress stream.
    ProgressError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What a finished session should tell the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    Completed,
    /// The backend had already rebalanced this period. Not an error.
    AlreadyProcessed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("a rebalance is already running")]
    AlreadyRunning,
    #[error("no rebalance is running")]
    NotRunning,
    #[error("the rebalance has not finished yet")]
    NotTerminal,
    #[error("only a failed rebalance can be retried")]
    NotFailed,
}

/// Immutable view of a session for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub attempt: u64,
    pub state: SessionState,
    pub percentage: u8,
    pub current_message: Option<String>,
    pub events: Vec<ProgressEntry>,
    pub outcome: Option<RebalanceOutcome>,
    pub failure: Option<Failure>,
    pub notice: Option<Notice>,
    pub can_start: bool,
    pub can_retry: bool,
    pub can_cancel: bool,
    pub can_dismiss: bool,
    pub has_rebalanced: bool,
    pub start_label: &'static str,
}

/// State machine for one rebalance attempt at a time.
///
/// Two loosely correlated channels feed it: the trigger call (one response,
/// arrives whenever the backend finishes) and the progress stream (many
/// events). Either can deliver the completion signal first. Whichever lands
/// second finds the session terminal and cannot move it; a late trigger
/// response still attaches its outcome.
///
/// The machine does no I/O. [`crate::rebalance::driver`] owns it on a single
/// task and feeds it inputs.
#[derive(Debug)]
pub struct RebalanceSession {
    state: SessionState,
    attempt: u64,
    events: Vec<ProgressEntry>,
    tracker: ProgressTracker,
    outcome: Option<RebalanceOutcome>,
    failure: Option<Failure>,
    subscription: Option<Subscription>,
}

impl Default for RebalanceSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RebalanceSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            attempt: 0,
            events: Vec::new(),
            tracker: ProgressTracker::default(),
            outcome: None,
            failure: None,
            subscription: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn outcome(&self) -> Option<&RebalanceOutcome> {
        self.outcome.as_ref()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn events(&self) -> &[ProgressEntry] {
        &self.events
    }

    pub fn percentage(&self) -> u8 {
        self.tracker.displayed()
    }

    pub fn has_subscription(&self) -> bool {
        self.subscription.as_ref().map_or(false, |s| !s.is_closed())
    }

    pub fn notice(&self) -> Option<Notice> {
        match self.state {
            SessionState::Succeeded => Some(
                if self.outcome.as_ref().map_or(false, |o| o.is_already_processed()) {
                    Notice::AlreadyProcessed
                } else {
                    Notice::Completed
                },
            ),
            SessionState::Failed | SessionState::FailedToStart => Some(Notice::Failed),
            _ => None,
        }
    }

    /// Begin a new attempt. Returns the attempt number the driver must tag
    /// its trigger and stream inputs with.
    pub fn start(&mut self) -> Result<u64, SessionError> {
        if self.state.is_active() {
            return Err(SessionError::AlreadyRunning);
        }
        self.clear();
        self.attempt += 1;
        self.state = SessionState::Starting;
        info!(attempt = self.attempt, "rebalance session starting");
        Ok(self.attempt)
    }

    pub fn retry(&mut self) -> Result<u64, SessionError> {
        if !self.state.is_failure() {
            return Err(SessionError::NotFailed);
        }
        self.start()
    }

    /// Hand the session ownership of the stream reader for the current
    /// attempt. A subscription that arrives after the session stopped
    /// caring is released immediately.
    pub fn attach_subscription(&mut self, mut sub: Subscription) {
        if !self.state.is_active() || sub.attempt() != self.attempt || self.subscription.is_some() {
            debug!(
                attempt = sub.attempt(),
                state = ?self.state,
                "discarding stale progress subscription"
            );
            sub.close();
            return;
        }
        self.subscription = Some(sub);
    }

    pub fn on_stream_opened(&mut self) {
        if self.state == SessionState::Starting {
            self.state = SessionState::Streaming;
            debug!(attempt = self.attempt, "progress stream open");
        }
    }

    /// Decode and apply one raw server-sent event. Malformed payloads are
    /// logged and dropped without touching state.
    pub fn on_stream_message(&mut self, msg: &SseMessage) {
        if msg.event != PROGRESS_EVENT_NAME {
            debug!(event = %msg.event, "ignoring non-progress stream event");
            return;
        }
        match ProgressEvent::from_json(&msg.data) {
            Ok(event) => self.on_progress_event(event),
            Err(e) => warn!(error = %e, data = %msg.data, "dropping malformed progress event"),
        }
    }

    pub fn on_progress_event(&mut self, event: ProgressEvent) {
        if !self.state.is_active() {
            debug!(state = ?self.state, kind = ?event.kind, "progress event after session settled");
            return;
        }
        if let ProgressKind::Unknown(raw) = &event.kind {
            debug!(kind = %raw, "ignoring unknown progress step");
            return;
        }

        self.state = SessionState::Streaming;
        let displayed = self.tracker.apply(&event);
        debug!(
            attempt = self.attempt,
            kind = ?event.kind,
            raw = event.percentage,
            displayed,
            "progress"
        );

        let kind = event.kind.clone();
        let message = event.message.clone();
        self.events.push(ProgressEntry {
            event,
            displayed_percentage: displayed,
        });

        match kind {
            ProgressKind::Complete => self.succeed(),
            ProgressKind::Error => self.fail(Failure::new(FailureKind::ProgressError, message)),
            _ => {}
        }
    }

    /// The stream reader hit a transport error.
    pub fn on_stream_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.release_subscription();
        if !self.state.is_active() {
            return;
        }
        if self.events.is_empty() {
            // Nothing shown yet; the trigger response still decides.
            warn!(attempt = self.attempt, error = %message, "progress stream failed before any event");
            return;
        }
        self.fail(Failure::new(FailureKind::StreamError, message));
    }

    /// The server closed the stream without a terminal event.
    pub fn on_stream_ended(&mut self) {
        self.release_subscription();
        if self.state.is_active() {
            debug!(attempt = self.attempt, "progress stream ended; waiting for trigger response");
        }
    }

    pub fn on_trigger_response(&mut self, resp: &RebalanceResponse) {
        let outcome = RebalanceOutcome::from_response(resp);
        info!(
            attempt = self.attempt,
            succeeded = outcome.succeeded,
            skipped = outcome.is_already_processed(),
            trades = outcome.trades_executed,
            new_positions = outcome.new_positions_opened,
            "rebalance trigger resolved"
        );

        match self.state {
            SessionState::Starting | SessionState::Streaming => {
                let succeeded = outcome.succeeded;
                let failure_message = outcome.failure_message();
                self.outcome = Some(outcome);
                if succeeded {
                    self.succeed();
                } else {
                    self.fail(Failure::new(FailureKind::TriggerRejected, failure_message));
                }
            }
            SessionState::Succeeded | SessionState::Failed | SessionState::FailedToStart => {
                if self.outcome.is_none() {
                    if self.state == SessionState::Succeeded && !outcome.succeeded {
                        warn!(
                            attempt = self.attempt,
                            message = %outcome.message,
                            "trigger reported failure after stream reported completion"
                        );
                    }
                    self.outcome = Some(outcome);
                }
            }
            SessionState::Idle => {
                debug!("trigger response for an abandoned session");
            }
        }
    }

    /// The trigger call itself failed: transport error, non-2xx, timeout.
    pub fn on_trigger_failed(&mut self, failure: Failure) {
        if !self.state.is_active() {
            debug!(state = ?self.state, error = %failure.message, "trigger failure after session settled");
            return;
        }
        warn!(attempt = self.attempt, kind = ?failure.kind, error = %failure.message, "rebalance trigger failed");
        self.fail(failure);
    }

    /// Stop watching. The backend keeps running whatever it was asked to do.
    pub fn cancel(&mut self) -> Result<(), SessionError> {
        if !self.state.is_active() {
            return Err(SessionError::NotRunning);
        }
        info!(attempt = self.attempt, "rebalance session cancelled locally");
        self.clear();
        self.state = SessionState::Idle;
        Ok(())
    }

    pub fn dismiss(&mut self) -> Result<(), SessionError> {
        if !self.state.is_terminal() {
            return Err(SessionError::NotTerminal);
        }
        self.clear();
        self.state = SessionState::Idle;
        Ok(())
    }

    pub fn snapshot(&self, has_rebalanced: bool) -> SessionSnapshot {
        SessionSnapshot {
            attempt: self.attempt,
            state: self.state,
            percentage: self.tracker.displayed(),
            current_message: self.events.last().map(|e| e.event.message.clone()),
            events: self.events.clone(),
            outcome: self.outcome.clone(),
            failure: self.failure.clone(),
            notice: self.notice(),
            can_start: !self.state.is_active(),
            can_retry: self.state.is_failure(),
            can_cancel: self.state.is_active(),
            can_dismiss: self.state.is_terminal(),
            has_rebalanced,
            start_label: if has_rebalanced {
                "Run monthly rebalance"
            } else {
                "Run first rebalance"
            },
        }
    }

    fn succeed(&mut self) {
        self.tracker.complete();
        self.state = SessionState::Succeeded;
        self.release_subscription();
        info!(attempt = self.attempt, "rebalance session succeeded");
    }

    fn fail(&mut self, failure: Failure) {
        self.state = if self.events.is_empty() {
            SessionState::FailedToStart
        } else {
            SessionState::Failed
        };
        warn!(
            attempt = self.attempt,
            state = ?self.state,
            kind = ?failure.kind,
            error = %failure.message,
            "rebalance session failed"
        );
        self.failure = Some(failure);
        self.release_subscription();
    }

    fn release_subscription(&mut self) {
        if let Some(mut sub) = self.subscription.take() {
            sub.close();
        }
    }

    fn clear(&mut self) {
        self.release_subscription();
        self.events.clear();
        self.tracker.reset();
        self.outcome = None;
        self.failure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalance::subscription::testing::CountingRelease;

    fn response(body: &str) -> RebalanceResponse {
        serde_json::from_str(body).unwrap()
    }

    fn progress(kind: ProgressKind, pct: u8) -> ProgressEvent {
        ProgressEvent::new(kind, "step", pct)
    }

    fn started() -> (RebalanceSession, CountingRelease) {
        let mut s = RebalanceSession::new();
        let attempt = s.start().unwrap();
        let counter = CountingRelease::default();
        s.attach_subscription(Subscription::new(attempt, counter.clone()));
        s.on_stream_opened();
        (s, counter)
    }

    #[test]
    fn starts_idle_and_enables_start() {
        let s = RebalanceSession::new();
        let snap = s.snapshot(false);
        assert_eq!(snap.state, SessionState::Idle);
        assert!(snap.can_start);
        assert!(!snap.can_cancel);
        assert_eq!(snap.start_label, "Run first rebalance");
        assert_eq!(s.snapshot(true).start_label, "Run monthly rebalance");
    }

    #[test]
    fn start_while_running_is_rejected() {
        let (mut s, _) = started();
        assert_eq!(s.start(), Err(SessionError::AlreadyRunning));
        assert_eq!(s.attempt(), 1);
    }

    #[test]
    fn complete_event_then_response_attaches_outcome() {
        let (mut s, counter) = started();
        s.on_progress_event(progress(ProgressKind::Screening, 20));
        s.on_progress_event(progress(ProgressKind::Buying, 60));
        s.on_progress_event(progress(ProgressKind::Complete, 100));
        assert_eq!(s.state(), SessionState::Succeeded);
        assert_eq!(counter.count(), 1);

        s.on_trigger_response(&response(
            r#"{"success":true,"totalTransactions":5,"monthlyResults":[{"stocksPurchased":5}]}"#,
        ));
        assert_eq!(s.state(), SessionState::Succeeded);
        let o = s.outcome().unwrap();
        assert_eq!((o.trades_executed, o.new_positions_opened), (5, 5));
        assert_eq!(s.notice(), Some(Notice::Completed));
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn response_first_then_late_events_are_ignored() {
        let (mut s, counter) = started();
        s.on_progress_event(progress(ProgressKind::Screening, 20));
        s.on_trigger_response(&response(r#"{"success":true,"totalTransactions":3}"#));
        assert_eq!(s.state(), SessionState::Succeeded);
        assert_eq!(s.percentage(), 100);
        assert_eq!(counter.count(), 1);

        s.on_progress_event(progress(ProgressKind::Error, 0));
        assert_eq!(s.state(), SessionState::Succeeded);
        assert_eq!(s.events().len(), 1);
    }

    #[test]
    fn already_processed_is_not_a_failure() {
        let (mut s, _) = started();
        s.on_trigger_response(&response(
            r#"{"success":true,"message":"Already rebalanced this month"}"#,
        ));
        assert_eq!(s.state(), SessionState::Succeeded);
        assert_eq!(s.notice(), Some(Notice::AlreadyProcessed));
        assert!(s.failure().is_none());
        assert!(!s.snapshot(true).can_retry);
    }

    #[test]
    fn rejection_before_events_is_failed_to_start() {
        let (mut s, counter) = started();
        s.on_trigger_failed(Failure::new(FailureKind::TriggerRejected, "HTTP 500"));
        assert_eq!(s.state(), SessionState::FailedToStart);
        assert_eq!(s.failure().unwrap().message, "HTTP 500");
        assert_eq!(counter.count(), 1);
        let snap = s.snapshot(false);
        assert!(snap.can_start && snap.can_retry && snap.can_dismiss);
        assert_eq!(snap.notice, Some(Notice::Failed));
    }

    #[test]
    fn success_false_after_events_is_failed_with_events_kept() {
        let (mut s, _) = started();
        s.on_progress_event(progress(ProgressKind::Screening, 30));
        s.on_trigger_response(&response(r#"{"success":false,"errorMessage":"No cash"}"#));
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(s.events().len(), 1);
        assert_eq!(s.failure().unwrap().kind, FailureKind::TriggerRejected);
        assert_eq!(s.failure().unwrap().message, "No cash");
    }

    #[test]
    fn error_event_freezes_percentage() {
        let (mut s, counter) = started();
        s.on_progress_event(progress(ProgressKind::Buying, 70));
        s.on_progress_event(ProgressEvent::new(ProgressKind::Error, "broker down", 0));
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(s.percentage(), 70);
        assert_eq!(s.failure().unwrap().kind, FailureKind::ProgressError);
        assert_eq!(s.failure().unwrap().message, "broker down");
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn stream_error_after_events_fails_and_preserves_log() {
        let (mut s, counter) = started();
        s.on_progress_event(progress(ProgressKind::Screening, 10));
        s.on_progress_event(progress(ProgressKind::FetchingPrices, 35));
        s.on_stream_error("connection reset");
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(s.events().len(), 2);
        assert_eq!(s.snapshot(false).percentage, 35);
        assert_eq!(counter.count(), 1);

        // The response arriving later does not revive the session.
        s.on_trigger_response(&response(r#"{"success":true}"#));
        assert_eq!(s.state(), SessionState::Failed);
        assert!(s.outcome().unwrap().succeeded);
    }

    #[test]
    fn stream_error_before_events_defers_to_trigger() {
        let (mut s, counter) = started();
        s.on_stream_error("refused");
        assert_eq!(s.state(), SessionState::Streaming);
        assert_eq!(counter.count(), 1);
        s.on_trigger_response(&response(r#"{"success":true}"#));
        assert_eq!(s.state(), SessionState::Succeeded);
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn regressing_percentages_display_monotonically() {
        let (mut s, _) = started();
        s.on_progress_event(progress(ProgressKind::Screening, 10));
        s.on_progress_event(progress(ProgressKind::Buying, 10));
        s.on_progress_event(progress(ProgressKind::Buying, 5));
        s.on_progress_event(progress(ProgressKind::Complete, 100));
        let shown: Vec<u8> = s.events().iter().map(|e| e.displayed_percentage).collect();
        assert_eq!(shown, vec![10, 10, 10, 100]);
    }

    #[test]
    fn malformed_and_foreign_messages_do_not_change_state() {
        let (mut s, _) = started();
        s.on_stream_message(&SseMessage {
            event: "progress".into(),
            data: "{not json".into(),
        });
        s.on_stream_message(&SseMessage {
            event: "heartbeat".into(),
            data: r#"{"type":"complete"}"#.into(),
        });
        s.on_stream_message(&SseMessage {
            event: "progress".into(),
            data: r#"{"type":"mystery","percentage":99}"#.into(),
        });
        assert_eq!(s.state(), SessionState::Streaming);
        assert!(s.events().is_empty());
        assert_eq!(s.percentage(), 0);
    }

    #[test]
    fn cancel_releases_once_and_returns_idle() {
        let (mut s, counter) = started();
        s.on_progress_event(progress(ProgressKind::Screening, 10));
        s.cancel().unwrap();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.events().is_empty());
        assert_eq!(s.cancel(), Err(SessionError::NotRunning));
        drop(s);
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn teardown_releases_live_subscription() {
        let (s, counter) = started();
        drop(s);
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn dismiss_only_from_terminal() {
        let (mut s, _) = started();
        assert_eq!(s.dismiss(), Err(SessionError::NotTerminal));
        s.on_progress_event(progress(ProgressKind::Complete, 100));
        s.dismiss().unwrap();
        let snap = s.snapshot(true);
        assert_eq!(snap.state, SessionState::Idle);
        assert!(snap.events.is_empty());
        assert!(snap.outcome.is_none());
        assert_eq!(snap.percentage, 0);
    }

    #[test]
    fn retry_only_after_failure() {
        let (mut s, _) = started();
        assert_eq!(s.retry(), Err(SessionError::NotFailed));
        s.on_trigger_failed(Failure::new(FailureKind::TriggerTimedOut, "timed out"));
        assert_eq!(s.retry(), Ok(2));
        assert_eq!(s.state(), SessionState::Starting);
        assert!(s.failure().is_none());
    }

    #[test]
    fn stale_subscription_is_released_immediately() {
        let mut s = RebalanceSession::new();
        s.start().unwrap();
        s.cancel().unwrap();
        let counter = CountingRelease::default();
        s.attach_subscription(Subscription::new(1, counter.clone()));
        assert_eq!(counter.count(), 1);
        assert!(!s.has_subscription());
    }
}
