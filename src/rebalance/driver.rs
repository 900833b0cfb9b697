use crate::backend::sse::SseMessage;
use crate::backend::types::RebalanceResponse;
use crate::backend::RebalanceBackend;
use crate::core::AppError;
use crate::rebalance::session::{
    Failure, FailureKind, RebalanceSession, SessionError, SessionSnapshot,
};
use crate::rebalance::subscription::Subscription;
use crate::store::FlagStore;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply = oneshot::Sender<Result<SessionSnapshot, SessionError>>;

enum Command {
    Start(Reply),
    Retry(Reply),
    Cancel(Reply),
    Dismiss(Reply),
}

/// Inputs posted back by the trigger and stream tasks of one attempt.
#[derive(Debug)]
enum Input {
    Trigger {
        attempt: u64,
        result: Result<RebalanceResponse, Failure>,
    },
    StreamOpened {
        attempt: u64,
    },
    StreamMessage {
        attempt: u64,
        msg: SseMessage,
    },
    StreamError {
        attempt: u64,
        message: String,
    },
    StreamEnded {
        attempt: u64,
    },
}

impl Input {
    fn attempt(&self) -> u64 {
        match self {
            Input::Trigger { attempt, .. }
            | Input::StreamOpened { attempt }
            | Input::StreamMessage { attempt, .. }
            | Input::StreamError { attempt, .. }
            | Input::StreamEnded { attempt } => *attempt,
        }
    }
}

/// Cloneable front door to the session driver task.
///
/// Every method returns as soon as the driver has applied the command;
/// progress and completion are observed through snapshots.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub async fn start(&self) -> Result<SessionSnapshot, AppError> {
        self.request(Command::Start).await
    }

    pub async fn retry(&self) -> Result<SessionSnapshot, AppError> {
        self.request(Command::Retry).await
    }

    pub async fn cancel(&self) -> Result<SessionSnapshot, AppError> {
        self.request(Command::Cancel).await
    }

    pub async fn dismiss(&self) -> Result<SessionSnapshot, AppError> {
        self.request(Command::Dismiss).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `pred`.
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, AppError> {
        let mut rx = self.snapshots.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return Ok(current.clone());
                }
            }
            rx.changed().await.map_err(|_| AppError::SessionClosed)?;
        }
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<SessionSnapshot, AppError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| AppError::SessionClosed)?;
        let snapshot = rx.await.map_err(|_| AppError::SessionClosed)??;
        Ok(snapshot)
    }
}

/// Spawn the task that owns the session.
///
/// The task exits once every [`SessionHandle`] is dropped; exiting releases
/// any live subscription and drops the in-flight trigger request.
pub fn spawn<B: RebalanceBackend>(
    backend: Arc<B>,
    flag: Arc<FlagStore>,
    trigger_timeout: Duration,
) -> (SessionHandle, JoinHandle<()>) {
    let session = RebalanceSession::new();
    let (snap_tx, snap_rx) = watch::channel(session.snapshot(flag.has_rebalanced()));
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (input_tx, input_rx) = mpsc::unbounded_channel();

    let driver = Driver {
        backend,
        flag,
        trigger_timeout,
        session,
        trigger_task: None,
        inputs: input_tx,
        snapshots: snap_tx,
    };
    let task = tokio::spawn(driver.run(cmd_rx, input_rx));

    (
        SessionHandle {
            commands: cmd_tx,
            snapshots: snap_rx,
        },
        task,
    )
}

struct Driver<B> {
    backend: Arc<B>,
    flag: Arc<FlagStore>,
    trigger_timeout: Duration,
    session: RebalanceSession,
    trigger_task: Option<JoinHandle<()>>,
    inputs: mpsc::UnboundedSender<Input>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl<B: RebalanceBackend> Driver<B> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(input) = inputs.recv() => {
                    self.handle_input(input);
                    self.publish();
                }
            }
        }
        debug!("session driver stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        let (reply, result) = match cmd {
            Command::Start(reply) => {
                let r = self.session.start().map(|attempt| self.launch(attempt));
                (reply, r)
            }
            Command::Retry(reply) => {
                let r = self.session.retry().map(|attempt| self.launch(attempt));
                (reply, r)
            }
            Command::Cancel(reply) => {
                let r = self.session.cancel().map(|()| self.abort_trigger());
                (reply, r)
            }
            Command::Dismiss(reply) => (reply, self.session.dismiss()),
        };

        self.publish();
        let _ = reply.send(result.map(|()| self.current()));
    }

    fn launch(&mut self, attempt: u64) {
        self.abort_trigger();

        let backend = self.backend.clone();
        let inputs = self.inputs.clone();
        let timeout = self.trigger_timeout;
        self.trigger_task = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, backend.trigger_rebalance()).await {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(e)) => Err(Failure::new(FailureKind::TriggerRejected, failure_text(&e))),
                Err(_) => Err(Failure::new(
                    FailureKind::TriggerTimedOut,
                    format!("no response from backend within {}s", timeout.as_secs()),
                )),
            };
            let _ = inputs.send(Input::Trigger { attempt, result });
        }));

        let reader = tokio::spawn(read_progress(
            self.backend.clone(),
            attempt,
            self.inputs.clone(),
        ));
        self.session
            .attach_subscription(Subscription::new(attempt, reader));
    }

    fn handle_input(&mut self, input: Input) {
        if input.attempt() != self.session.attempt() {
            debug!(
                input_attempt = input.attempt(),
                attempt = self.session.attempt(),
                "dropping input from an earlier attempt"
            );
            return;
        }

        match input {
            Input::Trigger { result, .. } => {
                self.trigger_task = None;
                match result {
                    Ok(resp) => {
                        self.session.on_trigger_response(&resp);
                        self.record_first_rebalance();
                    }
                    Err(failure) => self.session.on_trigger_failed(failure),
                }
            }
            Input::StreamOpened { .. } => self.session.on_stream_opened(),
            Input::StreamMessage { msg, .. } => self.session.on_stream_message(&msg),
            Input::StreamError { message, .. } => self.session.on_stream_error(message),
            Input::StreamEnded { .. } => self.session.on_stream_ended(),
        }
    }

    fn record_first_rebalance(&self) {
        let succeeded = self.session.outcome().map_or(false, |o| o.succeeded);
        if !succeeded || self.flag.has_rebalanced() {
            return;
        }
        if let Err(e) = self.flag.mark_rebalanced() {
            warn!(error = %e, "failed to persist first-rebalance flag");
        }
    }

    fn abort_trigger(&mut self) {
        if let Some(task) = self.trigger_task.take() {
            info!(attempt = self.session.attempt(), "dropping in-flight trigger request");
            task.abort();
        }
    }

    fn current(&self) -> SessionSnapshot {
        self.session.snapshot(self.flag.has_rebalanced())
    }

    fn publish(&self) {
        let next = self.current();
        self.snapshots.send_if_modified(|cur| {
            if *cur == next {
                false
            } else {
                *cur = next;
                true
            }
        });
    }
}

impl<B> Drop for Driver<B> {
    fn drop(&mut self) {
        if let Some(task) = self.trigger_task.take() {
            task.abort();
        }
    }
}

async fn read_progress<B: RebalanceBackend>(
    backend: Arc<B>,
    attempt: u64,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let mut stream = match backend.open_progress().await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = inputs.send(Input::StreamError {
                attempt,
                message: failure_text(&e),
            });
            return;
        }
    };
    let _ = inputs.send(Input::StreamOpened { attempt });

    while let Some(item) = stream.next().await {
        let sent = match item {
            Ok(msg) => inputs.send(Input::StreamMessage { attempt, msg }),
            Err(e) => {
                let _ = inputs.send(Input::StreamError {
                    attempt,
                    message: failure_text(&e),
                });
                return;
            }
        };
        if sent.is_err() {
            return;
        }
    }
    let _ = inputs.send(Input::StreamEnded { attempt });
}

/// Backend messages are shown verbatim, without our error prefix.
fn failure_text(e: &AppError) -> String {
    match e {
        AppError::Backend(msg) => msg.clone(),
        other => other.to_string(),
    }
}
