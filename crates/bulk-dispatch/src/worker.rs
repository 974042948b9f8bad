//! Session Worker - one SMPP session and its local queues
//!
//! Each worker runs as its own task and owns:
//! - One session against one endpoint, re-established after a drop
//! - A FIFO send queue fed by the dispatcher
//! - A LIFO retry queue drained ahead of the send queue
//!
//! The dispatcher only ever sees the events a worker reports.

use crate::dispatch_metrics;
use crate::retry::{after_soft_failure, handle_ack, AckDecision, RetryRecord};
use crate::session::{Session, SessionConnector};
use bulk_common::logging::AUDIT_TARGET;
use bulk_common::{Credentials, WorkerCommand, WorkerEvent};
use bulk_smpp::SmppError;
use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendError, TryRecvError, TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Static settings of one worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Slot in the dispatcher's pool
    pub id: usize,
    pub endpoint: String,
    pub credentials: Credentials,
    pub reconnect_backoff: Duration,
    /// Consecutive failed binds tolerated after a session loss
    pub max_reconnect_attempts: u32,
    pub max_submits_per_second: Option<NonZeroU32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Bound,
    Closing,
}

/// What woke an idle worker
enum Wake {
    Command(Option<WorkerCommand>),
    SessionClosed,
    ReconnectDue,
}

/// Dispatcher-side handle to a running worker
pub struct WorkerHandle {
    id: usize,
    commands: mpsc::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Post a command, waiting for channel capacity.
    ///
    /// Fails only when the worker task has exited; the error carries the
    /// command back so a send can be rerouted.
    pub async fn send(&self, command: WorkerCommand) -> Result<(), SendError<WorkerCommand>> {
        self.commands.send(command).await
    }

    /// Post a command without waiting. Returns false if it was not delivered.
    pub fn try_send(&self, command: WorkerCommand) -> bool {
        self.commands.try_send(command).is_ok()
    }

    /// Ask the worker to close once its queues drain.
    pub fn request_close(&self) {
        match self.commands.try_send(WorkerCommand::Close) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(command)) => {
                let commands = self.commands.clone();
                tokio::spawn(async move {
                    let _ = commands.send(command).await;
                });
            }
        }
    }

    /// Wait for the worker to exit, terminating it after `timeout`.
    ///
    /// Returns true if it exited on its own.
    pub async fn join(mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(worker = self.id, timeout_ms = timeout.as_millis() as u64, "Worker did not close in time, terminating");
                self.task.abort();
                let _ = (&mut self.task).await;
                false
            }
        }
    }
}

/// Spawn a worker task. It starts binding immediately.
pub fn spawn_worker(
    config: WorkerConfig,
    connector: Arc<dyn SessionConnector>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    command_buffer: usize,
) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(command_buffer.max(1));
    let id = config.id;

    let limiter = config
        .max_submits_per_second
        .map(|rate| RateLimiter::direct(Quota::per_second(rate)));

    let worker = SessionWorker {
        config,
        connector,
        commands: rx,
        events,
        state: ConnectionState::Disconnected,
        session: None,
        send_queue: VecDeque::new(),
        retry_queue: Vec::new(),
        reconnect_attempts: 0,
        reconnect_at: None,
        ever_bound: false,
        closing: false,
        connect_requested: false,
        limiter,
    };

    let task = tokio::spawn(worker.run());

    WorkerHandle { id, commands: tx, task }
}

struct SessionWorker {
    config: WorkerConfig,
    connector: Arc<dyn SessionConnector>,
    commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    state: ConnectionState,
    session: Option<Box<dyn Session>>,
    send_queue: VecDeque<RetryRecord>,
    retry_queue: Vec<RetryRecord>,
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
    ever_bound: bool,
    closing: bool,
    /// A send arrived while no automatic reconnect is scheduled
    connect_requested: bool,
    limiter: Option<DirectLimiter>,
}

impl SessionWorker {
    async fn run(mut self) {
        info!(worker = self.config.id, endpoint = %self.config.endpoint, "Session worker started");

        self.establish().await;

        loop {
            // Pick up everything already posted before touching the session
            loop {
                match self.commands.try_recv() {
                    Ok(command) => self.handle_command(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.finish().await;
                        return;
                    }
                }
            }

            let has_work = self.has_work();

            match self.state {
                ConnectionState::Bound => {
                    if let Some(record) = self.next_record() {
                        self.submit(record).await;
                        continue;
                    }
                    if self.closing {
                        self.finish().await;
                        return;
                    }

                    let wake = match self.session.as_ref() {
                        Some(session) => tokio::select! {
                            command = self.commands.recv() => Wake::Command(command),
                            _ = session.closed() => Wake::SessionClosed,
                        },
                        None => Wake::SessionClosed,
                    };

                    match wake {
                        Wake::Command(Some(command)) => self.handle_command(command),
                        Wake::Command(None) => {
                            self.finish().await;
                            return;
                        }
                        Wake::SessionClosed => self.on_session_closed("session closed by peer"),
                        Wake::ReconnectDue => {}
                    }
                }
                _ => {
                    if self.closing && (!has_work || (!self.can_reconnect() && !self.connect_requested)) {
                        self.finish().await;
                        return;
                    }

                    if self.connect_requested && has_work {
                        self.connect_requested = false;
                        self.establish().await;
                        continue;
                    }

                    let wake = match self.reconnect_deadline() {
                        Some(deadline) => tokio::select! {
                            command = self.commands.recv() => Wake::Command(command),
                            _ = tokio::time::sleep_until(deadline) => Wake::ReconnectDue,
                        },
                        None => Wake::Command(self.commands.recv().await),
                    };

                    match wake {
                        Wake::Command(Some(command)) => self.handle_command(command),
                        Wake::Command(None) => {
                            self.finish().await;
                            return;
                        }
                        Wake::ReconnectDue => self.establish().await,
                        Wake::SessionClosed => {}
                    }
                }
            }
        }
    }

    fn has_work(&self) -> bool {
        !self.send_queue.is_empty() || !self.retry_queue.is_empty()
    }

    fn can_reconnect(&self) -> bool {
        self.ever_bound && self.reconnect_attempts < self.config.max_reconnect_attempts
    }

    fn reconnect_deadline(&self) -> Option<Instant> {
        if self.can_reconnect() {
            self.reconnect_at
        } else {
            None
        }
    }

    /// Retries first, newest retry first; then new work in arrival order.
    fn next_record(&mut self) -> Option<RetryRecord> {
        self.retry_queue.pop().or_else(|| self.send_queue.pop_front())
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Send(request) => {
                self.send_queue.push_back(RetryRecord::first(request));
                if self.state != ConnectionState::Bound && !self.can_reconnect() {
                    self.connect_requested = true;
                }
            }
            WorkerCommand::Pause => {
                debug!(worker = self.config.id, queued = self.send_queue.len(), "Dispatch paused");
            }
            WorkerCommand::Resume => {
                debug!(worker = self.config.id, queued = self.send_queue.len(), "Dispatch resumed");
            }
            WorkerCommand::Close => {
                debug!(
                    worker = self.config.id,
                    queued = self.send_queue.len() + self.retry_queue.len(),
                    "Close requested"
                );
                self.closing = true;
            }
        }
    }

    async fn establish(&mut self) {
        self.state = ConnectionState::Connecting;
        self.reconnect_at = None;
        debug!(worker = self.config.id, endpoint = %self.config.endpoint, attempt = self.reconnect_attempts + 1, "Binding session");

        match self
            .connector
            .connect(&self.config.endpoint, &self.config.credentials)
            .await
        {
            Ok(session) => {
                let reconnect = self.ever_bound;
                self.session = Some(session);
                self.state = ConnectionState::Bound;
                self.reconnect_attempts = 0;
                self.ever_bound = true;
                dispatch_metrics::record_session_bound(&self.config.endpoint);

                if reconnect {
                    info!(target: AUDIT_TARGET, worker = self.config.id, endpoint = %self.config.endpoint, pending = self.send_queue.len() + self.retry_queue.len(), "Session re-established");
                } else {
                    info!(worker = self.config.id, endpoint = %self.config.endpoint, "Session bound");
                }
                self.emit(WorkerEvent::Ready { worker: self.config.id });
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                self.reconnect_attempts += 1;
                dispatch_metrics::record_bind_failure(&self.config.endpoint);

                if !self.ever_bound || self.reconnect_attempts >= self.config.max_reconnect_attempts {
                    error!(
                        target: AUDIT_TARGET,
                        worker = self.config.id,
                        endpoint = %self.config.endpoint,
                        attempts = self.reconnect_attempts,
                        error = %e,
                        "Session could not be established"
                    );
                    self.emit(WorkerEvent::Error {
                        worker: self.config.id,
                        reason: format!("{}: {}", self.config.endpoint, e),
                    });
                } else {
                    warn!(
                        worker = self.config.id,
                        endpoint = %self.config.endpoint,
                        attempts = self.reconnect_attempts,
                        error = %e,
                        "Reconnect failed, will retry"
                    );
                }
                self.reconnect_at = Some(Instant::now() + self.config.reconnect_backoff);
            }
        }
    }

    async fn submit(&mut self, record: RetryRecord) {
        self.wait_for_submit_permit().await;

        let Some(session) = self.session.as_ref() else {
            self.requeue(record);
            return;
        };
        let result = session
            .submit(&record.request.destination, &record.request.job)
            .await;

        let decision = match result {
            Ok(ack) => {
                let decision = handle_ack(&ack, record.attempt);
                if decision != AckDecision::Success {
                    warn!(
                        target: AUDIT_TARGET,
                        worker = self.config.id,
                        destination = %record.request.destination,
                        attempt = record.attempt,
                        command_status = ack.command_status,
                        message_id = %ack.message_id,
                        outcome = decision.as_str(),
                        "Submission rejected"
                    );
                }
                decision
            }
            Err(e) if e.is_transport() => {
                // The PDU may have reached the peer, so this spends the attempt
                let decision = after_soft_failure(record.attempt);
                warn!(
                    target: AUDIT_TARGET,
                    worker = self.config.id,
                    destination = %record.request.destination,
                    attempt = record.attempt,
                    error = %e,
                    outcome = decision.as_str(),
                    "Submission unanswered"
                );
                dispatch_metrics::record_submission(&self.config.endpoint, decision.as_str());
                if decision == AckDecision::RetryOnce {
                    self.retry_queue.push(record.next_attempt());
                }
                if !matches!(e, SmppError::ResponseTimeout(_)) {
                    self.on_session_closed(&e.to_string());
                }
                return;
            }
            Err(e) => {
                let decision = after_soft_failure(record.attempt);
                warn!(
                    target: AUDIT_TARGET,
                    worker = self.config.id,
                    destination = %record.request.destination,
                    attempt = record.attempt,
                    error = %e,
                    outcome = decision.as_str(),
                    "Submission refused"
                );
                decision
            }
        };

        dispatch_metrics::record_submission(&self.config.endpoint, decision.as_str());

        match decision {
            AckDecision::Success => {
                self.emit(WorkerEvent::Processed {
                    worker: self.config.id,
                    index: record.request.index,
                });
            }
            AckDecision::RetryOnce => self.retry_queue.push(record.next_attempt()),
            AckDecision::Drop => {}
        }
    }

    /// Put back a record that never reached a session, at the head of its queue.
    fn requeue(&mut self, record: RetryRecord) {
        if record.attempt > 1 {
            self.retry_queue.push(record);
        } else {
            self.send_queue.push_front(record);
        }
    }

    fn on_session_closed(&mut self, reason: &str) {
        self.session = None;
        self.state = ConnectionState::Disconnected;
        self.reconnect_at = Some(Instant::now() + self.config.reconnect_backoff);
        dispatch_metrics::record_session_lost(&self.config.endpoint);

        warn!(
            target: AUDIT_TARGET,
            worker = self.config.id,
            endpoint = %self.config.endpoint,
            pending = self.send_queue.len() + self.retry_queue.len(),
            reason,
            "Session lost"
        );
        self.emit(WorkerEvent::NotReady { worker: self.config.id });
    }

    async fn wait_for_submit_permit(&self) {
        let Some(limiter) = self.limiter.as_ref() else {
            return;
        };
        while limiter.check().is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn finish(&mut self) {
        let dropped = self.send_queue.len() + self.retry_queue.len();
        if dropped > 0 {
            warn!(target: AUDIT_TARGET, worker = self.config.id, dropped, "Worker closing with undelivered messages");
        }

        if let Some(session) = self.session.take() {
            self.state = ConnectionState::Closing;
            session.unbind().await;
        }
        self.state = ConnectionState::Disconnected;
        info!(worker = self.config.id, endpoint = %self.config.endpoint, "Session worker stopped");
    }

    fn emit(&self, event: WorkerEvent) {
        // The dispatcher drops its receiver when the pool is torn down
        let _ = self.events.send(event);
    }
}
