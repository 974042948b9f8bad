//! Dispatcher - run lifecycle and the batch loop
//!
//! The dispatcher runs as a single actor task. Public calls are turned into
//! requests on a channel and answered over a oneshot, so state changes never
//! race the batch timer. Status is published on a watch channel and can be
//! read at any time without touching the actor.
//!
//! Per tick the actor slices the next batch off the destination list and
//! posts each destination to the next ready worker in rotation.

use crate::dispatch_metrics;
use crate::error::DispatchError;
use crate::select::select_ready_worker;
use crate::session::SessionConnector;
use crate::throughput::BatchPlan;
use crate::worker::{spawn_worker, WorkerConfig, WorkerHandle};
use crate::Result;
use bulk_common::logging::AUDIT_TARGET;
use bulk_common::{
    Credentials, DestinationList, DispatchJob, RunState, SendRequest, StatusSnapshot, WorkerCommand,
    WorkerEvent,
};
use bulk_config::AppConfig;
use chrono::Utc;
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REQUEST_BUFFER: usize = 32;

/// Callback fired when a run drains fully
pub type CompletionHook = Arc<dyn Fn() + Send + Sync>;

/// Everything a run needs besides the destinations and the job
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// `host:port` list; worker `i` uses `endpoints[i % len]`
    pub endpoints: Vec<String>,
    pub credentials: Credentials,
    pub worker_count: usize,
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub reconnect_backoff: Duration,
    pub max_reconnect_attempts: u32,
    /// Per-worker graceful close wait
    pub shutdown_timeout: Duration,
    /// Bound on the whole pool reaching ready
    pub startup_timeout: Duration,
    pub command_buffer: usize,
    pub max_submits_per_second: Option<NonZeroU32>,
}

impl DispatcherConfig {
    pub fn from_app_config(config: &AppConfig, plan: &BatchPlan) -> Self {
        Self {
            endpoints: config.smpp.endpoints.clone(),
            credentials: Credentials::new(config.smpp.system_id.clone(), config.smpp.password.clone()),
            worker_count: config.workers.count,
            batch_size: plan.batch_size,
            inter_batch_delay: plan.inter_batch_delay,
            reconnect_backoff: Duration::from_millis(config.workers.reconnect_backoff_ms),
            max_reconnect_attempts: config.workers.max_reconnect_attempts,
            shutdown_timeout: Duration::from_millis(config.workers.shutdown_timeout_ms),
            startup_timeout: Duration::from_millis(config.workers.startup_timeout_ms),
            command_buffer: config.workers.command_buffer,
            max_submits_per_second: NonZeroU32::new(config.workers.max_submits_per_second),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DispatchError::Config("worker count must be greater than zero".to_string()));
        }
        if self.batch_size == 0 {
            return Err(DispatchError::Config("batch size must be greater than zero".to_string()));
        }
        if self.endpoints.is_empty() {
            return Err(DispatchError::Config("at least one endpoint is required".to_string()));
        }
        if self.credentials.system_id.is_empty() {
            return Err(DispatchError::Config("system_id is required".to_string()));
        }
        Ok(())
    }
}

enum Request {
    Start(oneshot::Sender<Result<StatusSnapshot>>),
    Pause(oneshot::Sender<Result<StatusSnapshot>>),
    Resume(oneshot::Sender<Result<StatusSnapshot>>),
    Stop(oneshot::Sender<Result<StatusSnapshot>>),
}

/// Handle to a dispatcher actor.
///
/// Dropping the handle stops the run and closes every worker.
pub struct Dispatcher {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<StatusSnapshot>,
    on_complete: Arc<Mutex<Option<CompletionHook>>>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    /// Validate the run inputs and spawn the actor. Must be called inside a
    /// Tokio runtime. No worker is started until [`Dispatcher::start_processing`].
    pub fn new(
        config: DispatcherConfig,
        connector: Arc<dyn SessionConnector>,
        destinations: DestinationList,
        job: DispatchJob,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(field) = job.missing_field() {
            return Err(DispatchError::Config(format!("job is missing {}", field)));
        }
        if destinations.is_empty() {
            return Err(DispatchError::Config("destination list is empty".to_string()));
        }

        let initial = StatusSnapshot {
            total_workers: config.worker_count,
            total_destinations: destinations.len(),
            ..Default::default()
        };
        let (status_tx, status_rx) = watch::channel(initial.clone());
        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);
        let on_complete: Arc<Mutex<Option<CompletionHook>>> = Arc::new(Mutex::new(None));

        info!(
            destinations = destinations.len(),
            workers = config.worker_count,
            endpoints = config.endpoints.len(),
            batch_size = config.batch_size,
            inter_batch_delay_ms = config.inter_batch_delay.as_millis() as u64,
            "Dispatcher created"
        );

        let actor = DispatcherActor {
            config,
            connector,
            destinations,
            job: Arc::new(job),
            status_tx,
            on_complete: on_complete.clone(),
            workers: Vec::new(),
            readiness: Vec::new(),
            events_rx: None,
            ticker: None,
            rotation: 0,
            status: initial,
        };
        let task = tokio::spawn(actor.run(request_rx));

        Ok(Self {
            requests: request_tx,
            status: status_rx,
            on_complete,
            task,
        })
    }

    /// Bind the pool and begin dispatching from the first destination.
    pub async fn start_processing(&self) -> Result<StatusSnapshot> {
        self.call(Request::Start).await
    }

    /// Stop issuing batches. Workers keep draining what they already hold.
    pub async fn pause_processing(&self) -> Result<StatusSnapshot> {
        self.call(Request::Pause).await
    }

    pub async fn resume_processing(&self) -> Result<StatusSnapshot> {
        self.call(Request::Resume).await
    }

    /// Close every worker and return to idle. Completes within the
    /// per-worker shutdown timeout.
    pub async fn stop_processing(&self) -> Result<StatusSnapshot> {
        self.call(Request::Stop).await
    }

    /// Latest published status
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Register the hook invoked once per fully drained run. Replaces any
    /// previous hook. Not invoked for stopped or failed runs.
    pub fn on_complete<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_complete.lock() = Some(Arc::new(hook));
    }

    /// Stop any run and wait for the actor to exit.
    pub async fn shutdown(self) {
        if let Err(e) = self.stop_processing().await {
            debug!(error = %e, "Stop during shutdown failed");
        }
        let Dispatcher { requests, task, .. } = self;
        drop(requests);
        if let Err(e) = task.await {
            warn!(error = %e, "Dispatcher task ended abnormally");
        }
    }

    async fn call<F>(&self, make: F) -> Result<StatusSnapshot>
    where
        F: FnOnce(oneshot::Sender<Result<StatusSnapshot>>) -> Request,
    {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| DispatchError::DispatcherGone)?;
        rx.await.map_err(|_| DispatchError::DispatcherGone)?
    }
}

struct DispatcherActor {
    config: DispatcherConfig,
    connector: Arc<dyn SessionConnector>,
    destinations: DestinationList,
    job: Arc<DispatchJob>,
    status_tx: watch::Sender<StatusSnapshot>,
    on_complete: Arc<Mutex<Option<CompletionHook>>>,
    workers: Vec<WorkerHandle>,
    /// Last reported readiness per worker slot
    readiness: Vec<bool>,
    /// Events of the current pool; replaced for every pool
    events_rx: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    /// Armed iff Running
    ticker: Option<Interval>,
    rotation: usize,
    status: StatusSnapshot,
}

impl DispatcherActor {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        loop {
            tokio::select! {
                biased;

                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                event = next_event(&mut self.events_rx) => self.apply_event(event),
                _ = next_tick(&mut self.ticker) => self.process_batch().await,
            }
        }

        self.ticker = None;
        self.close_all_workers().await;
        self.status.run_state = RunState::Idle;
        self.publish();
        debug!("Dispatcher actor stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Request::Pause(reply) => {
                let result = self.pause();
                let _ = reply.send(result);
            }
            Request::Resume(reply) => {
                let result = self.resume().await;
                let _ = reply.send(result);
            }
            Request::Stop(reply) => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn start(&mut self) -> Result<StatusSnapshot> {
        match self.status.run_state {
            RunState::Running => return Err(DispatchError::AlreadyRunning),
            RunState::Paused => {
                info!("Restarting a paused run from the beginning");
                self.ticker = None;
                self.close_all_workers().await;
            }
            RunState::Idle | RunState::Stopped => {}
        }

        let run_id = Uuid::new_v4();
        self.status = StatusSnapshot {
            run_id: Some(run_id),
            started_at: Some(Utc::now()),
            total_workers: self.config.worker_count,
            total_destinations: self.destinations.len(),
            ..Default::default()
        };
        self.rotation = 0;
        self.publish();

        info!(
            target: AUDIT_TARGET,
            %run_id,
            destinations = self.destinations.len(),
            workers = self.config.worker_count,
            "Starting dispatch run"
        );

        if let Err(e) = self.initialize_workers().await {
            error!(target: AUDIT_TARGET, %run_id, error = %e, "Dispatch run could not start");
            self.status.last_error = Some(e.to_string());
            self.publish();
            dispatch_metrics::record_run_finished("failed");
            return Err(e);
        }

        self.status.run_state = RunState::Running;
        self.arm_timer(Instant::now());
        self.publish();
        Ok(self.status.clone())
    }

    /// Spawn the pool and wait until every worker reports ready.
    async fn initialize_workers(&mut self) -> Result<()> {
        self.close_all_workers().await;

        let count = self.config.worker_count;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        self.readiness = vec![false; count];

        for id in 0..count {
            let endpoint = self.config.endpoints[id % self.config.endpoints.len()].clone();
            let worker_config = WorkerConfig {
                id,
                endpoint,
                credentials: self.config.credentials.clone(),
                reconnect_backoff: self.config.reconnect_backoff,
                max_reconnect_attempts: self.config.max_reconnect_attempts,
                max_submits_per_second: self.config.max_submits_per_second,
            };
            self.workers.push(spawn_worker(
                worker_config,
                self.connector.clone(),
                events_tx.clone(),
                self.config.command_buffer,
            ));
        }
        drop(events_tx);

        let deadline = Instant::now() + self.config.startup_timeout;
        let failure = loop {
            let ready = self.ready_count();
            if ready == count {
                break None;
            }
            match tokio::time::timeout_at(deadline, events_rx.recv()).await {
                Ok(Some(WorkerEvent::Error { worker, reason })) => {
                    break Some(format!("worker {} failed to bind: {}", worker, reason));
                }
                Ok(Some(event)) => self.record_readiness(&event),
                Ok(None) => break Some("all workers exited during startup".to_string()),
                Err(_) => {
                    break Some(format!(
                        "{} of {} workers ready after {}ms",
                        ready,
                        count,
                        self.config.startup_timeout.as_millis()
                    ));
                }
            }
        };

        self.events_rx = Some(events_rx);

        if let Some(reason) = failure {
            self.close_all_workers().await;
            return Err(DispatchError::Initialization(reason));
        }

        info!(workers = count, "All workers ready");
        Ok(())
    }

    async fn process_batch(&mut self) {
        if self.status.run_state != RunState::Running {
            self.ticker = None;
            return;
        }

        self.drain_events();

        let total = self.destinations.len();
        let start = self.status.cursor;
        let batch = self
            .destinations
            .slice(start, start + self.config.batch_size)
            .to_vec();
        if batch.is_empty() {
            self.complete().await;
            return;
        }
        let end = start + batch.len();

        for (offset, destination) in batch.into_iter().enumerate() {
            if let Err(e) = self.dispatch_one(start + offset, destination).await {
                self.fail_run(e).await;
                return;
            }
            self.status.numbers_processed += 1;
        }

        self.status.batch_counter += 1;
        self.status.cursor = end;
        dispatch_metrics::record_batch_issued(end - start);
        debug!(
            batch = self.status.batch_counter,
            cursor = end,
            total,
            "Batch dispatched"
        );
        self.publish();
    }

    /// Post one destination to the next ready worker in rotation.
    async fn dispatch_one(&mut self, index: usize, destination: Arc<str>) -> Result<()> {
        let request = SendRequest {
            index,
            destination,
            job: self.job.clone(),
        };

        loop {
            let Some(slot) = select_ready_worker(&self.readiness, self.rotation) else {
                return Err(DispatchError::NoAvailableWorkers(format!(
                    "no ready worker for destination {}",
                    index
                )));
            };
            self.rotation = slot + 1;

            let Some(worker) = self.workers.get(slot) else {
                self.readiness[slot] = false;
                continue;
            };
            match worker.send(WorkerCommand::Send(request.clone())).await {
                Ok(()) => {
                    dispatch_metrics::record_destination_dispatched();
                    return Ok(());
                }
                Err(_) => {
                    warn!(worker = slot, "Worker gone, rerouting destination");
                    self.readiness[slot] = false;
                }
            }
        }
    }

    async fn complete(&mut self) {
        self.ticker = None;
        info!(
            target: AUDIT_TARGET,
            run_id = ?self.status.run_id,
            dispatched = self.status.numbers_processed,
            batches = self.status.batch_counter,
            "Dispatch run complete"
        );

        self.close_all_workers().await;
        self.status.run_state = RunState::Idle;
        self.publish();
        dispatch_metrics::record_run_finished("completed");

        // Call outside the lock so the hook may register a new one
        let hook = self.on_complete.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    async fn fail_run(&mut self, err: DispatchError) {
        self.ticker = None;
        error!(
            target: AUDIT_TARGET,
            run_id = ?self.status.run_id,
            cursor = self.status.cursor,
            error = %err,
            "Dispatch run failed"
        );

        self.status.last_error = Some(err.to_string());
        self.close_all_workers().await;
        self.status.run_state = RunState::Idle;
        self.publish();
        dispatch_metrics::record_run_finished("failed");
    }

    fn pause(&mut self) -> Result<StatusSnapshot> {
        if self.status.run_state != RunState::Running {
            return Err(DispatchError::NotRunning);
        }

        self.ticker = None;
        self.status.run_state = RunState::Paused;
        self.notify_ready_workers(WorkerCommand::Pause);
        info!(cursor = self.status.cursor, "Dispatch paused");
        self.publish();
        Ok(self.status.clone())
    }

    async fn resume(&mut self) -> Result<StatusSnapshot> {
        if self.status.run_state != RunState::Paused {
            return Err(DispatchError::NotPaused);
        }

        self.drain_events();
        if self.ready_count() == 0 {
            let err = DispatchError::NoAvailableWorkers("no worker is ready to resume".to_string());
            self.fail_run(err.clone()).await;
            return Err(err);
        }

        self.status.run_state = RunState::Running;
        self.notify_ready_workers(WorkerCommand::Resume);
        self.arm_timer(Instant::now());
        info!(cursor = self.status.cursor, "Dispatch resumed");
        self.publish();
        Ok(self.status.clone())
    }

    async fn stop(&mut self) -> Result<StatusSnapshot> {
        let previous = self.status.run_state;
        if previous == RunState::Idle && self.workers.is_empty() {
            return Ok(self.status.clone());
        }

        self.ticker = None;
        self.status.run_state = RunState::Stopped;
        self.publish();
        info!(
            target: AUDIT_TARGET,
            run_id = ?self.status.run_id,
            cursor = self.status.cursor,
            "Stopping dispatch run"
        );

        self.close_all_workers().await;
        self.status.run_state = RunState::Idle;
        self.publish();
        if matches!(previous, RunState::Running | RunState::Paused) {
            dispatch_metrics::record_run_finished("stopped");
        }
        Ok(self.status.clone())
    }

    /// Ask every worker to close, wait in parallel, terminate stragglers.
    async fn close_all_workers(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        if !workers.is_empty() {
            let count = workers.len();
            let timeout = self.config.shutdown_timeout;
            for worker in &workers {
                worker.request_close();
            }

            let joins = futures::future::join_all(workers.into_iter().map(|w| w.join(timeout)));
            tokio::pin!(joins);

            // Keep applying events so submissions finished during the drain are counted
            let results = loop {
                tokio::select! {
                    results = &mut joins => break results,
                    event = next_event(&mut self.events_rx) => self.apply_event(event),
                }
            };
            self.drain_events();

            let forced = results.iter().filter(|graceful| !**graceful).count();
            if forced > 0 {
                warn!(workers = count, forced, "Workers terminated after shutdown timeout");
            } else {
                info!(workers = count, "All workers closed");
            }
        }

        self.events_rx = None;
        self.readiness.clear();
        self.publish();
    }

    fn arm_timer(&mut self, first_tick: Instant) {
        let period = self.config.inter_batch_delay.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
    }

    fn notify_ready_workers(&self, command: WorkerCommand) {
        for (worker, ready) in self.workers.iter().zip(&self.readiness) {
            if *ready && !worker.try_send(command.clone()) {
                debug!(worker = worker.id(), "Could not deliver notification");
            }
        }
    }

    fn drain_events(&mut self) {
        let mut pending = Vec::new();
        if let Some(rx) = self.events_rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                pending.push(event);
            }
        }
        for event in pending {
            self.apply_event(event);
        }
    }

    fn apply_event(&mut self, event: WorkerEvent) {
        match &event {
            WorkerEvent::Processed { .. } => self.status.submitted += 1,
            WorkerEvent::Error { worker, reason } => {
                warn!(worker, reason = %reason, "Worker reported an error");
            }
            WorkerEvent::NotReady { worker } => {
                debug!(worker, "Worker not ready");
            }
            WorkerEvent::Ready { worker } => {
                debug!(worker, "Worker ready");
            }
        }
        self.record_readiness(&event);
        self.publish();
    }

    fn record_readiness(&mut self, event: &WorkerEvent) {
        let ready = match event {
            WorkerEvent::Ready { .. } => true,
            WorkerEvent::NotReady { .. } | WorkerEvent::Error { .. } => false,
            WorkerEvent::Processed { .. } => return,
        };
        if let Some(slot) = self.readiness.get_mut(event.worker()) {
            *slot = ready;
        }
    }

    fn ready_count(&self) -> usize {
        self.readiness.iter().filter(|ready| **ready).count()
    }

    fn publish(&mut self) {
        let ready = self.ready_count();
        if self.status.ready_workers != ready {
            dispatch_metrics::set_ready_workers(ready);
        }
        self.status.ready_workers = ready;

        let snapshot = &self.status;
        self.status_tx.send_if_modified(|current| {
            if current == snapshot {
                false
            } else {
                *current = snapshot.clone();
                true
            }
        });
    }
}

async fn next_event(rx: &mut Option<mpsc::UnboundedReceiver<WorkerEvent>>) -> WorkerEvent {
    if let Some(rx) = rx.as_mut() {
        if let Some(event) = rx.recv().await {
            return event;
        }
    }
    std::future::pending().await
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            endpoints: vec!["smsc-a:2775".to_string(), "smsc-b:2775".to_string()],
            credentials: Credentials::new("lbtest", "secret"),
            worker_count: 3,
            batch_size: 14,
            inter_batch_delay: Duration::from_millis(100),
            reconnect_backoff: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            shutdown_timeout: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(30),
            command_buffer: 1024,
            max_submits_per_second: None,
        }
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());

        let mut no_workers = config();
        no_workers.worker_count = 0;
        assert!(matches!(no_workers.validate(), Err(DispatchError::Config(_))));

        let mut no_endpoints = config();
        no_endpoints.endpoints.clear();
        assert!(matches!(no_endpoints.validate(), Err(DispatchError::Config(_))));

        let mut no_batch = config();
        no_batch.batch_size = 0;
        assert!(matches!(no_batch.validate(), Err(DispatchError::Config(_))));
    }

    #[test]
    fn test_from_app_config() {
        let mut app = AppConfig::default();
        app.smpp.system_id = "lbtest".to_string();
        app.workers.max_submits_per_second = 50;
        let plan = crate::throughput::plan(140, 1, 14).unwrap();

        let config = DispatcherConfig::from_app_config(&app, &plan);
        assert_eq!(config.worker_count, 14);
        assert_eq!(config.batch_size, 14);
        assert_eq!(config.inter_batch_delay, Duration::from_millis(100));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.max_submits_per_second, NonZeroU32::new(50));
        assert_eq!(config.credentials.system_id, "lbtest");
    }
}
