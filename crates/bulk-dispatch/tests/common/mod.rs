//! Scripted SMSC for exercising workers and the dispatcher without a network
#![allow(dead_code)]

use async_trait::async_trait;
use bulk_common::{Credentials, DestinationList, DispatchJob};
use bulk_dispatch::{Session, SessionConnector};
use bulk_smpp::{SmppError, SubmitAck};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Default)]
struct State {
    submissions: Mutex<Vec<(String, String)>>,
    scripted_acks: Mutex<HashMap<String, VecDeque<SubmitAck>>>,
    failing_endpoints: Mutex<HashSet<String>>,
    sessions: Mutex<Vec<(String, Arc<watch::Sender<bool>>)>>,
    unanswered: Mutex<HashMap<String, usize>>,
    closing_on_submit: Mutex<HashSet<String>>,
    connects: Mutex<Vec<String>>,
    submit_delay: Mutex<Duration>,
    fail_all_binds: AtomicBool,
    hang_connect: AtomicBool,
    hang_unbind: AtomicBool,
    unbinds: AtomicU32,
    message_ids: AtomicU32,
}

/// Shared handle; clones observe the same SMSC.
#[derive(Clone, Default)]
pub struct MockSmsc {
    state: Arc<State>,
}

impl MockSmsc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn SessionConnector> {
        Arc::new(self.clone())
    }

    /// (endpoint, destination) per accepted-or-rejected submission, in order
    pub fn submissions(&self) -> Vec<(String, String)> {
        self.state.submissions.lock().clone()
    }

    pub fn submitted_destinations(&self) -> Vec<String> {
        self.submissions().into_iter().map(|(_, d)| d).collect()
    }

    pub fn submission_count(&self, destination: &str) -> usize {
        self.submissions()
            .iter()
            .filter(|(_, d)| d == destination)
            .count()
    }

    pub fn connects(&self) -> Vec<String> {
        self.state.connects.lock().clone()
    }

    pub fn unbinds(&self) -> u32 {
        self.state.unbinds.load(Ordering::SeqCst)
    }

    /// Queue acknowledgments returned for `destination`, oldest first.
    pub fn script_acks(&self, destination: &str, acks: Vec<SubmitAck>) {
        self.state
            .scripted_acks
            .lock()
            .entry(destination.to_string())
            .or_default()
            .extend(acks);
    }

    /// Accept the next `count` submissions to `destination` but never answer them.
    pub fn leave_unanswered(&self, destination: &str, count: usize) {
        *self
            .state
            .unanswered
            .lock()
            .entry(destination.to_string())
            .or_default() += count;
    }

    /// Tear down the session carrying every submission to `destination`
    /// after the PDU went out.
    pub fn close_on_submit(&self, destination: &str) {
        self.state
            .closing_on_submit
            .lock()
            .insert(destination.to_string());
    }

    pub fn fail_binds(&self, fail: bool) {
        self.state.fail_all_binds.store(fail, Ordering::SeqCst);
    }

    pub fn fail_endpoint(&self, endpoint: &str) {
        self.state
            .failing_endpoints
            .lock()
            .insert(endpoint.to_string());
    }

    pub fn hang_connect(&self, hang: bool) {
        self.state.hang_connect.store(hang, Ordering::SeqCst);
    }

    pub fn hang_unbind(&self, hang: bool) {
        self.state.hang_unbind.store(hang, Ordering::SeqCst);
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        *self.state.submit_delay.lock() = delay;
    }

    /// Close every live session, or only those bound to `endpoint`.
    pub fn drop_sessions(&self, endpoint: Option<&str>) {
        let mut sessions = self.state.sessions.lock();
        sessions.retain(|(bound_to, closed)| {
            let matches = endpoint.map_or(true, |e| e == bound_to.as_str());
            if matches {
                let _ = closed.send(true);
            }
            !matches
        });
    }
}

#[async_trait]
impl SessionConnector for MockSmsc {
    async fn connect(&self, endpoint: &str, _credentials: &Credentials) -> Result<Box<dyn Session>, SmppError> {
        self.state.connects.lock().push(endpoint.to_string());

        if self.state.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let rejected = self.state.fail_all_binds.load(Ordering::SeqCst)
            || self.state.failing_endpoints.lock().contains(endpoint);
        if rejected {
            return Err(SmppError::BindRejected(0x0D));
        }

        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        self.state
            .sessions
            .lock()
            .push((endpoint.to_string(), closed_tx.clone()));

        Ok(Box::new(MockSession {
            smsc: self.clone(),
            endpoint: endpoint.to_string(),
            closed: closed_rx,
            closer: closed_tx,
        }))
    }
}

struct MockSession {
    smsc: MockSmsc,
    endpoint: String,
    closed: watch::Receiver<bool>,
    closer: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl Session for MockSession {
    async fn submit(&self, destination: &str, _job: &DispatchJob) -> Result<SubmitAck, SmppError> {
        if *self.closed.borrow() {
            return Err(SmppError::SessionClosed);
        }

        let delay = *self.smsc.state.submit_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
            if *self.closed.borrow() {
                return Err(SmppError::SessionClosed);
            }
        }

        self.smsc
            .state
            .submissions
            .lock()
            .push((self.endpoint.clone(), destination.to_string()));

        if self.smsc.state.closing_on_submit.lock().contains(destination) {
            let _ = self.closer.send(true);
            return Err(SmppError::SessionClosed);
        }

        let unanswered = self
            .smsc
            .state
            .unanswered
            .lock()
            .get_mut(destination)
            .filter(|remaining| **remaining > 0)
            .map(|remaining| *remaining -= 1)
            .is_some();
        if unanswered {
            return Err(SmppError::ResponseTimeout(Duration::from_millis(10)));
        }

        let scripted = self
            .smsc
            .state
            .scripted_acks
            .lock()
            .get_mut(destination)
            .and_then(|acks| acks.pop_front());

        Ok(scripted.unwrap_or_else(|| {
            let id = self.smsc.state.message_ids.fetch_add(1, Ordering::SeqCst);
            SubmitAck::new(0, format!("{:08x}", id + 1))
        }))
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn unbind(&self) {
        self.smsc.state.unbinds.fetch_add(1, Ordering::SeqCst);
        if self.smsc.state.hang_unbind.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

pub fn destination(index: usize) -> String {
    format!("96170{:06}", index)
}

pub fn index_of(destination: &str) -> usize {
    destination[5..].parse().unwrap()
}

pub fn destinations(count: usize) -> DestinationList {
    DestinationList::from_vec((0..count).map(destination).collect()).unwrap()
}

pub fn job() -> DispatchJob {
    DispatchJob::new("BANK", "Your code is 4821")
}

pub fn sentinel() -> SubmitAck {
    SubmitAck::new(0, "0000000000")
}
