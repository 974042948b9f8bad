//! Async SMPP transceiver session.
//!
//! One [`SmppClient`] owns one TCP connection. A reader task routes
//! responses to waiting requests by sequence number and answers the
//! requests a peer may send on its own (enquire_link, unbind, deliver_sm).
//! A writer task serializes outbound PDUs and emits enquire_link on a
//! fixed period.

use crate::codec::PduCodec;
use crate::error::{Result, SmppError};
use crate::pdu::{
    check_c_octet, command_id, command_status, encode_text, tag, BindTransceiver, Pdu, PduBody,
    SubmitSm, Tlv, DATA_CODING_UCS2, MAX_ADDRESS, MAX_PASSWORD, MAX_SYSTEM_ID,
};
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

const OUTBOUND_BUFFER: usize = 256;
const MAX_SEQUENCE: u32 = 0x7FFF_FFFF;

/// Bind and submission parameters for one session
#[derive(Clone)]
pub struct SessionOptions {
    pub system_id: String,
    pub password: String,
    pub system_type: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Zero disables the keep-alive
    pub enquire_link_interval: Duration,
    pub source_addr_ton: u8,
    pub source_addr_npi: u8,
    pub dest_addr_ton: u8,
    pub dest_addr_npi: u8,
    pub data_coding: u8,
}

impl SessionOptions {
    pub fn new(system_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            system_id: system_id.into(),
            password: password.into(),
            system_type: String::new(),
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            enquire_link_interval: Duration::from_secs(10),
            source_addr_ton: 5,
            source_addr_npi: 0,
            dest_addr_ton: 5,
            dest_addr_npi: 0,
            data_coding: DATA_CODING_UCS2,
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("system_id", &self.system_id)
            .field("password", &"***")
            .field("connect_timeout", &self.connect_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("enquire_link_interval", &self.enquire_link_interval)
            .field("data_coding", &self.data_coding)
            .finish_non_exhaustive()
    }
}

/// The peer's answer to one submit_sm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAck {
    pub command_status: u32,
    pub message_id: String,
}

impl SubmitAck {
    pub fn new(command_status: u32, message_id: impl Into<String>) -> Self {
        Self {
            command_status,
            message_id: message_id.into(),
        }
    }
}

struct Shared {
    pending: DashMap<u32, oneshot::Sender<Pdu>>,
    sequence: AtomicU32,
    closed: watch::Sender<bool>,
}

impl Shared {
    /// Sequence numbers run 1..=0x7FFFFFFF and wrap.
    fn next_sequence(&self) -> u32 {
        let step = |s: u32| if s >= MAX_SEQUENCE { 1 } else { s + 1 };
        let prev = self
            .sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(step(s)))
            .unwrap_or_else(|s| s);
        step(prev)
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
        // Dropping the senders fails every waiting request.
        self.pending.clear();
    }
}

/// A bound SMPP transceiver session.
pub struct SmppClient {
    endpoint: String,
    options: SessionOptions,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Pdu>,
    closed_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SmppClient {
    /// Connect to `endpoint` (`host:port`) and bind as a transceiver.
    ///
    /// A rejected bind closes the transport before returning
    /// [`SmppError::BindRejected`].
    pub async fn connect(endpoint: &str, options: SessionOptions) -> Result<Self> {
        check_c_octet("system_id", &options.system_id, MAX_SYSTEM_ID)?;
        check_c_octet("password", &options.password, MAX_PASSWORD)?;

        let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(SmppError::ConnectTimeout {
                    endpoint: endpoint.to_string(),
                    timeout: options.connect_timeout,
                })
            }
        };
        stream.set_nodelay(true)?;
        debug!(endpoint = %endpoint, "Transport connected, binding");

        let client = Self::start(endpoint, stream, options);

        let mut bind = BindTransceiver::new(&client.options.system_id, &client.options.password);
        bind.system_type = client.options.system_type.clone();

        let resp = match client.request(PduBody::BindTransceiver(bind)).await {
            Ok(resp) => resp,
            Err(e) => {
                client.shutdown();
                return Err(e);
            }
        };

        match resp.body {
            PduBody::BindTransceiverResp { system_id } if resp.command_status == command_status::ESME_ROK => {
                info!(endpoint = %endpoint, smsc = %system_id, "Session bound");
                Ok(client)
            }
            PduBody::BindTransceiverResp { .. } => {
                warn!(endpoint = %endpoint, status = resp.command_status, "Bind rejected");
                client.shutdown();
                Err(SmppError::BindRejected(resp.command_status))
            }
            PduBody::GenericNack => {
                client.shutdown();
                Err(SmppError::GenericNack(resp.command_status))
            }
            other => {
                client.shutdown();
                Err(SmppError::UnexpectedResponse(other.name().to_string()))
            }
        }
    }

    fn start(endpoint: &str, stream: TcpStream, options: SessionOptions) -> Self {
        let (sink, frames) = Framed::new(stream, PduCodec::new()).split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            sequence: AtomicU32::new(0),
            closed: closed_tx,
        });

        let reader = tokio::spawn(read_loop(
            endpoint.to_string(),
            frames,
            shared.clone(),
            outbound_tx.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            endpoint.to_string(),
            sink,
            outbound_rx,
            shared.clone(),
            options.enquire_link_interval,
        ));

        Self {
            endpoint: endpoint.to_string(),
            options,
            shared,
            outbound: outbound_tx,
            closed_rx,
            tasks: vec![reader, writer],
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolves once the transport is gone (EOF, I/O error, peer unbind or local close).
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        wait_closed(&mut rx).await;
    }

    /// Submit one message and wait for its submit_sm_resp.
    ///
    /// The text travels in the message_payload TLV. A non-zero status in the
    /// response is returned in the ack, not as an error.
    pub async fn submit_sm(&self, source_addr: &str, destination_addr: &str, text: &str) -> Result<SubmitAck> {
        check_c_octet("source_addr", source_addr, MAX_ADDRESS)?;
        check_c_octet("destination_addr", destination_addr, MAX_ADDRESS)?;

        let payload = encode_text(text, self.options.data_coding);
        if payload.len() > u16::MAX as usize {
            return Err(SmppError::InvalidField {
                field: "message_payload",
                reason: format!("{} bytes exceeds maximum of {}", payload.len(), u16::MAX),
            });
        }

        let sm = SubmitSm {
            source_addr_ton: self.options.source_addr_ton,
            source_addr_npi: self.options.source_addr_npi,
            source_addr: source_addr.to_string(),
            dest_addr_ton: self.options.dest_addr_ton,
            dest_addr_npi: self.options.dest_addr_npi,
            destination_addr: destination_addr.to_string(),
            data_coding: self.options.data_coding,
            tlvs: vec![Tlv::new(tag::MESSAGE_PAYLOAD, payload)],
            ..Default::default()
        };

        let resp = self.request(PduBody::SubmitSm(Box::new(sm))).await?;
        match resp.body {
            PduBody::SubmitSmResp { message_id } => Ok(SubmitAck {
                command_status: resp.command_status,
                message_id,
            }),
            PduBody::GenericNack => Err(SmppError::GenericNack(resp.command_status)),
            other => Err(SmppError::UnexpectedResponse(other.name().to_string())),
        }
    }

    /// Unbind gracefully, then drop the transport.
    ///
    /// The wait for unbind_resp is bounded by the response timeout; the
    /// transport is closed whatever the outcome.
    pub async fn unbind(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let outcome = match self.request(PduBody::Unbind).await {
            Ok(Pdu {
                body: PduBody::UnbindResp,
                ..
            }) => Ok(()),
            Ok(other) => Err(SmppError::UnexpectedResponse(other.body.name().to_string())),
            // Peer hung up first.
            Err(SmppError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        };

        self.shutdown();
        debug!(endpoint = %self.endpoint, "Session unbound");
        outcome
    }

    fn shutdown(&self) {
        self.shared.mark_closed();
    }

    async fn request(&self, body: PduBody) -> Result<Pdu> {
        if self.is_closed() {
            return Err(SmppError::SessionClosed);
        }

        let seq = self.shared.next_sequence();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(seq, tx);

        let name = body.name();
        if self.outbound.send(Pdu::new(seq, body)).await.is_err() {
            self.shared.pending.remove(&seq);
            return Err(SmppError::SessionClosed);
        }
        trace!(endpoint = %self.endpoint, seq, command = name, "Request sent");

        let timeout = self.options.response_timeout;
        let mut closed = self.closed_rx.clone();
        let outcome = tokio::time::timeout(timeout, async {
            tokio::select! {
                biased;
                resp = rx => resp.map_err(|_| SmppError::SessionClosed),
                _ = wait_closed(&mut closed) => Err(SmppError::SessionClosed),
            }
        })
        .await;

        self.shared.pending.remove(&seq);
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(endpoint = %self.endpoint, seq, command = name, "Response timed out");
                Err(SmppError::ResponseTimeout(timeout))
            }
        }
    }
}

impl Drop for SmppClient {
    fn drop(&mut self) {
        self.shared.mark_closed();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn read_loop<St>(endpoint: String, mut frames: St, shared: Arc<Shared>, outbound: mpsc::Sender<Pdu>)
where
    St: Stream<Item = Result<Pdu>> + Unpin,
{
    let mut closed = shared.closed.subscribe();

    loop {
        let next = tokio::select! {
            next = frames.next() => next,
            _ = wait_closed(&mut closed) => break,
        };

        let pdu = match next {
            Some(Ok(pdu)) => pdu,
            Some(Err(e)) => {
                warn!(endpoint = %endpoint, error = %e, "Read failed, closing session");
                break;
            }
            None => {
                debug!(endpoint = %endpoint, "Peer closed the connection");
                break;
            }
        };

        if pdu.is_response() {
            match shared.pending.remove(&pdu.sequence_number) {
                Some((_, waiter)) => {
                    let _ = waiter.send(pdu);
                }
                None => trace!(endpoint = %endpoint, seq = pdu.sequence_number, command = pdu.body.name(), "Unsolicited response"),
            }
            continue;
        }

        let seq = pdu.sequence_number;
        let reply = match pdu.body {
            PduBody::EnquireLink => Pdu::new(seq, PduBody::EnquireLinkResp),
            PduBody::Unbind => {
                info!(endpoint = %endpoint, "Peer requested unbind");
                let _ = outbound.send(Pdu::new(seq, PduBody::UnbindResp)).await;
                break;
            }
            PduBody::Raw {
                command_id: command_id::DELIVER_SM,
                ..
            } => Pdu::new(seq, PduBody::DeliverSmResp {
                message_id: String::new(),
            }),
            other => {
                debug!(endpoint = %endpoint, command_id = other.command_id(), "Unsupported request, answering generic_nack");
                Pdu::new(seq, PduBody::GenericNack).with_status(command_status::ESME_RINVCMDID)
            }
        };

        if outbound.send(reply).await.is_err() {
            break;
        }
    }

    shared.mark_closed();
}

async fn write_loop<Si>(
    endpoint: String,
    mut sink: Si,
    mut outbound: mpsc::Receiver<Pdu>,
    shared: Arc<Shared>,
    enquire_link_interval: Duration,
) where
    Si: Sink<Pdu, Error = SmppError> + Unpin,
{
    let mut closed = shared.closed.subscribe();
    let mut keepalive = (!enquire_link_interval.is_zero()).then(|| {
        let mut interval = tokio::time::interval_at(Instant::now() + enquire_link_interval, enquire_link_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;
            maybe = outbound.recv() => match maybe {
                Some(pdu) => {
                    if let Err(e) = sink.send(pdu).await {
                        warn!(endpoint = %endpoint, error = %e, "Write failed, closing session");
                        break;
                    }
                }
                None => break,
            },
            _ = wait_closed(&mut closed) => {
                // Flush replies queued just before close (unbind_resp).
                while let Ok(pdu) = outbound.try_recv() {
                    if sink.send(pdu).await.is_err() {
                        break;
                    }
                }
                break;
            }
            _ = next_keepalive(&mut keepalive) => {
                let pdu = Pdu::new(shared.next_sequence(), PduBody::EnquireLink);
                trace!(endpoint = %endpoint, seq = pdu.sequence_number, "enquire_link");
                if let Err(e) = sink.send(pdu).await {
                    warn!(endpoint = %endpoint, error = %e, "Keep-alive failed, closing session");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    shared.mark_closed();
}

/// Resolves once `closed` flips to true. The borrow guard is dropped here so
/// callers stay `Send` across later awaits.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn next_keepalive(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
