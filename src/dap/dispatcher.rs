//! Request/response correlation and event dispatch
//!
//! The dispatcher owns both transport halves of a session. A single reader
//! task reads one frame at a time and routes it:
//!
//! - responses fulfil the pending request with the matching `seq`
//! - events go to every subscriber queue, then to each registered
//!   [`EventHandler`], which runs to completion (including any requests it
//!   sends) before the next frame is read
//! - requests from the adapter get an error response
//!
//! All writes go through one writer lock, and sequence numbers are allocated
//! under that lock, so frames reach the adapter in `seq` order.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, trace, warn};

use crate::dap::error::{DispatchError, ProtocolViolation, TransportError};
use crate::dap::transport::{TransportReader, TransportWriter};
use crate::dap::types::{Event, Message, Request, Response};

/// Reason reported to waiters when the session is stopped locally
const STOPPED_REASON: &str = "session stopped";

/// Reason reported to waiters when the adapter closes its output stream
const END_OF_STREAM_REASON: &str = "end of stream";

/// Answered responses kept for requests nobody has awaited yet; the oldest
/// is discarded first
pub const MAX_UNCLAIMED_RESPONSES: usize = 64;

type BoxedWriter = TransportWriter<Box<dyn AsyncWrite + Send + Unpin>>;
type ResponseSender = oneshot::Sender<Result<Response, DispatchError>>;
type ResponseReceiver = oneshot::Receiver<Result<Response, DispatchError>>;

/// Identifier returned when registering an event handler
pub type HandlerId = u64;

// ============================================================================
// Event Handlers and Subscriptions
// ============================================================================

/// Callback invoked from inside the reader loop for every event.
///
/// The reader does not read the next frame until `on_event` returns, so a
/// request sent from here reaches the adapter before anything that follows
/// the event is processed.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: &Event, dispatcher: &Dispatcher);
}

/// Ordered stream of events for one subscriber.
///
/// Ends once the session disconnects.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Wait for the next event; `None` once the session has ended
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

// ============================================================================
// Wire Log
// ============================================================================

/// Direction of a frame relative to this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One frame as observed on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct WireRecord {
    pub timestamp: DateTime<Utc>,
    /// Time since the dispatcher was created
    pub offset: Duration,
    pub direction: Direction,
    pub kind: &'static str,
    pub name: String,
    pub seq: i64,
    pub request_seq: Option<i64>,
    pub success: Option<bool>,
}

impl WireRecord {
    fn new(direction: Direction, message: &Message, started_at: Instant) -> Self {
        let (request_seq, success) = match message {
            Message::Response(response) => (Some(response.request_seq), Some(response.success)),
            _ => (None, None),
        };

        Self {
            timestamp: Utc::now(),
            offset: started_at.elapsed(),
            direction,
            kind: message.kind(),
            name: message.name().to_string(),
            seq: message.seq(),
            request_seq,
            success,
        }
    }

    /// Whether this record is `kind` named `name` flowing in `direction`
    pub fn is(&self, direction: Direction, kind: &str, name: &str) -> bool {
        self.direction == direction && self.kind == kind && self.name == name
    }
}

impl fmt::Display for WireRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Sent => ">>>",
            Direction::Received => "<<<",
        };
        write!(
            f,
            "+{:>8.3}s {} {:<8} {} (seq {})",
            self.offset.as_secs_f64(),
            arrow,
            self.kind,
            self.name,
            self.seq
        )?;
        if let Some(request_seq) = self.request_seq {
            write!(f, " request_seq={request_seq}")?;
        }
        if let Some(success) = self.success {
            write!(f, " success={success}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// Outstanding request awaiting its response
struct PendingRequest {
    command: String,
    sender: ResponseSender,
}

/// Receiving side of a pending request, claimed by `await_response`
struct Waiter {
    command: String,
    receiver: ResponseReceiver,
}

struct DispatchState {
    next_seq: i64,
    pending: HashMap<i64, PendingRequest>,
    waiters: HashMap<i64, Waiter>,
    /// Seqs whose response arrived before `await_response`, oldest first
    unclaimed: VecDeque<i64>,
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
    handlers: Vec<(HandlerId, Arc<dyn EventHandler>)>,
    next_handler_id: HandlerId,
    disconnected: Option<String>,
    wire_log: Vec<WireRecord>,
    violations: Vec<ProtocolViolation>,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            next_seq: 1,
            pending: HashMap::new(),
            waiters: HashMap::new(),
            unclaimed: VecDeque::new(),
            subscribers: Vec::new(),
            handlers: Vec::new(),
            next_handler_id: 1,
            disconnected: None,
            wire_log: Vec::new(),
            violations: Vec::new(),
        }
    }

    fn allocate_seq(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Remember that `seq` was answered but not yet awaited
    fn retain_unclaimed(&mut self, seq: i64) {
        if !self.waiters.contains_key(&seq) {
            return;
        }
        self.unclaimed.push_back(seq);
        while self.unclaimed.len() > MAX_UNCLAIMED_RESPONSES {
            if let Some(oldest) = self.unclaimed.pop_front() {
                if let Some(waiter) = self.waiters.remove(&oldest) {
                    debug!(
                        "Discarding unclaimed '{}' response (seq {})",
                        waiter.command, oldest
                    );
                }
            }
        }
    }

    fn check_connected(&self) -> Result<(), DispatchError> {
        match &self.disconnected {
            Some(reason) => Err(DispatchError::disconnected(reason.clone())),
            None => Ok(()),
        }
    }
}

struct Shared {
    writer: tokio::sync::Mutex<BoxedWriter>,
    state: Mutex<DispatchState>,
    started_at: Instant,
    shutdown: CancellationToken,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Session message dispatcher; cheap to clone, all clones share one session
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Dispatcher")
            .field("next_seq", &state.next_seq)
            .field("pending", &state.pending.len())
            .field("subscribers", &state.subscribers.len())
            .field("disconnected", &state.disconnected)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher over the adapter's output (`reader`) and input
    /// (`writer`) streams and start its reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(TransportWriter::new(writer)),
            state: Mutex::new(DispatchState::new()),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            reader_task: Mutex::new(None),
        });

        let dispatcher = Self { shared };
        let task = tokio::spawn(
            dispatcher
                .clone()
                .run_reader(TransportReader::new(reader)),
        );
        *dispatcher.shared.reader_task.lock().unwrap() = Some(task);

        dispatcher
    }

    fn state(&self) -> MutexGuard<'_, DispatchState> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.shared.state.lock().unwrap()
    }

    /// Send a request without waiting for its response.
    ///
    /// The pending entry is registered before the frame is written, so a
    /// response can never overtake its own registration.
    pub async fn send_request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<i64, DispatchError> {
        let mut writer = self.shared.writer.lock().await;

        let (seq, message) = {
            let mut state = self.state();
            state.check_connected()?;

            let seq = state.allocate_seq();
            let (sender, receiver) = oneshot::channel();
            state.pending.insert(
                seq,
                PendingRequest {
                    command: command.to_string(),
                    sender,
                },
            );
            state.waiters.insert(
                seq,
                Waiter {
                    command: command.to_string(),
                    receiver,
                },
            );

            let message = Message::Request(Request {
                seq,
                command: command.to_string(),
                arguments,
            });
            let record = WireRecord::new(Direction::Sent, &message, self.shared.started_at);
            state.wire_log.push(record);
            (seq, message)
        };

        crate::log_dap_message!(Level::DEBUG, "sent", "request", command, seq);

        if let Err(e) = writer.write_message(&message).await {
            let mut state = self.state();
            state.pending.remove(&seq);
            state.waiters.remove(&seq);
            return Err(DispatchError::Write {
                command: command.to_string(),
                source: e,
            });
        }

        Ok(seq)
    }

    /// Wait for the response to `seq`.
    ///
    /// Each issued request can be awaited once. On timeout the pending entry
    /// is removed, so a response arriving later is reported as a protocol
    /// violation instead of being delivered. Only the last
    /// [`MAX_UNCLAIMED_RESPONSES`] answered requests stay awaitable.
    pub async fn await_response(
        &self,
        seq: i64,
        timeout: Duration,
    ) -> Result<Response, DispatchError> {
        let Waiter {
            command,
            mut receiver,
        } = {
            let mut state = self.state();
            match state.waiters.remove(&seq) {
                Some(waiter) => {
                    state.unclaimed.retain(|unclaimed| *unclaimed != seq);
                    waiter
                }
                None => {
                    return Err(match &state.disconnected {
                        Some(reason) if seq < state.next_seq => {
                            DispatchError::disconnected(reason.clone())
                        }
                        _ => DispatchError::UnknownRequest(seq),
                    });
                }
            }
        };

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::disconnected(
                self.disconnect_reason()
                    .unwrap_or_else(|| STOPPED_REASON.to_string()),
            )),
            Err(_) => {
                self.state().pending.remove(&seq);

                // The response may have landed between the deadline and the removal
                if let Ok(result) = receiver.try_recv() {
                    return result;
                }

                warn!(seq, command = %command, ?timeout, "DAP request timed out");
                Err(DispatchError::Timeout {
                    seq,
                    command,
                    timeout,
                })
            }
        }
    }

    /// Send a request and wait for its response
    pub async fn request(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Response, DispatchError> {
        let seq = self.send_request(command, arguments).await?;
        self.await_response(seq, timeout).await
    }

    /// Subscribe to all events received from now on.
    ///
    /// Subscribers are unbounded queues: a slow consumer buffers events and
    /// never stalls the reader. Subscribing after disconnect yields an
    /// already-closed stream.
    pub fn subscribe_events(&self) -> EventStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state();
        if state.disconnected.is_none() {
            state.subscribers.retain(|existing| !existing.is_closed());
            state.subscribers.push(sender);
        }
        EventStream { receiver }
    }

    /// Register a handler run synchronously inside the reader loop
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let mut state = self.state();
        let id = state.next_handler_id;
        state.next_handler_id += 1;
        state.handlers.push((id, handler));
        id
    }

    pub fn remove_event_handler(&self, id: HandlerId) {
        self.state().handlers.retain(|(existing, _)| *existing != id);
    }

    /// Record a protocol violation observed by a higher layer
    pub fn report_violation(&self, violation: ProtocolViolation) {
        warn!("DAP protocol violation: {}", violation);
        self.state().violations.push(violation);
    }

    pub fn protocol_violations(&self) -> Vec<ProtocolViolation> {
        self.state().violations.clone()
    }

    /// Every frame written and read so far, in observation order
    pub fn wire_log(&self) -> Vec<WireRecord> {
        self.state().wire_log.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Requests issued but not yet claimed by `await_response`
    pub fn unclaimed_count(&self) -> usize {
        self.state().waiters.len()
    }

    pub fn is_connected(&self) -> bool {
        self.state().disconnected.is_none()
    }

    pub fn disconnect_reason(&self) -> Option<String> {
        self.state().disconnected.clone()
    }

    /// Stop the reader loop, fail all waiters and close the adapter's input.
    ///
    /// Must not be called from inside an [`EventHandler`].
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let task = self.shared.reader_task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("DAP reader task ended abnormally: {}", e);
            }
        }

        // Covers the case where the task was already gone
        self.disconnect(STOPPED_REASON);

        if let Err(e) = self.shared.writer.lock().await.close().await {
            trace!("Dispatcher: Ignoring error while closing adapter input: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Reader loop
    // ------------------------------------------------------------------------

    async fn run_reader<R>(self, mut reader: TransportReader<R>)
    where
        R: AsyncRead + Send + Unpin,
    {
        debug!("DAP reader task started");

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => break STOPPED_REASON.to_string(),
                result = reader.read_message() => result,
            };

            match next {
                Ok(message) => self.handle_inbound(message).await,
                Err(TransportError::Decode(e)) => {
                    self.report_violation(ProtocolViolation::MalformedMessage {
                        reason: e.to_string(),
                    });
                }
                Err(TransportError::EndOfStream) => break END_OF_STREAM_REASON.to_string(),
                Err(e) => break e.to_string(),
            }
        };

        debug!("DAP reader task finished: {}", reason);
        self.disconnect(&reason);
    }

    async fn handle_inbound(&self, message: Message) {
        crate::log_dap_message!(
            Level::DEBUG,
            "received",
            message.kind(),
            message.name(),
            message.seq()
        );

        let record = WireRecord::new(Direction::Received, &message, self.shared.started_at);
        self.state().wire_log.push(record);

        match message {
            Message::Response(response) => self.fulfil(response),
            Message::Event(event) => self.publish(event).await,
            Message::Request(request) => self.reject_reverse_request(request).await,
        }
    }

    fn fulfil(&self, response: Response) {
        let mut state = self.state();
        let pending = state.pending.remove(&response.request_seq);

        match pending {
            Some(pending) => {
                state.retain_unclaimed(response.request_seq);
                drop(state);
                if pending.command != response.command {
                    debug!(
                        "Response command '{}' differs from request command '{}' (seq {})",
                        response.command, pending.command, response.request_seq
                    );
                }
                // Receiver may already be gone if the waiter was abandoned
                let _ = pending.sender.send(Ok(response));
            }
            None => {
                drop(state);
                self.report_violation(ProtocolViolation::UnknownResponse {
                    request_seq: response.request_seq,
                    command: response.command,
                });
            }
        }
    }

    async fn publish(&self, event: Event) {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let mut state = self.state();
            state
                .subscribers
                .retain(|subscriber| subscriber.send(event.clone()).is_ok());
            state
                .handlers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        for handler in handlers {
            handler.on_event(&event, self).await;
        }
    }

    async fn reject_reverse_request(&self, request: Request) {
        self.report_violation(ProtocolViolation::ReverseRequest {
            seq: request.seq,
            command: request.command.clone(),
        });

        let mut writer = self.shared.writer.lock().await;
        let message = {
            let mut state = self.state();
            let seq = state.allocate_seq();
            let message = Message::Response(Response::unsupported(&request, seq));
            let record = WireRecord::new(Direction::Sent, &message, self.shared.started_at);
            state.wire_log.push(record);
            message
        };

        if let Err(e) = writer.write_message(&message).await {
            warn!(
                "Failed to reject reverse request '{}': {}",
                request.command, e
            );
        }
    }

    /// Mark the session disconnected and release everyone waiting on it
    fn disconnect(&self, reason: &str) {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.disconnected.is_some() {
            return;
        }

        debug!(
            "DAP session disconnected ({}), failing {} pending request(s)",
            reason,
            state.pending.len()
        );

        state.disconnected = Some(reason.to_string());
        for (_, pending) in state.pending.drain() {
            let _ = pending.sender.send(Err(DispatchError::disconnected(reason)));
        }
        // Answered responses stay claimable; awaiting the rest reports the reason
        let unclaimed = &state.unclaimed;
        state.waiters.retain(|seq, _| unclaimed.contains(seq));
        state.subscribers.clear();
        state.handlers.clear();
    }
}
