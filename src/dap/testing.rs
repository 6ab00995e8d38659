//! In-memory adapter doubles for tests
//!
//! [`connected_pair`] wires a [`Dispatcher`] to a [`PeerAdapter`] over a
//! duplex pipe. [`ScriptedAdapter`] drives the peer through a typical
//! startup exchange and records what it saw, in order.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use crate::dap::dispatcher::Dispatcher;
use crate::dap::transport::{TransportReader, encode_frame};
use crate::dap::types::{Event, Message, Request, Response, commands, events};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Create a dispatcher and the adapter end of its streams
pub fn connected_pair() -> (Dispatcher, PeerAdapter) {
    let (client, adapter) = tokio::io::duplex(PIPE_CAPACITY);
    let (client_read, client_write) = tokio::io::split(client);
    let dispatcher = Dispatcher::new(client_read, client_write);
    (dispatcher, PeerAdapter::new(adapter))
}

/// The adapter's side of an in-memory session
pub struct PeerAdapter {
    reader: TransportReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    next_seq: i64,
}

impl PeerAdapter {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: TransportReader::new(reader),
            writer,
            next_seq: 1,
        }
    }

    fn allocate_seq(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Next message from the client; `None` once the client closed its end
    pub async fn try_recv(&mut self) -> Option<Message> {
        self.reader.read_message().await.ok()
    }

    pub async fn recv(&mut self) -> Message {
        self.try_recv()
            .await
            .expect("client closed the stream unexpectedly")
    }

    pub async fn recv_request(&mut self) -> Request {
        match self.recv().await {
            Message::Request(request) => request,
            other => panic!("Expected request, got: {other:?}"),
        }
    }

    pub async fn send(&mut self, message: &Message) {
        let frame = encode_frame(message).unwrap();
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn respond(&mut self, request: &Request, success: bool, body: Option<Value>) {
        let seq = self.allocate_seq();
        self.send_response(Response {
            seq,
            request_seq: request.seq,
            command: request.command.clone(),
            success,
            message: None,
            body,
        })
        .await;
    }

    pub async fn fail(&mut self, request: &Request, message: &str) {
        let seq = self.allocate_seq();
        self.send_response(Response {
            seq,
            request_seq: request.seq,
            command: request.command.clone(),
            success: false,
            message: Some(message.to_string()),
            body: Some(json!({"error": {"id": 3000, "format": message}})),
        })
        .await;
    }

    pub async fn send_response(&mut self, response: Response) {
        self.send(&Message::Response(response)).await;
    }

    pub async fn send_event(&mut self, event: &str, body: Option<Value>) {
        let seq = self.allocate_seq();
        self.send(&Message::Event(Event {
            seq,
            event: event.to_string(),
            body,
        }))
        .await;
    }

    /// Send a reverse request to the client
    pub async fn send_request(&mut self, seq: i64, command: &str) {
        self.send(&Message::Request(Request {
            seq,
            command: command.to_string(),
            arguments: None,
        }))
        .await;
    }

    /// Drop both halves, which the client sees as end of stream
    pub fn close(self) {}
}

// ============================================================================
// Scripted Adapter
// ============================================================================

/// How the scripted adapter deviates from a well-behaved one
#[derive(Debug, Clone, Default)]
pub struct AdapterScript {
    /// Answer `initialize` with this error
    pub initialize_error: Option<String>,
    /// Answer `launch` with this error, without emitting `initialized`
    pub launch_error: Option<String>,
    /// Emit `initialized` right after the `initialize` response
    pub initialized_before_launch: bool,
    /// Never emit `initialized`
    pub withhold_initialized: bool,
    /// Never answer `configurationDone`
    pub ignore_configuration_done: bool,
    /// Emit `terminated` instead of answering `launch`
    pub terminate_on_launch: bool,
    /// Close the stream upon receiving `launch`
    pub hang_up_on_launch: bool,
    /// Advertise no `configurationDone` support, answer `launch` right away
    /// and reject `configurationDone`
    pub configuration_done_unsupported: bool,
}

/// Ordered record of what the scripted adapter received and sent
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Transcript {
    fn push(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Index of the first entry equal to `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|existing| existing == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries()
            .iter()
            .filter(|existing| existing.as_str() == entry)
            .count()
    }
}

/// Adapter double that withholds its `launch` response until
/// `configurationDone` has been received, like most real adapters
pub struct ScriptedAdapter {
    pub transcript: Transcript,
    pub task: JoinHandle<()>,
}

impl ScriptedAdapter {
    pub fn spawn(peer: PeerAdapter, script: AdapterScript) -> Self {
        let transcript = Transcript::default();
        let task = tokio::spawn(run_script(peer, script, transcript.clone()));
        Self { transcript, task }
    }

    /// Dispatcher connected to a freshly spawned scripted adapter
    pub fn connect(script: AdapterScript) -> (Dispatcher, Self) {
        let (dispatcher, peer) = connected_pair();
        (dispatcher, Self::spawn(peer, script))
    }
}

async fn run_script(mut peer: PeerAdapter, script: AdapterScript, transcript: Transcript) {
    let mut withheld_launch: Option<Request> = None;

    while let Some(message) = peer.try_recv().await {
        let Message::Request(request) = message else {
            continue;
        };
        transcript.push(format!("recv {}", request.command));

        match request.command.as_str() {
            commands::INITIALIZE => {
                if let Some(error) = &script.initialize_error {
                    transcript.push("send response initialize failed".to_string());
                    peer.fail(&request, error).await;
                    continue;
                }
                transcript.push("send response initialize".to_string());
                let supported = !script.configuration_done_unsupported;
                peer.respond(
                    &request,
                    true,
                    Some(json!({"supportsConfigurationDoneRequest": supported})),
                )
                .await;

                if script.initialized_before_launch {
                    transcript.push("send event initialized".to_string());
                    peer.send_event(events::INITIALIZED, None).await;
                }
            }
            commands::LAUNCH => {
                if script.hang_up_on_launch {
                    transcript.push("hang up".to_string());
                    return;
                }
                if script.terminate_on_launch {
                    transcript.push("send event terminated".to_string());
                    peer.send_event(events::TERMINATED, None).await;
                    continue;
                }
                if let Some(error) = &script.launch_error {
                    transcript.push("send response launch failed".to_string());
                    peer.fail(&request, error).await;
                    continue;
                }
                if !script.initialized_before_launch && !script.withhold_initialized {
                    transcript.push("send event initialized".to_string());
                    peer.send_event(events::INITIALIZED, None).await;
                }
                if script.configuration_done_unsupported {
                    transcript.push("send response launch".to_string());
                    peer.respond(&request, true, None).await;
                    continue;
                }
                withheld_launch = Some(request);
            }
            commands::CONFIGURATION_DONE => {
                if script.configuration_done_unsupported {
                    transcript.push("send response configurationDone failed".to_string());
                    peer.fail(&request, "unrecognized request").await;
                    continue;
                }
                if script.ignore_configuration_done {
                    continue;
                }
                transcript.push("send response configurationDone".to_string());
                peer.respond(&request, true, None).await;

                if let Some(launch) = withheld_launch.take() {
                    transcript.push("send response launch".to_string());
                    peer.respond(&launch, true, None).await;
                }
            }
            commands::DISCONNECT => {
                transcript.push("send response disconnect".to_string());
                peer.respond(&request, true, None).await;
                return;
            }
            _ => {
                peer.respond(&request, true, None).await;
            }
        }
    }
}
