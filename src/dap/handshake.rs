//! Startup handshake state machine
//!
//! ```text
//! Idle -> Initializing -> AwaitingInitializedEvent -> ConfiguringDone -> Launching -> Ready
//! ```
//!
//! `launch` is sent as soon as `initialize` succeeds, before any
//! `initialized` event. Adapters emit `initialized` while processing
//! `launch` and hold the `launch` response back until `configurationDone`
//! arrives, so `configurationDone` is sent from an event handler running
//! inside the dispatcher's reader loop. Waiting for the `launch` response
//! before sending it would deadlock.
//!
//! Adapters that do not advertise `supportsConfigurationDoneRequest` never
//! get `configurationDone`; the sequencer goes from `launch` straight to
//! `Launching` and only waits for the `launch` response.
//!
//! `Failed` and `Disconnected` are terminal and reachable from any
//! non-terminal state.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{Level, debug, info, warn};

use crate::config::{HandshakeTimeouts, SessionConfig};
use crate::dap::dispatcher::{Dispatcher, EventHandler};
use crate::dap::error::{
    DispatchError, HandshakeError, HandshakeStep, ProtocolViolation, TransportError,
};
use crate::dap::types::{Capabilities, Event, Response, commands, events};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Initializing,
    AwaitingInitializedEvent,
    ConfiguringDone,
    Launching,
    Ready,
    Failed { step: HandshakeStep, message: String },
    Disconnected { reason: String },
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Failed { .. } | Self::Disconnected { .. }
        )
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Initializing => f.write_str("Initializing"),
            Self::AwaitingInitializedEvent => f.write_str("AwaitingInitializedEvent"),
            Self::ConfiguringDone => f.write_str("ConfiguringDone"),
            Self::Launching => f.write_str("Launching"),
            Self::Ready => f.write_str("Ready"),
            Self::Failed { step, message } => write!(f, "Failed at {step}: {message}"),
            Self::Disconnected { reason } => write!(f, "Disconnected: {reason}"),
        }
    }
}

/// What a successful handshake produced
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub capabilities: Capabilities,
    pub launch_response: Response,
    pub elapsed: Duration,
}

// ============================================================================
// Shared State
// ============================================================================

/// Bookkeeping shared between `start` and the `initialized` handler.
///
/// Held across the `launch` send so the handler never observes the state
/// between "launch written" and "awaiting initialized".
#[derive(Debug, Default)]
struct Progress {
    /// `initialized` arrived before `launch` was sent
    initialized_early: bool,
    /// Adapter advertised `supportsConfigurationDoneRequest`
    configuration_done_supported: bool,
    configuration_done_seq: Option<i64>,
}

struct Shared {
    state: watch::Sender<HandshakeState>,
    progress: Mutex<Progress>,
}

impl Shared {
    fn current(&self) -> HandshakeState {
        self.state.borrow().clone()
    }

    /// Move to `next` unless a terminal state was already reached
    fn advance(&self, next: HandshakeState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = next.clone();
            true
        });
        if changed {
            info!("Handshake state -> {}", next);
        }
        changed
    }

    async fn send_configuration_done(&self, progress: &mut Progress, dispatcher: &Dispatcher) {
        match dispatcher
            .send_request(commands::CONFIGURATION_DONE, None)
            .await
        {
            Ok(seq) => {
                progress.configuration_done_seq = Some(seq);
                self.advance(HandshakeState::ConfiguringDone);
            }
            Err(e) => {
                self.advance(HandshakeState::Failed {
                    step: HandshakeStep::ConfigurationDone,
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Reacts to events from inside the dispatcher's reader loop
struct SequencerHandler {
    shared: Arc<Shared>,
}

#[async_trait]
impl EventHandler for SequencerHandler {
    async fn on_event(&self, event: &Event, dispatcher: &Dispatcher) {
        match event.event.as_str() {
            events::INITIALIZED => {
                let mut progress = self.shared.progress.lock().await;
                let state = self.shared.current();
                if !progress.configuration_done_supported && state != HandshakeState::Initializing {
                    debug!("Received 'initialized'; adapter takes no configurationDone");
                    return;
                }
                match state {
                    HandshakeState::AwaitingInitializedEvent
                        if progress.configuration_done_seq.is_none() =>
                    {
                        debug!("Received 'initialized', sending configurationDone");
                        self.shared
                            .send_configuration_done(&mut progress, dispatcher)
                            .await;
                    }
                    HandshakeState::Initializing => {
                        debug!("Received 'initialized' before launch was sent");
                        progress.initialized_early = true;
                    }
                    state => dispatcher.report_violation(ProtocolViolation::UnexpectedMessage {
                        state: state.to_string(),
                        message: "initialized event".to_string(),
                    }),
                }
            }
            events::TERMINATED | events::EXITED => {
                self.shared.advance(HandshakeState::Disconnected {
                    reason: format!("adapter sent '{}' event", event.event),
                });
            }
            other => debug!(
                "Handshake ignoring '{}' event in state {}",
                other,
                self.shared.current()
            ),
        }
    }
}

// ============================================================================
// Sequencer
// ============================================================================

/// Drives one session through the startup handshake
pub struct HandshakeSequencer {
    dispatcher: Dispatcher,
    config: SessionConfig,
    shared: Arc<Shared>,
}

impl HandshakeSequencer {
    pub fn new(dispatcher: Dispatcher, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(HandshakeState::Idle);
        Self {
            dispatcher,
            config,
            shared: Arc::new(Shared {
                state,
                progress: Mutex::new(Progress::default()),
            }),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.shared.current()
    }

    /// Receiver notified on every state transition
    pub fn watch_state(&self) -> watch::Receiver<HandshakeState> {
        self.shared.state.subscribe()
    }

    /// Run the handshake for `program`; can only be called once
    pub async fn start(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let claimed = self.shared.state.send_if_modified(|state| {
            if *state != HandshakeState::Idle {
                return false;
            }
            *state = HandshakeState::Initializing;
            true
        });
        if !claimed {
            return Err(HandshakeError::AlreadyStarted);
        }
        info!("Starting DAP handshake for '{}'", program);

        let handler_id = self.dispatcher.add_event_handler(Arc::new(SequencerHandler {
            shared: Arc::clone(&self.shared),
        }));

        let started = Instant::now();
        let result = self.run(program, args, started).await;
        self.dispatcher.remove_event_handler(handler_id);

        match &result {
            Ok(_) => {
                self.shared.advance(HandshakeState::Ready);
                crate::log_timing!(Level::INFO, "dap_handshake", started.elapsed());
            }
            Err(error) => {
                warn!("DAP handshake failed: {}", error);
                let terminal = match error {
                    HandshakeError::Disconnected { reason, .. } => HandshakeState::Disconnected {
                        reason: reason.clone(),
                    },
                    other => HandshakeState::Failed {
                        step: other.step().unwrap_or(HandshakeStep::Initialize),
                        message: other.reason(),
                    },
                };
                self.shared.advance(terminal);
            }
        }

        result
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        started: Instant,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let timeouts: HandshakeTimeouts = self.config.timeouts;
        let mut states = self.shared.state.subscribe();

        // initialize
        let arguments = serde_json::to_value(self.config.initialize_arguments()).map_err(|e| {
            HandshakeError::from_dispatch(
                HandshakeStep::Initialize,
                DispatchError::Write {
                    command: commands::INITIALIZE.to_string(),
                    source: TransportError::Encode(e),
                },
            )
        })?;
        let seq = self
            .request(HandshakeStep::Initialize, commands::INITIALIZE, Some(arguments))
            .await?;
        let response = self
            .dispatcher
            .await_response(seq, timeouts.initialize)
            .await
            .map_err(|e| HandshakeError::from_dispatch(HandshakeStep::Initialize, e))?;
        check_interrupted(&mut states, HandshakeStep::Initialize)?;
        ensure_success(HandshakeStep::Initialize, &response)?;
        let capabilities = Capabilities::from_body(response.body.as_ref());
        debug!("Adapter capabilities: {:?}", capabilities);
        let configuration_done_supported =
            capabilities.supports_configuration_done_request == Some(true);

        if !configuration_done_supported {
            let launch_seq = self
                .request(
                    HandshakeStep::Launch,
                    commands::LAUNCH,
                    Some(self.config.launch_arguments(program, args)),
                )
                .await?;
            self.shared.advance(HandshakeState::Launching);

            let launch_wait = self.dispatcher.await_response(launch_seq, timeouts.launch);
            tokio::pin!(launch_wait);
            let launch_response =
                wait_for_launch(&mut states, launch_wait.as_mut(), timeouts.launch).await?;

            return Ok(HandshakeOutcome {
                capabilities,
                launch_response,
                elapsed: started.elapsed(),
            });
        }

        // launch, without waiting for its response
        let launch_seq = {
            let mut progress = self.shared.progress.lock().await;
            progress.configuration_done_supported = true;
            let launch_seq = self
                .request(
                    HandshakeStep::Launch,
                    commands::LAUNCH,
                    Some(self.config.launch_arguments(program, args)),
                )
                .await?;
            self.shared.advance(HandshakeState::AwaitingInitializedEvent);

            if progress.initialized_early {
                self.shared
                    .send_configuration_done(&mut progress, &self.dispatcher)
                    .await;
            }
            launch_seq
        };

        // Generous ceiling; the per-step deadlines below are what callers see
        let launch_budget =
            timeouts.initialized_event + timeouts.configuration_done + timeouts.launch;
        let launch_wait = self.dispatcher.await_response(launch_seq, launch_budget);
        tokio::pin!(launch_wait);
        let mut early_launch: Option<Response> = None;

        // initialized event; the handler sends configurationDone
        let deadline = tokio::time::sleep(timeouts.initialized_event);
        tokio::pin!(deadline);
        loop {
            check_interrupted(&mut states, HandshakeStep::InitializedEvent)?;
            if self.shared.current() == HandshakeState::ConfiguringDone {
                break;
            }

            tokio::select! {
                _ = states.changed() => {}
                result = &mut launch_wait, if early_launch.is_none() => {
                    early_launch = Some(settle_launch(result, HandshakeStep::InitializedEvent)?);
                }
                _ = &mut deadline => {
                    return Err(HandshakeError::Timeout {
                        step: HandshakeStep::InitializedEvent,
                        timeout: timeouts.initialized_event,
                    });
                }
            }
        }

        // configurationDone response
        let configuration_done_seq = self
            .shared
            .progress
            .lock()
            .await
            .configuration_done_seq
            .ok_or_else(|| HandshakeError::Failed {
                step: HandshakeStep::ConfigurationDone,
                message: Some("configurationDone was never sent".to_string()),
                body: None,
            })?;
        let configuration_done_wait = self
            .dispatcher
            .await_response(configuration_done_seq, timeouts.configuration_done);
        tokio::pin!(configuration_done_wait);

        let response = loop {
            check_interrupted(&mut states, HandshakeStep::ConfigurationDone)?;

            tokio::select! {
                result = &mut configuration_done_wait => {
                    break result.map_err(|e| {
                        HandshakeError::from_dispatch(HandshakeStep::ConfigurationDone, e)
                    })?;
                }
                result = &mut launch_wait, if early_launch.is_none() => {
                    early_launch = Some(settle_launch(result, HandshakeStep::ConfigurationDone)?);
                }
                _ = states.changed() => {}
            }
        };
        ensure_success(HandshakeStep::ConfigurationDone, &response)?;
        self.shared.advance(HandshakeState::Launching);

        // launch response, possibly already received
        let launch_response = match early_launch {
            Some(response) => response,
            None => wait_for_launch(&mut states, launch_wait.as_mut(), timeouts.launch).await?,
        };

        Ok(HandshakeOutcome {
            capabilities,
            launch_response,
            elapsed: started.elapsed(),
        })
    }

    async fn request(
        &self,
        step: HandshakeStep,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<i64, HandshakeError> {
        self.dispatcher
            .send_request(command, arguments)
            .await
            .map_err(|e| HandshakeError::from_dispatch(step, e))
    }
}

/// Fail if the handler moved the handshake to a terminal failure state
fn check_interrupted(
    states: &mut watch::Receiver<HandshakeState>,
    step: HandshakeStep,
) -> Result<(), HandshakeError> {
    let current = states.borrow_and_update().clone();
    match current {
        HandshakeState::Disconnected { reason } => {
            Err(HandshakeError::Disconnected { step, reason })
        }
        HandshakeState::Failed { step, message } => Err(HandshakeError::Failed {
            step,
            message: Some(message),
            body: None,
        }),
        _ => Ok(()),
    }
}

fn ensure_success(step: HandshakeStep, response: &Response) -> Result<(), HandshakeError> {
    if response.success {
        return Ok(());
    }
    Err(HandshakeError::Failed {
        step,
        message: response.message.clone(),
        body: response.body.clone(),
    })
}

/// Wait up to `timeout` for the `launch` response
async fn wait_for_launch<F>(
    states: &mut watch::Receiver<HandshakeState>,
    mut launch_wait: Pin<&mut F>,
    timeout: Duration,
) -> Result<Response, HandshakeError>
where
    F: Future<Output = Result<Response, DispatchError>>,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        check_interrupted(states, HandshakeStep::Launch)?;

        tokio::select! {
            result = &mut launch_wait => return settle_launch(result, HandshakeStep::Launch),
            _ = states.changed() => {}
            _ = &mut deadline => {
                return Err(HandshakeError::Timeout {
                    step: HandshakeStep::Launch,
                    timeout,
                });
            }
        }
    }
}

/// Interpret the `launch` outcome; a lost connection is blamed on `waiting_for`
fn settle_launch(
    result: Result<Response, DispatchError>,
    waiting_for: HandshakeStep,
) -> Result<Response, HandshakeError> {
    match result {
        Ok(response) => {
            ensure_success(HandshakeStep::Launch, &response)?;
            Ok(response)
        }
        Err(DispatchError::AdapterDisconnected { reason }) => Err(HandshakeError::Disconnected {
            step: waiting_for,
            reason,
        }),
        Err(e) => Err(HandshakeError::from_dispatch(HandshakeStep::Launch, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::dispatcher::Direction;
    use crate::dap::testing::{AdapterScript, ScriptedAdapter, connected_pair};
    use serde_json::json;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    fn config(timeout: Duration) -> SessionConfig {
        SessionConfig::builder()
            .adapter_command("scripted-adapter")
            .handshake_timeout(timeout)
            .build()
            .unwrap()
    }

    fn connect_sequencer(script: AdapterScript, timeout: Duration) -> (HandshakeSequencer, ScriptedAdapter) {
        let (dispatcher, adapter) = ScriptedAdapter::connect(script);
        (HandshakeSequencer::new(dispatcher, config(timeout)), adapter)
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let (sequencer, adapter) = connect_sequencer(AdapterScript::default(), Duration::from_secs(5));

        let outcome = sequencer
            .start("fizzbuzz.py", &["--count".to_string(), "3".to_string()])
            .await
            .unwrap();

        assert_eq!(sequencer.state(), HandshakeState::Ready);
        assert!(outcome.launch_response.success);
        assert_eq!(
            outcome.capabilities.supports_configuration_done_request,
            Some(true)
        );

        let transcript = adapter.transcript;
        assert_eq!(
            transcript.entries(),
            vec![
                "recv initialize",
                "send response initialize",
                "recv launch",
                "send event initialized",
                "recv configurationDone",
                "send response configurationDone",
                "send response launch",
            ]
        );
    }

    #[tokio::test]
    async fn test_configuration_done_written_before_launch_response_is_read() {
        let (dispatcher, _adapter) = ScriptedAdapter::connect(AdapterScript::default());
        let sequencer = HandshakeSequencer::new(dispatcher.clone(), config(Duration::from_secs(5)));

        sequencer.start("main.go", &[]).await.unwrap();

        let log = dispatcher.wire_log();
        let position = |direction, kind, name| {
            log.iter()
                .position(|record| record.is(direction, kind, name))
                .unwrap()
        };
        let launch_sent = position(Direction::Sent, "request", "launch");
        let initialized = position(Direction::Received, "event", "initialized");
        let configuration_done = position(Direction::Sent, "request", "configurationDone");
        let launch_response = position(Direction::Received, "response", "launch");

        assert!(launch_sent < initialized);
        assert!(initialized < configuration_done);
        assert!(configuration_done < launch_response);
        assert!(dispatcher.protocol_violations().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_failure_carries_adapter_message() {
        let script = AdapterScript {
            initialize_error: Some("unsupported adapterID".to_string()),
            ..Default::default()
        };
        let (sequencer, adapter) = connect_sequencer(script, Duration::from_secs(5));

        let error = sequencer.start("main.go", &[]).await.unwrap_err();

        match &error {
            HandshakeError::Failed {
                step,
                message,
                body,
            } => {
                assert_eq!(*step, HandshakeStep::Initialize);
                assert_eq!(message.as_deref(), Some("unsupported adapterID"));
                assert!(body.is_some());
            }
            other => panic!("Expected failure, got: {other:?}"),
        }
        assert!(matches!(
            sequencer.state(),
            HandshakeState::Failed {
                step: HandshakeStep::Initialize,
                ..
            }
        ));
        assert_eq!(adapter.transcript.position("recv launch"), None);
    }

    #[tokio::test]
    async fn test_launch_failure_before_initialized() {
        let script = AdapterScript {
            launch_error: Some("could not launch process: not found".to_string()),
            ..Default::default()
        };
        let (sequencer, _adapter) = connect_sequencer(script, Duration::from_secs(5));

        let error = sequencer.start("missing.go", &[]).await.unwrap_err();

        assert_eq!(error.step(), Some(HandshakeStep::Launch));
        assert_eq!(
            error.to_string(),
            "Handshake failed at launch: could not launch process: not found"
        );
    }

    #[tokio::test]
    async fn test_missing_initialized_event_times_out_naming_step() {
        let script = AdapterScript {
            withhold_initialized: true,
            ..Default::default()
        };
        let (sequencer, _adapter) = connect_sequencer(script, Duration::from_millis(200));

        let error = sequencer.start("main.go", &[]).await.unwrap_err();

        assert!(matches!(
            error,
            HandshakeError::Timeout {
                step: HandshakeStep::InitializedEvent,
                ..
            }
        ));
        assert!(error.to_string().contains("initialized event"));
    }

    #[tokio::test]
    async fn test_silent_configuration_done_times_out() {
        let script = AdapterScript {
            ignore_configuration_done: true,
            ..Default::default()
        };
        let (sequencer, _adapter) = connect_sequencer(script, Duration::from_millis(200));

        let error = sequencer.start("main.go", &[]).await.unwrap_err();

        assert!(matches!(
            error,
            HandshakeError::Timeout {
                step: HandshakeStep::ConfigurationDone,
                ..
            }
        ));
        assert!(matches!(
            sequencer.state(),
            HandshakeState::Failed {
                step: HandshakeStep::ConfigurationDone,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_terminated_event_forces_disconnected() {
        let script = AdapterScript {
            terminate_on_launch: true,
            ..Default::default()
        };
        let (sequencer, _adapter) = connect_sequencer(script, Duration::from_secs(5));

        let error = sequencer.start("main.go", &[]).await.unwrap_err();

        assert!(matches!(error, HandshakeError::Disconnected { .. }));
        assert_eq!(
            sequencer.state(),
            HandshakeState::Disconnected {
                reason: "adapter sent 'terminated' event".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_adapter_hang_up_during_launch() {
        let script = AdapterScript {
            hang_up_on_launch: true,
            ..Default::default()
        };
        let (sequencer, _adapter) = connect_sequencer(script, Duration::from_secs(5));

        let error = sequencer.start("main.go", &[]).await.unwrap_err();

        match error {
            HandshakeError::Disconnected { step, reason } => {
                assert_eq!(step, HandshakeStep::InitializedEvent);
                assert_eq!(reason, "end of stream");
            }
            other => panic!("Expected disconnect, got: {other:?}"),
        }
        assert!(matches!(
            sequencer.state(),
            HandshakeState::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_early_initialized_sends_configuration_done_once() {
        let script = AdapterScript {
            initialized_before_launch: true,
            ..Default::default()
        };
        let (sequencer, adapter) = connect_sequencer(script, Duration::from_secs(5));

        sequencer.start("main.go", &[]).await.unwrap();

        let transcript = adapter.transcript;
        assert_eq!(sequencer.state(), HandshakeState::Ready);
        assert_eq!(transcript.count("recv configurationDone"), 1);
        assert!(
            transcript.position("recv launch") < transcript.position("recv configurationDone")
        );
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (sequencer, _adapter) = connect_sequencer(AdapterScript::default(), Duration::from_secs(5));
        sequencer.start("main.go", &[]).await.unwrap();

        assert!(matches!(
            sequencer.start("main.go", &[]).await,
            Err(HandshakeError::AlreadyStarted)
        ));
        assert_eq!(sequencer.state(), HandshakeState::Ready);
    }

    #[tokio::test]
    async fn test_adapter_without_configuration_done_support() {
        let script = AdapterScript {
            configuration_done_unsupported: true,
            ..Default::default()
        };
        let (sequencer, adapter) = connect_sequencer(script, Duration::from_secs(5));

        let outcome = sequencer.start("main.rb", &[]).await.unwrap();

        assert_eq!(sequencer.state(), HandshakeState::Ready);
        assert_eq!(
            outcome.capabilities.supports_configuration_done_request,
            Some(false)
        );
        assert!(outcome.launch_response.success);
        assert_eq!(adapter.transcript.position("recv configurationDone"), None);
        assert!(sequencer.dispatcher.protocol_violations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_state_message_omits_step() {
        let script = AdapterScript {
            ignore_configuration_done: true,
            ..Default::default()
        };
        let (sequencer, _adapter) = connect_sequencer(script, Duration::from_millis(200));

        sequencer.start("main.go", &[]).await.unwrap_err();

        assert_eq!(
            sequencer.state().to_string(),
            "Failed at configurationDone: timed out after 200ms"
        );
    }

    async fn reach(
        states: &mut watch::Receiver<HandshakeState>,
        expected: HandshakeState,
    ) -> HandshakeState {
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|state| *state == expected),
        )
        .await
        .expect("state was not reached")
        .unwrap()
        .clone()
    }

    #[tokio::test]
    async fn test_state_follows_each_handshake_frame() {
        const WAIT: Duration = Duration::from_secs(5);

        let (dispatcher, mut peer) = connected_pair();
        let sequencer = Arc::new(HandshakeSequencer::new(dispatcher, config(WAIT)));
        let mut states = sequencer.watch_state();
        let mut observed = vec![states.borrow_and_update().clone()];

        let handshake = {
            let sequencer = Arc::clone(&sequencer);
            tokio::spawn(async move { sequencer.start("main.go", &[]).await })
        };

        let initialize = peer.recv_request().await;
        assert_eq!(initialize.command, "initialize");
        observed.push(reach(&mut states, HandshakeState::Initializing).await);
        peer.respond(
            &initialize,
            true,
            Some(json!({"supportsConfigurationDoneRequest": true})),
        )
        .await;

        let launch = peer.recv_request().await;
        assert_eq!(launch.command, "launch");
        observed.push(reach(&mut states, HandshakeState::AwaitingInitializedEvent).await);
        peer.send_event("initialized", None).await;

        let configuration_done = peer.recv_request().await;
        assert_eq!(configuration_done.command, "configurationDone");
        observed.push(reach(&mut states, HandshakeState::ConfiguringDone).await);
        peer.respond(&configuration_done, true, None).await;

        observed.push(reach(&mut states, HandshakeState::Launching).await);
        peer.respond(&launch, true, None).await;

        handshake.await.unwrap().unwrap();
        observed.push(reach(&mut states, HandshakeState::Ready).await);

        assert_eq!(
            observed,
            vec![
                HandshakeState::Idle,
                HandshakeState::Initializing,
                HandshakeState::AwaitingInitializedEvent,
                HandshakeState::ConfiguringDone,
                HandshakeState::Launching,
                HandshakeState::Ready,
            ]
        );
    }
}
