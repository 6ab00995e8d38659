//! Consumer-facing session API
//!
//! A [`Session`] owns everything tied to one adapter process: the process
//! itself, the dispatcher reading its stdout and the handshake sequencer.
//! Nothing outlives it; dropping a session kills a still-running adapter.

use std::process::ExitStatus;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::dap::dispatcher::{Dispatcher, EventStream, MAX_UNCLAIMED_RESPONSES, WireRecord};
use crate::dap::error::{ProtocolViolation, SessionError};
use crate::dap::handshake::{HandshakeOutcome, HandshakeSequencer, HandshakeState};
use crate::dap::types::{Response, commands};
use crate::io::{AdapterProcess, ProcessError, ProcessManager, StderrMonitor};

pub struct Session {
    id: Uuid,
    config: SessionConfig,
    process: Mutex<AdapterProcess>,
    dispatcher: Dispatcher,
    handshake: HandshakeSequencer,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("adapter", &self.config.adapter_command)
            .field("state", &self.handshake.state())
            .finish()
    }
}

impl Session {
    /// Spawn the adapter and wire up its streams, without starting the handshake
    pub async fn spawn(config: SessionConfig) -> Result<Self, SessionError> {
        let id = Uuid::new_v4();
        info!(session = %id, "Spawning debug adapter '{}'", config.adapter_command);

        let mut process = AdapterProcess::new(
            config.adapter_command.clone(),
            config.adapter_args.clone(),
            config.working_directory.clone(),
        );
        if let Some(handler) = config.stderr_handler.clone() {
            process.on_stderr_line(move |line| handler(line));
        }
        process.start().await?;

        let stdio = process.take_stdio()?;
        let dispatcher = Dispatcher::new(stdio.stdout, stdio.stdin);
        let handshake = HandshakeSequencer::new(dispatcher.clone(), config.clone());

        Ok(Self {
            id,
            config,
            process: Mutex::new(process),
            dispatcher,
            handshake,
        })
    }

    /// Spawn the adapter and run the handshake for `program`.
    ///
    /// On failure the adapter is stopped before the error is returned.
    pub async fn start(
        config: SessionConfig,
        program: &str,
        args: &[String],
    ) -> Result<(Self, HandshakeOutcome), SessionError> {
        let session = Self::spawn(config).await?;

        match session.handshake(program, args).await {
            Ok(outcome) => Ok((session, outcome)),
            Err(error) => {
                for line in session.stderr_tail().await {
                    warn!(session = %session.id, "adapter stderr: {}", line);
                }
                if let Err(stop_error) = session.stop().await {
                    debug!("Failed to stop session after handshake error: {}", stop_error);
                }
                Err(error)
            }
        }
    }

    /// Run the startup handshake; see [`HandshakeSequencer::start`]
    pub async fn handshake(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<HandshakeOutcome, SessionError> {
        Ok(self.handshake.start(program, args).await?)
    }

    /// Send a request without waiting for its response.
    ///
    /// The response stays claimable through [`Session::wait`] until
    /// [`MAX_UNCLAIMED_RESPONSES`] newer answered requests go unclaimed.
    pub async fn send(&self, command: &str, arguments: Option<Value>) -> Result<i64, SessionError> {
        Ok(self.dispatcher.send_request(command, arguments).await?)
    }

    /// Wait for the response to a request issued with [`Session::send`]
    pub async fn wait(&self, seq: i64, timeout: Duration) -> Result<Response, SessionError> {
        Ok(self.dispatcher.await_response(seq, timeout).await?)
    }

    pub fn events(&self) -> EventStream {
        self.dispatcher.subscribe_events()
    }

    /// Disconnect from the adapter and make sure its process is gone.
    ///
    /// Sends `disconnect` while the adapter is still reachable, then
    /// terminates the process and shuts the dispatcher down, which fails
    /// every outstanding wait and closes every event stream. Safe to call
    /// repeatedly; returns the adapter's exit status when known.
    pub async fn stop(&self) -> Result<Option<ExitStatus>, SessionError> {
        let mut process = self.process.lock().await;

        if self.dispatcher.is_connected() && process.is_running() {
            let arguments = json!({"terminateDebuggee": true});
            match self
                .dispatcher
                .request(commands::DISCONNECT, Some(arguments), self.config.disconnect_timeout)
                .await
            {
                Ok(response) => debug!(
                    session = %self.id,
                    "Adapter acknowledged disconnect (success: {})", response.success
                ),
                Err(e) => debug!(session = %self.id, "Disconnect not acknowledged: {}", e),
            }
        }

        let status = match process
            .terminate(self.config.termination_grace_period)
            .await
        {
            Ok(status) => Some(status),
            Err(ProcessError::Wait(reason)) => {
                warn!(session = %self.id, "Adapter exit status unavailable: {}", reason);
                None
            }
            Err(e) => return Err(e.into()),
        };

        self.dispatcher.shutdown().await;
        info!(session = %self.id, "Session stopped (exit status: {:?})", status);

        Ok(status)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn wire_log(&self) -> Vec<WireRecord> {
        self.dispatcher.wire_log()
    }

    pub fn protocol_violations(&self) -> Vec<ProtocolViolation> {
        self.dispatcher.protocol_violations()
    }

    /// Most recent adapter stderr lines
    pub async fn stderr_tail(&self) -> Vec<String> {
        self.process.lock().await.stderr_tail()
    }
}
