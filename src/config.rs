//! Session configuration
//!
//! [`SessionConfig`] describes which adapter to spawn and how long each
//! startup step may take. It is built with [`SessionConfigBuilder`], which
//! fills in defaults and validates the result.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::dap::error::HandshakeStep;
use crate::dap::types::InitializeRequestArguments;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default deadline for the `initialize` response
pub const DEFAULT_INITIALIZE_TIMEOUT_SECS: u64 = 10;

/// Default deadline for the `initialized` event after `launch` was sent
pub const DEFAULT_INITIALIZED_EVENT_TIMEOUT_SECS: u64 = 10;

/// Default deadline for the `configurationDone` response
pub const DEFAULT_CONFIGURATION_DONE_TIMEOUT_SECS: u64 = 10;

/// Default deadline for the `launch` response once configuration is done.
///
/// Adapters such as delve compile the debuggee before answering, so this is
/// the longest of the handshake timeouts.
pub const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 30;

/// Upper bound for any handshake timeout (5 minutes)
pub const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 300;

/// Time the adapter gets to exit after SIGTERM before it is killed
pub const DEFAULT_TERMINATION_GRACE_SECS: u64 = 2;

/// Time the adapter gets to answer `disconnect` during a graceful stop
pub const DEFAULT_DISCONNECT_TIMEOUT_SECS: u64 = 2;

/// Identifier sent as `clientID` and default `adapterID`
pub const DEFAULT_CLIENT_ID: &str = "dap-probe";

pub type StderrHandler = Arc<dyn Fn(String) + Send + Sync>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid adapter command: {command:?} - {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("Invalid adapter arguments: {args:?} - {reason}")]
    InvalidArguments { args: Vec<String>, reason: String },

    #[error("Invalid timeout for {step}: {timeout:?} - {reason}")]
    InvalidTimeout {
        step: String,
        timeout: Duration,
        reason: String,
    },

    #[error("Working directory validation failed: {path}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Launch defaults must be a JSON object, got: {value}")]
    InvalidLaunchDefaults { value: Value },
}

impl ConfigError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_timeout(
        step: impl Into<String>,
        timeout: Duration,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidTimeout {
            step: step.into(),
            timeout,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Core Configuration Types
// ============================================================================

/// Per-step deadlines for the startup handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTimeouts {
    pub initialize: Duration,
    pub initialized_event: Duration,
    pub configuration_done: Duration,
    pub launch: Duration,
}

impl Default for HandshakeTimeouts {
    fn default() -> Self {
        Self {
            initialize: Duration::from_secs(DEFAULT_INITIALIZE_TIMEOUT_SECS),
            initialized_event: Duration::from_secs(DEFAULT_INITIALIZED_EVENT_TIMEOUT_SECS),
            configuration_done: Duration::from_secs(DEFAULT_CONFIGURATION_DONE_TIMEOUT_SECS),
            launch: Duration::from_secs(DEFAULT_LAUNCH_TIMEOUT_SECS),
        }
    }
}

impl HandshakeTimeouts {
    /// Same deadline for every step
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            initialize: timeout,
            initialized_event: timeout,
            configuration_done: timeout,
            launch: timeout,
        }
    }

    pub fn for_step(&self, step: HandshakeStep) -> Duration {
        match step {
            HandshakeStep::Initialize => self.initialize,
            HandshakeStep::InitializedEvent => self.initialized_event,
            HandshakeStep::ConfigurationDone => self.configuration_done,
            HandshakeStep::Launch => self.launch,
        }
    }
}

/// Complete configuration for one debug session
#[derive(Clone)]
pub struct SessionConfig {
    /// Adapter executable, resolved through PATH
    pub adapter_command: String,

    pub adapter_args: Vec<String>,

    /// Working directory for the adapter; inherits ours when unset
    pub working_directory: Option<PathBuf>,

    /// `adapterID` sent in `initialize`
    pub adapter_id: String,

    pub client_id: String,

    pub client_name: String,

    pub timeouts: HandshakeTimeouts,

    pub termination_grace_period: Duration,

    pub disconnect_timeout: Duration,

    /// Fields merged into every `launch` request
    pub launch_defaults: Map<String, Value>,

    /// Called with each line the adapter writes to stderr
    pub stderr_handler: Option<StderrHandler>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("adapter_command", &self.adapter_command)
            .field("adapter_args", &self.adapter_args)
            .field("working_directory", &self.working_directory)
            .field("adapter_id", &self.adapter_id)
            .field("client_id", &self.client_id)
            .field("client_name", &self.client_name)
            .field("timeouts", &self.timeouts)
            .field("termination_grace_period", &self.termination_grace_period)
            .field("disconnect_timeout", &self.disconnect_timeout)
            .field("launch_defaults", &self.launch_defaults)
            .field(
                "stderr_handler",
                &self.stderr_handler.as_ref().map(|_| "Fn(String)"),
            )
            .finish()
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Arguments for the `initialize` request
    pub fn initialize_arguments(&self) -> InitializeRequestArguments {
        InitializeRequestArguments {
            client_id: Some(self.client_id.clone()),
            client_name: Some(self.client_name.clone()),
            adapter_id: self.adapter_id.clone(),
            locale: Some("en-US".to_string()),
            lines_start_at1: true,
            columns_start_at1: true,
            path_format: Some("path".to_string()),
        }
    }

    /// Arguments for the `launch` request: the configured defaults with
    /// `program` and `args` laid over them
    pub fn launch_arguments(&self, program: &str, args: &[String]) -> Value {
        let mut arguments = self.launch_defaults.clone();
        arguments.insert("program".to_string(), Value::String(program.to_string()));
        arguments.insert(
            "args".to_string(),
            Value::Array(args.iter().cloned().map(Value::String).collect()),
        );
        Value::Object(arguments)
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for SessionConfig with validation and defaults
#[derive(Default)]
pub struct SessionConfigBuilder {
    adapter_command: Option<String>,
    adapter_args: Vec<String>,
    working_directory: Option<PathBuf>,
    adapter_id: Option<String>,
    client_id: Option<String>,
    client_name: Option<String>,
    timeouts: HandshakeTimeouts,
    termination_grace_period: Option<Duration>,
    disconnect_timeout: Option<Duration>,
    launch_defaults: Option<Value>,
    stderr_handler: Option<StderrHandler>,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapter_command(mut self, command: impl Into<String>) -> Self {
        self.adapter_command = Some(command.into());
        self
    }

    pub fn add_arg(mut self, arg: impl Into<String>) -> Self {
        self.adapter_args.push(arg.into());
        self
    }

    pub fn add_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.adapter_args
            .extend(args.into_iter().map(|arg| arg.into()));
        self
    }

    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn adapter_id(mut self, id: impl Into<String>) -> Self {
        self.adapter_id = Some(id.into());
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn initialize_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.initialize = timeout;
        self
    }

    pub fn initialized_event_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.initialized_event = timeout;
        self
    }

    pub fn configuration_done_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.configuration_done = timeout;
        self
    }

    pub fn launch_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.launch = timeout;
        self
    }

    /// Use the same deadline for every handshake step
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts = HandshakeTimeouts::uniform(timeout);
        self
    }

    pub fn termination_grace_period(mut self, period: Duration) -> Self {
        self.termination_grace_period = Some(period);
        self
    }

    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = Some(timeout);
        self
    }

    /// Fields merged into every `launch` request, e.g. `{"stopOnEntry": true}`
    pub fn launch_defaults(mut self, defaults: Value) -> Self {
        self.launch_defaults = Some(defaults);
        self
    }

    pub fn stderr_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let adapter_command = self
            .adapter_command
            .ok_or_else(|| ConfigError::missing_field("adapter_command"))?;

        Self::validate_command(&adapter_command)?;
        Self::validate_arguments(&self.adapter_args)?;
        if let Some(path) = &self.working_directory {
            Self::validate_working_directory(path)?;
        }
        Self::validate_timeouts(&self.timeouts)?;

        let launch_defaults = match self.launch_defaults {
            None => Map::new(),
            Some(Value::Object(map)) => map,
            Some(value) => return Err(ConfigError::InvalidLaunchDefaults { value }),
        };

        let client_id = self
            .client_id
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

        Ok(SessionConfig {
            adapter_command,
            adapter_args: self.adapter_args,
            working_directory: self.working_directory,
            adapter_id: self
                .adapter_id
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            client_name: self.client_name.unwrap_or_else(|| client_id.clone()),
            client_id,
            timeouts: self.timeouts,
            termination_grace_period: self
                .termination_grace_period
                .unwrap_or(Duration::from_secs(DEFAULT_TERMINATION_GRACE_SECS)),
            disconnect_timeout: self
                .disconnect_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_DISCONNECT_TIMEOUT_SECS)),
            launch_defaults,
            stderr_handler: self.stderr_handler,
        })
    }

    fn validate_command(command: &str) -> Result<(), ConfigError> {
        if command.trim().is_empty() {
            return Err(ConfigError::invalid_command(
                command,
                "Adapter command cannot be empty",
            ));
        }

        if command.contains('\0') {
            return Err(ConfigError::invalid_command(
                command,
                "Adapter command contains null character",
            ));
        }

        // Existence is checked at spawn time; the command may be resolved via PATH
        Ok(())
    }

    fn validate_arguments(args: &[String]) -> Result<(), ConfigError> {
        if args.iter().any(|arg| arg.contains('\0')) {
            return Err(ConfigError::InvalidArguments {
                args: args.to_vec(),
                reason: "Arguments cannot contain null characters".to_string(),
            });
        }
        Ok(())
    }

    fn validate_working_directory(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            return Err(ConfigError::WorkingDirectory {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Working directory does not exist",
                ),
            });
        }

        if !path.is_dir() {
            return Err(ConfigError::WorkingDirectory {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "Working directory path is not a directory",
                ),
            });
        }

        Ok(())
    }

    fn validate_timeouts(timeouts: &HandshakeTimeouts) -> Result<(), ConfigError> {
        let steps = [
            HandshakeStep::Initialize,
            HandshakeStep::InitializedEvent,
            HandshakeStep::ConfigurationDone,
            HandshakeStep::Launch,
        ];

        for step in steps {
            let timeout = timeouts.for_step(step);
            if timeout.is_zero() {
                return Err(ConfigError::invalid_timeout(
                    step.to_string(),
                    timeout,
                    "Timeout must be greater than zero",
                ));
            }
            if timeout > Duration::from_secs(MAX_HANDSHAKE_TIMEOUT_SECS) {
                return Err(ConfigError::invalid_timeout(
                    step.to_string(),
                    timeout,
                    "Timeout too long (max 5 minutes)",
                ));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
