use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dap_probe::dap::{HandshakeState, Session};
use dap_probe::logging::{LogConfig, init_logging};
use dap_probe::{SessionConfig, SessionError};
use tracing::{error, info};

/// Drive a debug adapter through its startup handshake and print the wire timeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Debug adapter executable (e.g. dlv, lldb-dap, python)
    #[arg(long, value_name = "CMD")]
    adapter: String,

    /// Argument passed to the adapter; repeat for several
    #[arg(long = "adapter-arg", value_name = "ARG", allow_hyphen_values = true)]
    adapter_args: Vec<String>,

    /// adapterID sent in the initialize request
    #[arg(long, value_name = "ID")]
    adapter_id: Option<String>,

    /// Working directory for the adapter process
    #[arg(long, value_name = "DIR")]
    working_dir: Option<PathBuf>,

    /// Program to launch under the debugger
    #[arg(long, value_name = "PATH")]
    program: String,

    /// Argument passed to the program; repeat for several
    #[arg(long = "program-arg", value_name = "ARG", allow_hyphen_values = true)]
    program_args: Vec<String>,

    /// Extra launch arguments as a JSON object, e.g. '{"stopOnEntry": true}'
    #[arg(long, value_name = "JSON")]
    launch_json: Option<String>,

    /// Deadline for each handshake step
    #[arg(long, value_name = "SECS")]
    timeout_secs: Option<u64>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides DAP_PROBE_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

fn build_config(args: &Args) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut builder = SessionConfig::builder()
        .adapter_command(&args.adapter)
        .add_args(args.adapter_args.iter().cloned());

    if let Some(id) = &args.adapter_id {
        builder = builder.adapter_id(id);
    }
    if let Some(dir) = &args.working_dir {
        builder = builder.working_directory(dir);
    }
    if let Some(secs) = args.timeout_secs {
        builder = builder.handshake_timeout(Duration::from_secs(secs));
    }
    if let Some(json) = &args.launch_json {
        builder = builder.launch_defaults(serde_json::from_str(json)?);
    }

    Ok(builder.build()?)
}

async fn probe(args: &Args) -> Result<HandshakeState, Box<dyn std::error::Error>> {
    let config = build_config(args)?;
    let session = Session::spawn(config).await?;
    info!(session = %session.id(), "Probing adapter '{}'", args.adapter);

    let result = session.handshake(&args.program, &args.program_args).await;

    for record in session.wire_log() {
        println!("{record}");
    }
    for violation in session.protocol_violations() {
        println!("violation: {violation}");
    }

    match &result {
        Ok(outcome) => println!(
            "handshake completed in {:.3}s",
            outcome.elapsed.as_secs_f64()
        ),
        Err(e) => {
            println!("error: {e}");
            if let SessionError::Handshake(dap_probe::dap::HandshakeError::Failed {
                body: Some(body),
                ..
            }) = e
            {
                println!("adapter error body: {body}");
            }
            for line in session.stderr_tail().await {
                println!("adapter stderr: {line}");
            }
        }
    }

    let state = session.state();
    println!("final state: {state}");

    if let Err(e) = session.stop().await {
        error!("Failed to stop adapter cleanly: {}", e);
    }

    Ok(state)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match probe(&args).await {
        Ok(HandshakeState::Ready) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("dap-probe: {e}");
            ExitCode::FAILURE
        }
    }
}
