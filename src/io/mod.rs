//! I/O layer - process management for debug adapters
//!
//! Owns the adapter child process and its standard streams. Nothing here
//! knows about DAP; the protocol layer receives stdin/stdout as plain
//! async byte streams.

pub mod process;

pub use process::{
    AdapterProcess, AdapterStdio, ProcessError, ProcessManager, ProcessState, STDERR_TAIL_LINES,
    StderrMonitor, StopMode,
};
