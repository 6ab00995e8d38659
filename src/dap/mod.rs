//! Debug Adapter Protocol client core
//!
//! Layers, leaf first:
//!
//! - [`transport`]: `Content-Length` framing over async byte streams
//! - [`dispatcher`]: reader loop, request correlation and event fan-out
//! - [`handshake`]: the `initialize` / `launch` / `configurationDone` sequence
//! - [`session`]: one adapter process plus all of the above

pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use dispatcher::{Direction, Dispatcher, EventHandler, EventStream, HandlerId, WireRecord};
pub use error::{
    DispatchError, HandshakeError, HandshakeStep, ProtocolViolation, SessionError, TransportError,
};
pub use handshake::{HandshakeOutcome, HandshakeSequencer, HandshakeState};
pub use session::Session;
pub use transport::{DapTransport, TransportReader, TransportWriter};
pub use types::{Capabilities, Event, Message, Request, Response};
