//! RFC 6455 WebSocket client protocol core.
//!
//! This crate is the hard middle of a WebSocket client: a non-blocking
//! socket transport with timeouts (`transport`), the client opening
//! handshake (`handshake`), a binary frame codec (`frame`), and the
//! connection engine that dispatches control frames and assembles fragmented
//! messages (`connection`). URL parsing, HTTP header parsing, and TLS
//! library bootstrap are external collaborators this crate consumes rather
//! than reimplements.
//!
//! No server mode, no permessage-deflate or other extensions, no
//! subprotocol negotiation, no automatic reconnect, no internal event loop:
//! every blocking call here takes a deadline and the caller drives the loop.

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod rand;
pub mod transport;

pub use config::{ClientConfig, TlsMode};
pub use connection::{Connection, Message, State};
pub use error::{Error, ErrorKind, Result};
pub use frame::{Frame, Opcode};
