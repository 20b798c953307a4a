//! Error taxonomy surfaced to callers (spec §7).
//!
//! The source this crate is modeled on keeps a thread-local last-error slot;
//! here each fallible operation returns a `Result<_, Error>` instead, which
//! composes with `?` and needs no global state. `ErrorKind` is the taxonomy
//! callers are expected to match on; `Error` carries the kind-specific detail.

use std::fmt;
use std::io;

use thiserror::Error;

/// Coarse error taxonomy. `None`/success has no variant here: it is simply
/// `Ok(..)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Readiness deadline expired.
    Timeout,
    /// Recoverable condition the caller may retry (e.g. a benign short read).
    Warn,
    /// System-level socket failure.
    Net,
    /// TLS setup, handshake, shutdown, or I/O failure.
    Tls,
    /// Upgrade response missing a required header, or accept key mismatch.
    Handshake,
    /// Malformed frame or illegal frame sequence.
    Protocol,
    /// CSPRNG failure while generating a nonce or mask key.
    Crypto,
    /// Allocation failure.
    Mem,
    /// Unrecoverable; the connection must be torn down.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Warn => "warn",
            ErrorKind::Net => "net",
            ErrorKind::Tls => "tls",
            ErrorKind::Handshake => "handshake",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Mem => "mem",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out waiting for socket readiness")]
    Timeout,

    #[error("{0}")]
    Warn(String),

    #[error("network error: {0}")]
    Net(#[from] io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("csprng failure: {0}")]
    Crypto(String),

    #[error("allocation failed: {0}")]
    Mem(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout => ErrorKind::Timeout,
            Error::Warn(_) => ErrorKind::Warn,
            Error::Net(_) => ErrorKind::Net,
            Error::Tls(_) => ErrorKind::Tls,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::Mem(_) => ErrorKind::Mem,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn handshake<S: Into<String>>(msg: S) -> Self {
        Error::Handshake(msg.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Error::Crypto(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
