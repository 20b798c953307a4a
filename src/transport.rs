//! Transport layer (spec §4.1): a single connected stream, plain TCP or
//! TLS, non-blocking underneath with a poll-based readiness primitive and a
//! caller-facing synchronous-with-deadline API.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{setsockopt, sockopt};
use nix::sys::time::TimeVal;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig as RustlsClientConfig, ClientConnection, RootCertStore};

use crate::error::{Error, Result};

fn root_cert_store() -> Result<Arc<RootCertStore>> {
    static STORE: OnceLock<Arc<RootCertStore>> = OnceLock::new();
    if let Some(store) = STORE.get() {
        return Ok(store.clone());
    }
    let mut store = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().map_err(|e| Error::tls(e.to_string()))? {
        let _ = store.add(cert);
    }
    let store = Arc::new(store);
    Ok(STORE.get_or_init(|| store).clone())
}

fn tls_config() -> Result<Arc<RustlsClientConfig>> {
    Ok(Arc::new(
        RustlsClientConfig::builder()
            .with_root_certificates(root_cert_store()?)
            .with_no_client_auth(),
    ))
}

/// Owns the socket and (if present) the TLS session bound to it. A
/// `Transport` is never mixed: if TLS is present every read/write goes
/// through it, never the raw socket.
pub struct Transport {
    socket: TcpStream,
    tls: Option<ClientConnection>,
    timeout_ms: u64,
    closed: bool,
}

impl Transport {
    /// Resolve `host`, try each candidate address in order, connect, and
    /// optionally establish TLS (spec §4.1 `connect`). `deadline` bounds DNS
    /// resolution, TCP connect, and the TLS handshake combined — the caller
    /// (`Connection::connect`) carries the same deadline into the WebSocket
    /// upgrade handshake afterward, so `connect_timeout_ms` genuinely bounds
    /// all four phases together rather than resetting per phase.
    pub fn connect(host: &str, port: u16, tls: bool, deadline: Instant) -> Result<Self> {
        let timeout_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64;

        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .map_err(Error::Net)?
            .collect();
        if addrs.is_empty() {
            return Err(Error::Net(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {host}:{port}"),
            )));
        }

        let mut last_err = None;
        let mut connected = None;
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => {
                    log::debug!("connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        let socket = connected.ok_or_else(|| {
            Error::Net(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out")
            }))
        })?;

        apply_socket_timeout(&socket, timeout_ms)?;
        socket.set_nonblocking(true).map_err(Error::Net)?;

        let tls_session = if tls {
            let server_name = ServerName::try_from(host.to_owned())
                .map_err(|e| Error::tls(e.to_string()))?;
            let conn = ClientConnection::new(tls_config()?, server_name)
                .map_err(|e| Error::tls(e.to_string()))?;
            Some(conn)
        } else {
            None
        };

        let mut transport = Transport {
            socket,
            tls: tls_session,
            timeout_ms,
            closed: false,
        };

        if transport.tls.is_some() {
            transport.drive_tls_handshake(deadline)?;
        }

        Ok(transport)
    }

    fn wait_ready(&self, flags: PollFlags, deadline: Instant) -> Result<bool> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        let millis = remaining.as_millis().min(i32::MAX as u128) as i32;
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(self.socket.as_fd(), flags)];
        let n = poll(&mut fds, timeout).map_err(|errno| Error::Net(io::Error::from(errno)))?;
        Ok(n > 0)
    }

    fn drive_tls_handshake(&mut self, deadline: Instant) -> Result<()> {
        loop {
            let (is_handshaking, wants_write, wants_read) = {
                let conn = self.tls.as_ref().expect("tls session present");
                (conn.is_handshaking(), conn.wants_write(), conn.wants_read())
            };
            if !is_handshaking {
                return Ok(());
            }

            if wants_write {
                if !self.wait_ready(PollFlags::POLLOUT, deadline)? {
                    return Err(Error::Timeout);
                }
                let conn = self.tls.as_mut().expect("tls session present");
                match conn.write_tls(&mut &self.socket) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(Error::tls(e.to_string())),
                }
                continue;
            }

            if wants_read {
                if !self.wait_ready(PollFlags::POLLIN, deadline)? {
                    return Err(Error::Timeout);
                }
                let conn = self.tls.as_mut().expect("tls session present");
                match conn.read_tls(&mut &self.socket) {
                    Ok(0) => {
                        return Err(Error::tls("connection closed during tls handshake"));
                    }
                    Ok(_) => {
                        conn.process_new_packets()
                            .map_err(|e| Error::tls(e.to_string()))?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(Error::Net(e)),
                }
                continue;
            }

            // Neither: handshake is blocked on something this loop can't
            // drive further (shouldn't happen with rustls's state machine).
            return Err(Error::tls("tls handshake stalled"));
        }
    }

    /// Wait up to `timeout_ms` for readability, then read at most 1024 bytes
    /// into `out`. See `read_before` for the EOF/WouldBlock contract.
    pub fn read(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms);
        self.read_before(out, deadline)
    }

    /// Same as `read`, but bounded by a caller-supplied `deadline` instead of
    /// one derived from `self.timeout_ms` — lets the handshake thread a
    /// single overall deadline through its read loop (spec §4.2,
    /// `connect_timeout_ms` covering DNS/connect/TLS/upgrade together)
    /// instead of each call getting its own fresh `timeout_ms` window.
    ///
    /// Returns the number of bytes appended; `Ok(0)` means EOF (plain-TCP
    /// `read` returning 0, or the TLS session receiving `close_notify`) —
    /// never "ciphertext arrived but no full plaintext record decoded yet",
    /// which on the TLS path retries within the same deadline instead of
    /// being reported as EOF. `Err(Error::Timeout)` on deadline expiry (spec:
    /// non-fatal in steady-state, fatal during handshake — the caller
    /// decides).
    pub fn read_before(&mut self, out: &mut Vec<u8>, deadline: Instant) -> Result<usize> {
        let mut buf = [0u8; 1024];

        loop {
            if !self.wait_ready(PollFlags::POLLIN, deadline)? {
                return Err(Error::Timeout);
            }

            if let Some(conn) = self.tls.as_mut() {
                match conn.read_tls(&mut &self.socket) {
                    Ok(0) => return Ok(0),
                    Ok(_) => {}
                    // No ciphertext arrived this pass; wait for more.
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(Error::Net(e)),
                }
                conn.process_new_packets()
                    .map_err(|e| Error::tls(e.to_string()))?;
                match conn.reader().read(&mut buf) {
                    // Ciphertext landed but didn't complete a plaintext
                    // record yet (records routinely span TCP segments) —
                    // poll again rather than reporting EOF.
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Ok(0) => return Ok(0),
                    Ok(n) => {
                        out.extend_from_slice(&buf[..n]);
                        return Ok(n);
                    }
                    Err(e) => return Err(Error::Net(e)),
                }
            } else {
                match self.socket.read(&mut buf) {
                    Ok(n) => {
                        out.extend_from_slice(&buf[..n]);
                        return Ok(n);
                    }
                    // poll() said readable but the read raced and found
                    // nothing; not EOF, just try again within the deadline.
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(Error::Net(e)),
                }
            }
        }
    }

    /// Wait up to `timeout_ms` for writability, then write as much of
    /// `data` as the socket accepts in one pass (short writes are the
    /// caller's concern, per spec).
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms);
        self.write_before(data, deadline)
    }

    /// Same as `write`, bounded by a caller-supplied `deadline` instead of
    /// one derived from `self.timeout_ms` — lets a caller that retries on
    /// short writes (e.g. `Connection::send_frame`) share a single overall
    /// deadline across every retry instead of each call getting its own
    /// fresh `timeout_ms` window.
    pub fn write_before(&mut self, data: &[u8], deadline: Instant) -> Result<usize> {
        if !self.wait_ready(PollFlags::POLLOUT, deadline)? {
            return Err(Error::Timeout);
        }

        if let Some(conn) = self.tls.as_mut() {
            let n = conn.writer().write(data).map_err(Error::Net)?;
            loop {
                match conn.write_tls(&mut &self.socket) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(Error::Net(e)),
                }
            }
            Ok(n)
        } else {
            match self.socket.write(data) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(Error::Net(e)),
            }
        }
    }

    /// Orderly TLS shutdown (one retry if not yet finished), then close the
    /// socket. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(conn) = self.tls.as_mut() {
            conn.send_close_notify();
            for _ in 0..2 {
                match conn.write_tls(&mut &self.socket) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Change the read/write deadline used from now on. Takes milliseconds
    /// (same unit `Transport` stores internally) so sub-second values — a
    /// perfectly valid `io_timeout_ms` for a low-latency feed — survive
    /// intact instead of truncating to zero.
    pub fn set_timeout_ms(&mut self, timeout_ms: u64) -> Result<()> {
        self.timeout_ms = timeout_ms;
        apply_socket_timeout(&self.socket, self.timeout_ms)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn apply_socket_timeout(socket: &TcpStream, timeout_ms: u64) -> Result<()> {
    let tv = TimeVal::new(
        (timeout_ms / 1000) as i64,
        ((timeout_ms % 1000) * 1000) as i64,
    );
    setsockopt(socket, sockopt::ReceiveTimeout, &tv).map_err(|e| Error::Net(io::Error::from(e)))?;
    setsockopt(socket, sockopt::SendTimeout, &tv).map_err(|e| Error::Net(io::Error::from(e)))?;
    Ok(())
}
