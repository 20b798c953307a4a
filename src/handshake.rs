//! Client opening handshake (spec §4.2, §6): builds the upgrade request,
//! drives the transport until a complete HTTP response has been read, and
//! validates `Sec-WebSocket-Accept`.

use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::rand;
use crate::transport::Transport;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Abstraction over "something that can send the request and stream back
/// response bytes", so the handshake state machine can be driven by a real
/// `Transport` or, in tests, a canned byte source — mirroring the injected
/// handshake callback the design notes (§9) call for.
pub trait HandshakeIo {
    fn send_all(&mut self, data: &[u8]) -> Result<()>;
    /// Append any newly available bytes to `out`, returning how many were
    /// added. `Ok(0)` means "nothing yet, keep trying"; an `Err` is fatal.
    /// `deadline` is the single budget shared across the whole handshake
    /// (spec §4.2; SPEC_FULL §1.2 `connect_timeout_ms`) — implementors must
    /// not hand out a fresh window per call.
    fn read_more(&mut self, out: &mut Vec<u8>, deadline: Instant) -> Result<usize>;
}

impl HandshakeIo for Transport {
    fn send_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(data)?;
            data = &data[n..];
        }
        Ok(())
    }

    fn read_more(&mut self, out: &mut Vec<u8>, deadline: Instant) -> Result<usize> {
        // `Transport::read_before` returning 0 is ambiguous between "would
        // block, try again" and "peer closed" (spec §9 Open Question).
        // `perform`'s loop resolves the ambiguity itself: one zero read is
        // routine non-blocking noise, two in a row is treated as EOF.
        self.read_before(out, deadline)
    }
}

/// Compute the canonical client nonce → `Sec-WebSocket-Accept` value
/// (spec §6, testable: `accept("dGhlIHNhbXBsZSBub25jZQ==") ==
/// "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="`).
pub fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// `ws` → 80, `wss` → 443 — shared with `connection::connect`'s own default
/// port resolution so the two places a scheme implies a port can't drift
/// apart from each other.
pub(crate) fn default_port(scheme: &str) -> u16 {
    if scheme == "wss" {
        443
    } else {
        80
    }
}

fn build_request(host: &str, port: u16, scheme: &str, path: &str, origin: &str, key: &str) -> String {
    let host_header = if port == default_port(scheme) {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         Cache-Control: no-cache\r\n\
         Origin: {origin}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

fn find_header(headers: &[httparse::Header<'_>], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
}

/// Drive `io` through the handshake. On success returns (the accept key
/// used, any bytes read past the end of the response headers — frame data
/// the server packed into the same TCP segment). On any failure the caller
/// is responsible for clearing its buffer and closing the transport (spec
/// §4.2: "On any failure, clear the receive buffer and close the transport").
pub fn perform<IO: HandshakeIo>(
    io: &mut IO,
    host: &str,
    port: u16,
    scheme: &str,
    path: &str,
    origin: &str,
    max_response_len: usize,
    deadline: Instant,
) -> Result<Vec<u8>> {
    let nonce = rand::handshake_nonce()?;
    let key = BASE64.encode(nonce);
    perform_with_key(io, host, port, scheme, path, origin, &key, max_response_len, deadline)
}

/// Same as `perform` but with the client nonce supplied by the caller
/// instead of freshly generated — the seam tests drive directly so the
/// literal scenarios in spec §8 (fixed key, canned response) are exercised
/// without stubbing the CSPRNG.
///
/// `deadline` is the same budget `Connection::connect` started before
/// resolving/connecting — it bounds this read loop too, so a peer that
/// trickles one byte just ahead of each individual read can't keep the
/// handshake alive past `connect_timeout_ms` (spec §4.2; SPEC_FULL §1.2).
#[allow(clippy::too_many_arguments)]
pub fn perform_with_key<IO: HandshakeIo>(
    io: &mut IO,
    host: &str,
    port: u16,
    scheme: &str,
    path: &str,
    origin: &str,
    key: &str,
    max_response_len: usize,
    deadline: Instant,
) -> Result<Vec<u8>> {
    let request = build_request(host, port, scheme, path, origin, key);
    io.send_all(request.as_bytes())?;

    let mut buf = Vec::new();
    let mut prior_zero_read = false;
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(consumed)) => {
                let accept = find_header(response.headers, "sec-websocket-accept")
                    .ok_or_else(|| Error::handshake("missing Sec-WebSocket-Accept header"))?;
                let expected = compute_accept(key);
                if accept != expected {
                    return Err(Error::handshake(format!(
                        "Sec-WebSocket-Accept mismatch: expected {expected}, got {accept}"
                    )));
                }
                log::debug!("handshake accepted for {host}{path}");
                return Ok(buf[consumed..].to_vec());
            }
            Ok(httparse::Status::Partial) => {}
            Err(e) => return Err(Error::handshake(e.to_string())),
        }

        if buf.len() >= max_response_len {
            return Err(Error::handshake("handshake response exceeded size cap"));
        }

        match io.read_more(&mut buf, deadline) {
            Ok(0) => {
                if prior_zero_read {
                    return Err(Error::handshake("connection closed during handshake"));
                }
                prior_zero_read = true;
            }
            Ok(_) => prior_zero_read = false,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds a fixed response in chunks, ignoring whatever is written.
    struct StubServer {
        response: Vec<u8>,
        sent: usize,
        chunk: usize,
    }

    impl HandshakeIo for StubServer {
        fn send_all(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn read_more(&mut self, out: &mut Vec<u8>, _deadline: Instant) -> Result<usize> {
            let remaining = self.response.len() - self.sent;
            let n = remaining.min(self.chunk);
            out.extend_from_slice(&self.response[self.sent..self.sent + n]);
            self.sent += n;
            Ok(n)
        }
    }

    fn far_future_deadline() -> Instant {
        Instant::now() + std::time::Duration::from_secs(60)
    }

    #[test]
    fn canonical_accept_value() {
        assert_eq!(
            compute_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn handshake_success() {
        // Spec §8 scenario 1: fixed key, stub server response carrying the
        // matching accept value — drives the real `perform_with_key` path
        // end to end rather than just the header-parsing helper.
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let accept = compute_accept(key);
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\
             \r\n"
        );
        let mut io = StubServer {
            response: response.into_bytes(),
            sent: 0,
            chunk: 3,
        };

        let leftover = perform_with_key(
            &mut io,
            "example.com",
            80,
            "ws",
            "/",
            "http://example.com",
            key,
            16 * 1024,
            far_future_deadline(),
        )
        .expect("handshake should succeed with matching accept key");
        assert!(leftover.is_empty());
    }

    #[test]
    fn handshake_accept_mismatch_is_rejected() {
        let wrong = "not-the-right-value==";
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {wrong}\r\n\
             \r\n"
        );
        let mut io = StubServer {
            response: response.into_bytes(),
            sent: 0,
            chunk: 4096,
        };
        let result = perform(
            &mut io,
            "example.com",
            80,
            "ws",
            "/",
            "http://example.com",
            16 * 1024,
            far_future_deadline(),
        );
        assert!(matches!(result, Err(e) if e.kind() == crate::error::ErrorKind::Handshake));
    }

    #[test]
    fn missing_accept_header_is_rejected() {
        let response = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n".to_vec();
        let mut io = StubServer { response, sent: 0, chunk: 8 };
        let result = perform(
            &mut io,
            "example.com",
            80,
            "ws",
            "/",
            "http://example.com",
            16 * 1024,
            far_future_deadline(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn oversized_handshake_response_is_rejected() {
        // A server that never terminates its headers must not be allowed to
        // grow the buffer without bound (SPEC_FULL §1.2 max_handshake_response_len).
        let mut response = b"HTTP/1.1 101 Switching Protocols\r\nX-Pad: ".to_vec();
        response.extend(std::iter::repeat(b'a').take(64));
        let mut io = StubServer { response, sent: 0, chunk: 4096 };
        let result = perform(
            &mut io,
            "example.com",
            80,
            "ws",
            "/",
            "http://example.com",
            16,
            far_future_deadline(),
        );
        assert!(matches!(result, Err(e) if e.kind() == crate::error::ErrorKind::Handshake));
    }
}
