//! Connection engine (spec §4.4) and message assembler (spec §4.5).
//!
//! `Connection` owns the `Transport`, the receive buffer, and the FIFO of
//! non-control frames awaiting assembly into a `Message`. `ingress` is the
//! pure drainer that turns buffered bytes into dispatched frames; `dispatch`
//! is the only place control-frame semantics (PING/PONG/CLOSE) live.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BytesMut};
use url::Url;

use crate::config::{ClientConfig, TlsMode};
use crate::error::{Error, Result};
use crate::frame::{Decoded, Frame, Opcode};
use crate::handshake;
use crate::transport::Transport;

/// Connection lifecycle (spec §3 Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Connected,
    Closing,
}

/// An assembled application-level datum (spec §3 Message, §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Optional callback invoked once, just before the owning connection is
/// torn down by `disconnect` (spec §3: "optional user callbacks … disconnect
/// notifier").
pub type DisconnectCallback = Box<dyn FnMut()>;

/// Optional override for the opening handshake (spec §3: "optional user
/// callbacks (handshake override, …)"; design note §9: "a single injected
/// callback of shape `(Transport) -> Result<(), Error>`"). When set,
/// `connect` hands the freshly-connected `Transport` to this callback
/// instead of running the default RFC 6455 upgrade — the callback is
/// responsible for leaving the transport ready to exchange frames.
pub type HandshakeOverride = Box<dyn FnMut(&mut Transport) -> Result<()>>;

/// Owns a single client-side WebSocket connection (spec §3 Connection).
pub struct Connection {
    transport: Option<Transport>,
    recv_buf: BytesMut,
    frames: VecDeque<Frame>,
    handshake_key: Option<String>,
    state: State,
    config: ClientConfig,
    on_disconnect: Option<DisconnectCallback>,
    handshake_override: Option<HandshakeOverride>,
}

fn scheme_wants_tls(scheme: &str, mode: TlsMode) -> Result<bool> {
    match mode {
        TlsMode::Always => Ok(true),
        TlsMode::Never => Ok(false),
        TlsMode::FromScheme => match scheme {
            "wss" => Ok(true),
            "ws" => Ok(false),
            other => Err(Error::protocol(format!("unsupported scheme {other}"))),
        },
    }
}

/// The reply `dispatch` owes an incoming control frame, if any (spec §4.4:
/// PING → PONG echoing the payload, CLOSE → normal-closure CLOSE, PONG →
/// nothing). Pure and separate from I/O so the mapping is unit-testable
/// without a live transport.
fn control_reply(frame: &Frame) -> Option<Frame> {
    match frame.opcode {
        Opcode::Ping => Some(Frame::pong(frame.payload.clone())),
        Opcode::Close => Some(Frame::close_normal()),
        _ => None,
    }
}

impl Connection {
    /// A connection not yet connected (spec §3: "created in state CLOSED").
    pub fn new(config: ClientConfig) -> Self {
        Connection {
            transport: None,
            recv_buf: BytesMut::new(),
            frames: VecDeque::new(),
            handshake_key: None,
            state: State::Closed,
            config,
            on_disconnect: None,
            handshake_override: None,
        }
    }

    pub fn set_disconnect_callback(&mut self, cb: DisconnectCallback) {
        self.on_disconnect = Some(cb);
    }

    pub fn set_handshake_override(&mut self, cb: HandshakeOverride) {
        self.handshake_override = Some(cb);
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The base64-encoded client nonce used for the last handshake, if any
    /// (spec §3 Connection: "a randomly generated 16-byte base64-encoded
    /// handshake key"). `None` before `connect` or when a handshake
    /// override bypassed the default upgrade.
    pub fn handshake_key(&self) -> Option<&str> {
        self.handshake_key.as_deref()
    }

    /// Resolve `url`, establish Transport, and run the client opening
    /// handshake (spec §4.1 `connect` + §4.2). Transitions to CONNECTED on
    /// success; on any failure the buffer is cleared and the transport (if
    /// created) is closed, per §4.2.
    pub fn connect(&mut self, url: &Url) -> Result<()> {
        let scheme = url.scheme();
        let tls = scheme_wants_tls(scheme, self.config.tls)?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::protocol("url has no host"))?
            .to_owned();
        let port = url.port().unwrap_or_else(|| handshake::default_port(scheme));
        let path = {
            let p = url.path();
            let path = if p.is_empty() { "/" } else { p };
            match url.query() {
                Some(q) => format!("{path}?{q}"),
                None => path.to_string(),
            }
        };
        let origin = format!("{scheme}://{host}");

        log::debug!("connecting to {scheme}://{host}:{port}{path}");

        // One deadline for DNS resolution, TCP connect, TLS handshake, and
        // the WebSocket upgrade handshake combined (spec §4.2; SPEC_FULL
        // §1.2 `connect_timeout_ms`) — carried into both `Transport::connect`
        // and `handshake::perform_with_key` below rather than each phase
        // getting its own fresh window.
        let deadline = Instant::now() + Duration::from_millis(self.config.connect_timeout_ms);

        let mut transport = Transport::connect(&host, port, tls, deadline).map_err(|e| {
            log::warn!("transport connect failed: {e}");
            e
        })?;

        if let Some(override_fn) = self.handshake_override.as_mut() {
            return match override_fn(&mut transport) {
                Ok(()) => {
                    transport.set_timeout_ms(self.config.io_timeout_ms)?;
                    self.recv_buf.clear();
                    self.transport = Some(transport);
                    self.state = State::Connected;
                    log::debug!("handshake override completed, connection established");
                    Ok(())
                }
                Err(e) => {
                    log::warn!("handshake override failed: {e}");
                    transport.close();
                    self.recv_buf.clear();
                    Err(e)
                }
            };
        }

        let nonce = crate::rand::handshake_nonce()?;
        let key = BASE64.encode(nonce);

        match handshake::perform_with_key(
            &mut transport,
            &host,
            port,
            scheme,
            &path,
            &origin,
            &key,
            self.config.max_handshake_response_len,
            deadline,
        ) {
            Ok(leftover) => {
                transport.set_timeout_ms(self.config.io_timeout_ms)?;
                self.recv_buf.clear();
                self.recv_buf.extend_from_slice(&leftover);
                self.transport = Some(transport);
                self.handshake_key = Some(key);
                self.state = State::Connected;
                log::debug!("handshake complete, connection established");
                Ok(())
            }
            Err(e) => {
                log::warn!("handshake failed: {e}");
                transport.close();
                self.recv_buf.clear();
                Err(e)
            }
        }
    }

    fn transport_mut(&mut self) -> Result<&mut Transport> {
        self.transport
            .as_mut()
            .ok_or_else(|| Error::protocol("connection is not connected"))
    }

    /// Drain and parse as many complete frames as the buffer holds, each
    /// routed through `dispatch` (spec §4.4 `ingress`). Returns the total
    /// bytes consumed.
    fn ingress(&mut self) -> Result<usize> {
        let mut total = 0usize;
        loop {
            let decoded = match crate::frame::decode(&self.recv_buf[..], self.config.max_payload_len) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("frame decode error: {e}");
                    return Err(e);
                }
            };
            match decoded {
                Decoded::Incomplete => return Ok(total),
                Decoded::Complete { frame, consumed } => {
                    self.recv_buf.advance(consumed);
                    total += consumed;
                    self.dispatch(frame)?;
                }
            }
        }
    }

    /// Per-opcode control-frame state machine (spec §4.4 `dispatch`).
    /// Control-frame replies are best-effort: a failure writing a PONG or a
    /// reflected CLOSE does not fail the caller's current operation (spec
    /// §7 propagation policy).
    fn dispatch(&mut self, frame: Frame) -> Result<()> {
        if frame.opcode.is_data() {
            self.frames.push_back(frame);
            return Ok(());
        }

        match frame.opcode {
            Opcode::Close => {
                log::debug!("received close frame, entering CLOSING");
                self.state = State::Closing;
            }
            Opcode::Ping => {
                log::debug!("received ping, {} byte payload", frame.payload.len());
            }
            Opcode::Pong => {
                log::debug!("received pong, discarding");
            }
            Opcode::Other(code) => {
                log::warn!("discarding frame with unrecognized opcode 0x{code:x}");
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                unreachable!("data frames already returned above via is_data()")
            }
        }

        if let Some(reply) = control_reply(&frame) {
            if let Err(e) = self.send_frame(&reply) {
                log::warn!("best-effort control reply failed: {e}");
            }
        }
        Ok(())
    }

    /// Serialize `frame` and write it to the transport, looping on short
    /// writes until the whole frame has been sent or a fatal error occurs
    /// (spec §4.4 `send_frame`). All retries share one `io_timeout_ms`
    /// deadline rather than each `Transport::write` call getting its own
    /// fresh window, so a peer that never drains its receive window can't
    /// keep this call blocking for an unbounded multiple of the timeout.
    pub fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = crate::frame::encode_client_frame(frame)?;
        let deadline = Instant::now() + Duration::from_millis(self.config.io_timeout_ms);
        let transport = self.transport_mut()?;
        let mut remaining = &bytes[..];
        while !remaining.is_empty() {
            let n = transport.write_before(remaining, deadline)?;
            if n == 0 {
                continue;
            }
            remaining = &remaining[n..];
        }
        Ok(())
    }

    pub fn send_text(&mut self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send_frame(&Frame::text(true, data.into()))
    }

    pub fn send_binary(&mut self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send_frame(&Frame::binary(true, data.into()))
    }

    /// Blocking-with-deadline accessor returning the next raw (non-control)
    /// frame, assembled or not (spec §4.4 `receive_frame`).
    pub fn receive_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(Some(frame));
            }
            match self.read_some() {
                Ok(true) => self.ingress()?,
                Ok(false) => return Ok(None),
                Err(e) => return Err(e),
            };
        }
    }

    /// Blocking-with-deadline accessor returning the next assembled message
    /// (spec §4.4 `receive_message`, §4.5 assembler).
    pub fn receive_message(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(msg) = self.try_assemble()? {
                return Ok(Some(msg));
            }
            match self.read_some() {
                Ok(true) => self.ingress()?,
                Ok(false) => return Ok(None),
                Err(e) => return Err(e),
            };
        }
    }

    /// True if the queue holds at least one frame with `fin=true`; pulls the
    /// contiguous prefix ending there and assembles it.
    fn try_assemble(&mut self) -> Result<Option<Message>> {
        let fin_index = self.frames.iter().position(|f| f.fin);
        let Some(end) = fin_index else { return Ok(None) };

        let mut iter = self.frames.drain(0..=end);
        let first = iter.next().expect("fin_index implies at least one frame");
        let opcode = match first.opcode {
            Opcode::Text | Opcode::Binary => first.opcode,
            Opcode::Continuation => {
                return Err(Error::protocol(
                    "continuation frame with no opening data frame",
                ))
            }
            _ => unreachable!("control frames never enter the frame queue"),
        };

        let mut payload = first.payload;
        for frame in iter {
            payload.extend_from_slice(&frame.payload);
        }

        Ok(Some(Message { opcode, payload }))
    }

    /// One `Transport::read`, appended to the receive buffer. `Ok(true)` if
    /// bytes (possibly zero on a benign non-blocking pass) were read and the
    /// caller should re-run `ingress`; `Ok(false)` on EOF.
    fn read_some(&mut self) -> Result<bool> {
        let transport = self.transport_mut()?;
        let mut tmp = Vec::new();
        match transport.read(&mut tmp) {
            Ok(0) => Ok(false),
            Ok(_) => {
                self.recv_buf.extend_from_slice(&tmp);
                Ok(true)
            }
            Err(Error::Timeout) => Err(Error::Timeout),
            Err(e) => Err(e),
        }
    }

    /// Idempotent teardown (spec §4.4 `disconnect`): invokes the disconnect
    /// callback if connected, best-effort sends a normal-closure CLOSE,
    /// closes the transport, and frees all pending frames.
    pub fn disconnect(&mut self) {
        if self.state == State::Closed && self.transport.is_none() {
            return;
        }
        if self.state != State::Closed {
            if let Some(cb) = self.on_disconnect.as_mut() {
                cb();
            }
        }
        self.state = State::Closed;
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = {
                let bytes = crate::frame::encode_client_frame(&Frame::close_normal());
                bytes.and_then(|b| transport.write(&b).map(|_| ()))
            } {
                log::debug!("best-effort close send failed during disconnect: {e}");
            }
            transport.close();
        }
        self.frames.clear();
        self.recv_buf.clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let mut c = Connection::new(ClientConfig::default());
        c.state = State::Connected;
        c
    }

    fn push_wire(c: &mut Connection, bytes: &[u8]) {
        c.recv_buf.extend_from_slice(bytes);
    }

    #[test]
    fn ping_produces_matching_pong_and_is_not_enqueued() {
        // Spec §8 scenario 3: a server PING with payload "hello" yields
        // exactly one client PONG, fin=1, echoing the payload unmasked.
        let ping = Frame::new(true, Opcode::Ping, false, b"hello".to_vec());
        let reply = control_reply(&ping).expect("ping must produce a reply");
        assert_eq!(reply.opcode, Opcode::Pong);
        assert!(reply.fin);
        assert_eq!(reply.payload, b"hello");

        // dispatch with no live transport: the reply send fails and is
        // swallowed (best-effort), and the frame is never enqueued either way.
        let mut c = fresh();
        c.dispatch(ping).unwrap();
        assert!(c.frames.is_empty());
    }

    #[test]
    fn pong_produces_no_reply() {
        let pong = Frame::new(true, Opcode::Pong, false, b"x".to_vec());
        assert!(control_reply(&pong).is_none());
    }

    #[test]
    fn fragmented_text_assembles_in_order() {
        let mut c = fresh();
        c.frames.push_back(Frame::new(false, Opcode::Text, false, b"Hel".to_vec()));
        c.frames
            .push_back(Frame::new(false, Opcode::Continuation, false, b"lo, W".to_vec()));
        c.frames
            .push_back(Frame::new(true, Opcode::Continuation, false, b"orld".to_vec()));

        let msg = c.try_assemble().unwrap().unwrap();
        assert_eq!(msg.opcode, Opcode::Text);
        assert_eq!(msg.payload, b"Hello, World");
        assert!(c.frames.is_empty());
    }

    #[test]
    fn continuation_as_first_frame_is_protocol_error() {
        let mut c = fresh();
        c.frames
            .push_back(Frame::new(true, Opcode::Continuation, false, b"orphan".to_vec()));
        let err = c.try_assemble().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }

    #[test]
    fn close_frame_transitions_to_closing_and_replies_normal_closure() {
        let close = Frame::new(true, Opcode::Close, false, 1000u16.to_be_bytes().to_vec());
        let reply = control_reply(&close).expect("close must produce a reply");
        assert_eq!(reply.opcode, Opcode::Close);
        assert_eq!(reply.payload, 1000u16.to_be_bytes());

        // No transport present, so the reflected close send fails and is
        // swallowed; the state transition still happens.
        let mut c = fresh();
        c.dispatch(close).unwrap();
        assert_eq!(c.state, State::Closing);
    }

    #[test]
    fn ingress_drains_concatenated_frames_in_order() {
        let mut c = fresh();
        let f1 = Frame::text(true, b"one".to_vec());
        let f2 = Frame::binary(true, b"two".to_vec());
        let b1 = crate::frame::encode_client_frame(&f1).unwrap();
        let b2 = crate::frame::encode_client_frame(&f2).unwrap();
        let mut all = b1.clone();
        all.extend_from_slice(&b2);
        push_wire(&mut c, &all);

        let consumed = c.ingress().unwrap();
        assert_eq!(consumed, all.len());
        assert_eq!(c.frames.len(), 2);
        assert_eq!(c.frames[0].payload, b"one");
        assert_eq!(c.frames[1].payload, b"two");
        assert!(c.recv_buf.is_empty());
    }

    #[test]
    fn incremental_bytes_dispatch_only_on_final_byte() {
        let mut c = fresh();
        let f = Frame::binary(true, vec![0x42u8; 200]);
        let bytes = crate::frame::encode_client_frame(&f).unwrap();

        for (i, byte) in bytes.iter().enumerate() {
            push_wire(&mut c, std::slice::from_ref(byte));
            c.ingress().unwrap();
            if i + 1 < bytes.len() {
                assert!(c.frames.is_empty(), "dispatched early at byte {i}");
            }
        }
        assert_eq!(c.frames.len(), 1);
        assert!(c.recv_buf.is_empty());
    }
}
