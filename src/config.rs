//! Connection configuration (SPEC_FULL §1.2).
//!
//! The distilled spec leaves several knobs as bare parameters or "implementer
//! chooses" policy caps. `ClientConfig` collects them in one place instead of
//! scattering defaults across call sites.

/// How a connection should establish (or skip) TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Derive from the URL scheme: `wss` → TLS, `ws` → plain TCP.
    #[default]
    FromScheme,
    /// Always establish TLS regardless of scheme.
    Always,
    /// Never establish TLS regardless of scheme.
    Never,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for DNS resolution, TCP connect, TLS handshake, and the
    /// WebSocket upgrade handshake, combined.
    pub connect_timeout_ms: u64,
    /// Deadline applied to each steady-state `read`/`write` once connected.
    pub io_timeout_ms: u64,
    /// Reject a declared frame payload length larger than this before
    /// allocating (spec §4.3 edge cases, §9 Open Questions).
    pub max_payload_len: u64,
    /// Cap on bytes buffered while waiting for the handshake response's
    /// headers to complete.
    pub max_handshake_response_len: usize,
    pub tls: TlsMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout_ms: 10_000,
            io_timeout_ms: 30_000,
            max_payload_len: 64 * 1024 * 1024,
            max_handshake_response_len: 16 * 1024,
            tls: TlsMode::FromScheme,
        }
    }
}
