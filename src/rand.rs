//! CSPRNG access (spec §9: the handshake nonce and the per-frame mask key
//! are the two consumers; both must come from a cryptographically strong
//! source, and a failure there is `ErrorKind::Crypto`, not a silent fallback).

use crate::error::{Error, Result};

/// 16 random bytes for the `Sec-WebSocket-Key` nonce.
pub fn handshake_nonce() -> Result<[u8; 16]> {
    let mut buf = [0u8; 16];
    getrandom::fill(&mut buf).map_err(|e| Error::crypto(e.to_string()))?;
    Ok(buf)
}

/// 4 random bytes for a client-to-server frame's masking key.
pub fn mask_key() -> Result<[u8; 4]> {
    let mut buf = [0u8; 4];
    getrandom::fill(&mut buf).map_err(|e| Error::crypto(e.to_string()))?;
    Ok(buf)
}
