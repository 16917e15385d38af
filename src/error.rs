//! Error hierarchy for the capture/diff/broadcast pipeline.
//!
//! Mirrors the error-kind catalogue in the design doc's error handling section:
//! each variant maps to one named failure kind and its documented recovery
//! policy. Transient per-frame failures (decode/encode/command) are caught at
//! the call site and logged rather than propagated — `CoreError` exists for
//! the failures that a caller genuinely needs to branch on.
//!
//! Two catalogued kinds are deliberately absent: client-send failure is
//! modeled structurally via `ClientConn::send_binary`'s `bool` return rather
//! than a propagated error (the broadcaster never needs to branch on *why* a
//! send failed, only that it did), and the two re-entrance kinds are internal
//! control-flow branches, never surfaced to a caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The browser backend is not ready to accept commands (startup race or
    /// a dead underlying connection). `ensure_device` fails fast rather than
    /// attempting to build a session against it.
    #[error("browser not ready")]
    BrowserNotReady,

    /// A browser control command failed (transient at ACK/stop paths,
    /// terminal at create/attach paths).
    #[error("browser command failed: {0}")]
    CommandFailed(String),

    /// Raster decode of an encoded frame failed.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// Tile or full-frame JPEG encode failed.
    #[error("encode failed: {0}")]
    EncodeFailed(String),

    /// A `DeviceConfig` failed validation before a session could be built.
    #[error("invalid device config: {0}")]
    InvalidConfig(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
