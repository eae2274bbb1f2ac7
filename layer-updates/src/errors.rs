//! Error types for layer-updates.
//!
//! Only a failed difference fetch (or a failing sequence store) can abort a
//! recovery cycle.  Unknown update variants and stale deliveries are not
//! errors at all: they are routed to the default dispatch slot and reported
//! as [`crate::Ingested::Stale`] respectively.

use std::{fmt, io, time::Duration};

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// The server refused a difference request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    /// Status code of the refusal (`400`, `420`, …).
    pub code:    i32,
    /// Error message as sent by the server, e.g. `PERSISTENT_TIMESTAMP_OUTDATED`.
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// The cursor sent with the request is no longer accepted.  Retrying
    /// is pointless until the stream is resynced with
    /// [`crate::UpdatesHandler::sync_state`].
    pub fn is_cursor_rejected(&self) -> bool {
        self.message.starts_with("PERSISTENT_TIMESTAMP")
    }

    /// How long the server asked to back off (`FLOOD_WAIT_<seconds>`).
    pub fn retry_after(&self) -> Option<Duration> {
        let secs = self.message.strip_prefix("FLOOD_WAIT_")?.parse().ok()?;
        Some(Duration::from_secs(secs))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server refused ({}): {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

// ─── TransportError ───────────────────────────────────────────────────────────

/// The error a [`crate::DifferenceTransport`] reports when a fetch fails.
#[derive(Debug)]
pub enum TransportError {
    /// The server rejected the difference request.
    Rpc(RpcError),
    /// Network / I/O failure.
    Io(io::Error),
    /// The response could not be decoded.
    Deserialize(String),
    /// The request was dropped (e.g. the sender task shut down).
    Dropped,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)         => write!(f, "{e}"),
            Self::Io(e)          => write!(f, "I/O error: {e}"),
            Self::Deserialize(s) => write!(f, "deserialize error: {s}"),
            Self::Dropped        => write!(f, "request dropped"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(e) => Some(e),
            Self::Io(e)  => Some(e),
            _            => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<RpcError> for TransportError {
    fn from(e: RpcError) -> Self { Self::Rpc(e) }
}

// ─── RecoveryError ────────────────────────────────────────────────────────────

/// Why a recovery cycle (or the live path that triggered it) was aborted.
///
/// Whatever the variant, the stream's cursor is left exactly as it was
/// before the cycle started: slices fetched before the failure are
/// discarded, not partially committed.
#[derive(Debug)]
pub enum RecoveryError {
    /// The difference fetch failed.
    Transport(TransportError),
    /// The difference fetch did not finish within [`crate::Config::fetch_timeout`].
    Timeout(Duration),
    /// The sequence store could not be read or written.
    Store(io::Error),
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "difference fetch failed: {e}"),
            Self::Timeout(d)   => write!(f, "difference fetch timed out after {d:?}"),
            Self::Store(e)     => write!(f, "sequence store error: {e}"),
        }
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Store(e)     => Some(e),
            Self::Timeout(_)   => None,
        }
    }
}

impl From<TransportError> for RecoveryError {
    fn from(e: TransportError) -> Self { Self::Transport(e) }
}

impl From<io::Error> for RecoveryError {
    fn from(e: io::Error) -> Self { Self::Store(e) }
}

impl RecoveryError {
    /// `true` if the fetch itself failed (transport error or timeout), i.e.
    /// the caller may simply try again later.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// The server's refusal, if that is what ended the cycle.
    pub fn rpc(&self) -> Option<&RpcError> {
        match self {
            Self::Transport(TransportError::Rpc(e)) => Some(e),
            _                                       => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_wait_gives_backoff() {
        assert_eq!(RpcError::new(420, "FLOOD_WAIT_30").retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(RpcError::new(420, "FLOOD_WAIT_").retry_after(), None);
        assert_eq!(RpcError::new(400, "CHANNEL_INVALID").retry_after(), None);
    }

    #[test]
    fn outdated_cursor_is_recognised() {
        assert!(RpcError::new(400, "PERSISTENT_TIMESTAMP_OUTDATED").is_cursor_rejected());
        assert!(RpcError::new(400, "PERSISTENT_TIMESTAMP_INVALID").is_cursor_rejected());
        assert!(!RpcError::new(400, "CHANNEL_INVALID").is_cursor_rejected());
        assert_eq!(
            RpcError::new(400, "CHANNEL_INVALID").to_string(),
            "server refused (400): CHANNEL_INVALID"
        );
    }

    #[test]
    fn recovery_error_classification() {
        let t: RecoveryError = TransportError::Dropped.into();
        assert!(t.is_transport_failure());
        assert!(t.rpc().is_none());
        assert!(RecoveryError::Timeout(Duration::from_secs(1)).is_transport_failure());
        let s: RecoveryError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert!(!s.is_transport_failure());

        let rpc: RecoveryError = TransportError::from(RpcError::new(400, "CHANNEL_INVALID")).into();
        assert_eq!(rpc.rpc().map(|e| e.message.as_str()), Some("CHANNEL_INVALID"));
    }
}
