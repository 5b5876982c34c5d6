//! # Error Handling
//!
//! A single error enum covers every failure mode in the replication core:
//! the replication-protocol error codes (`connection failed`, `invalid
//! position`, `behind window`, `subscription error`, `internal`) and the
//! infrastructure failures that bubble up from SQLite, JSON row handling,
//! and wire decoding.
//!
//! ## Error Policy
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Fatal to `start()` | `ConnectionFailed`, `InvalidPosition`, `BehindWindow` | Propagated to the caller of `start()` |
//! | Fatal always | `Internal` | Invariant violation; investigate |
//! | Scoped | `Subscription` | Delivered to the subscription's `synced` future only |
//! | Recoverable | everything else | Logged at `warn`; retried on the next connectivity transition |

use thiserror::Error;

use crate::subscriptions::SubscriptionId;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in replication core operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Replication Error Codes
    // =========================================================================
    /// An invariant was violated. Always a programming error, never expected
    /// in normal operation.
    #[error("internal error: {0}")]
    Internal(String),

    /// The transport to the replication service could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server rejected the resume position the client offered.
    #[error("invalid replication position: {0}")]
    InvalidPosition(String),

    /// The server no longer retains the log segment needed to resume from the
    /// client's position. Recoverable by clearing local replication state and
    /// re-subscribing.
    #[error("client is behind the server's replication window")]
    BehindWindow,

    /// A shape subscription failed. Delivered to that subscription's `synced`
    /// future; the rest of the process keeps running.
    #[error("subscription error{}: {message}", fmt_sub_id(.subscription_id))]
    Subscription {
        /// The failed subscription, when the server identified one.
        subscription_id: Option<SubscriptionId>,
        /// Server- or client-side description of the failure.
        message: String,
    },

    /// The satellite process has been stopped; the request cannot be served.
    #[error("satellite process has been stopped")]
    Stopped,

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A row snapshot, tag set, or persisted meta value failed to parse.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A wire frame failed to decode.
    #[error("protocol decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is unusable (missing auth token, bad url, ...).
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// True for the error codes that the connect-and-start-replication path
    /// must propagate to the caller of `start()`. Every other replication
    /// error is logged and retried on the next connectivity transition.
    pub fn is_fatal_for_start(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed(_) | Error::InvalidPosition(_) | Error::BehindWindow
        )
    }
}

fn fmt_sub_id(id: &Option<SubscriptionId>) -> String {
    match id {
        Some(id) => format!(" on {id}"),
        None => String::new(),
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages appear in logs and `synced` futures; keep them readable.
    #[test]
    fn test_error_display() {
        let internal = Error::Internal("snapshot re-entered".to_string());
        assert_eq!(internal.to_string(), "internal error: snapshot re-entered");

        let behind = Error::BehindWindow;
        assert_eq!(
            behind.to_string(),
            "client is behind the server's replication window"
        );

        let sub = Error::Subscription {
            subscription_id: Some(SubscriptionId::from("sub-1")),
            message: "shape rejected".to_string(),
        };
        assert_eq!(sub.to_string(), "subscription error on sub-1: shape rejected");

        let sub_anon = Error::Subscription {
            subscription_id: None,
            message: "shape rejected".to_string(),
        };
        assert_eq!(sub_anon.to_string(), "subscription error: shape rejected");
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }

    #[test]
    fn test_fatal_for_start_classification() {
        assert!(Error::ConnectionFailed("refused".into()).is_fatal_for_start());
        assert!(Error::InvalidPosition("stale lsn".into()).is_fatal_for_start());
        assert!(Error::BehindWindow.is_fatal_for_start());
        assert!(!Error::Internal("x".into()).is_fatal_for_start());
        assert!(!Error::Stopped.is_fatal_for_start());
    }
}
