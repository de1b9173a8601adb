//! Error types and user-facing classification for SFTP client operations.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the SFTP client.
///
/// Variants map directly onto the error kinds a caller needs to branch on:
/// protocol-level failures are fatal to the session, `SftpStatus` carries a
/// server-reported status code back to the originating caller, and the rest
/// describe transport-layer and classification outcomes.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame, wrong SFTP version, unexpected reply kind, or a
    /// REALPATH reply with != 1 entry.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A STATUS packet with a non-OK code. The numeric code is preserved.
    #[error("sftp status {code}: {message}")]
    SftpStatus {
        /// Raw SFTP status code as defined by the protocol.
        code: u32,
        /// Server-supplied message, empty if none was sent.
        message: String,
    },

    /// A request's deadline elapsed before a reply arrived.
    #[error("operation timed out")]
    Timeout,

    /// The channel or transport closed while requests were pending.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The operation was aborted by an explicit cancellation or a disconnect.
    #[error("operation cancelled")]
    Cancelled,

    /// Authentication with the SSH server failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server denied access to the requested resource.
    #[error("permission denied: {0}")]
    Permission(String),

    /// A network-layer failure (DNS, connect, socket I/O below the channel).
    #[error("network error: {0}")]
    Network(String),

    /// The server returned a generic failure unrelated to permissions.
    #[error("server error: {0}")]
    Server(String),

    /// Local filesystem I/O failed.
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// The configured Transport implementation reported an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration was rejected (unknown option, out-of-range value).
    #[error("configuration error: {0}")]
    Config(String),

    /// `max_concurrent_ops` was exhausted and the configured
    /// `SaturationPolicy` is `FailFast`.
    #[error("operation rejected: client is at its concurrency limit")]
    Saturated,
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<russh_keys::Error> for Error {
    fn from(err: russh_keys::Error) -> Self {
        Error::Authentication(err.to_string())
    }
}

/// Broad category a caller can use to decide how to react to an error,
/// independent of the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Lower-layer networking problem (DNS, connect, socket I/O).
    Network,
    /// Credentials or signature were rejected.
    Authentication,
    /// The server denied the operation for the authenticated identity.
    Permission,
    /// The server itself reported a failure unrelated to permissions.
    Server,
    /// A deadline elapsed.
    Timeout,
    /// Local filesystem I/O failed.
    Filesystem,
    /// The wire protocol was violated by either peer.
    Protocol,
}

/// Remediation a caller's UI or retry loop might suggest to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestedAction {
    /// Retrying the same operation is likely to succeed.
    Retry,
    /// The caller's account lacks rights; check server-side permissions.
    CheckPermissions,
    /// The connection should be re-established before retrying.
    Reconnect,
    /// Check local network connectivity.
    CheckNetwork,
    /// The failure requires administrator intervention.
    ContactAdmin,
}

/// Derived, user-facing classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Broad failure category.
    pub category: Category,
    /// Whether a human user could plausibly act on this error directly.
    pub is_user_actionable: bool,
    /// Remediation suggested to the caller.
    pub suggested_action: SuggestedAction,
    /// Whether retrying the same operation is expected to help.
    pub retryable: bool,
}

impl Error {
    /// Classify this error for display or retry-policy purposes.
    ///
    /// Classification is derived from the error's variant and, for
    /// `SftpStatus`, from the carried status code. Timeouts are always
    /// retryable; authentication failures never are.
    #[must_use]
    pub fn classify(&self) -> Classification {
        use Category::{Authentication, Filesystem, Network, Permission, Protocol, Server, Timeout};
        use SuggestedAction::{CheckNetwork, CheckPermissions, ContactAdmin, Reconnect, Retry};

        match self {
            Error::Timeout => Classification {
                category: Timeout,
                is_user_actionable: false,
                suggested_action: Retry,
                retryable: true,
            },
            Error::ConnectionLost(_) => Classification {
                category: Network,
                is_user_actionable: false,
                suggested_action: Reconnect,
                retryable: true,
            },
            Error::Network(_) | Error::Transport(_) => Classification {
                category: Network,
                is_user_actionable: true,
                suggested_action: CheckNetwork,
                retryable: true,
            },
            Error::Authentication(_) => Classification {
                category: Authentication,
                is_user_actionable: true,
                suggested_action: CheckPermissions,
                retryable: false,
            },
            Error::Permission(_) => Classification {
                category: Permission,
                is_user_actionable: true,
                suggested_action: CheckPermissions,
                retryable: false,
            },
            Error::Server(_) => Classification {
                category: Server,
                is_user_actionable: false,
                suggested_action: ContactAdmin,
                retryable: true,
            },
            Error::Filesystem(_) => Classification {
                category: Filesystem,
                is_user_actionable: true,
                suggested_action: CheckPermissions,
                retryable: false,
            },
            Error::Protocol(_) => Classification {
                category: Protocol,
                is_user_actionable: false,
                suggested_action: ContactAdmin,
                retryable: false,
            },
            Error::Cancelled => Classification {
                category: Protocol,
                is_user_actionable: false,
                suggested_action: Retry,
                retryable: true,
            },
            Error::Config(_) => Classification {
                category: Protocol,
                is_user_actionable: true,
                suggested_action: ContactAdmin,
                retryable: false,
            },
            Error::Saturated => Classification {
                category: Server,
                is_user_actionable: false,
                suggested_action: Retry,
                retryable: true,
            },
            Error::SftpStatus { code, .. } => classify_status(*code),
        }
    }

    /// Build an error from a received SFTP STATUS code + message, mapping
    /// well-known codes onto the richer variants where that is more useful
    /// to callers than the generic [`Error::SftpStatus`].
    pub(crate) fn from_status(code: u32, message: String) -> Self {
        use crate::protocol::StatusCode;
        match code {
            c if c == StatusCode::PermissionDenied as u32 => Error::Permission(message),
            c if c == StatusCode::Failure as u32 => Error::Server(message),
            c if c == StatusCode::BadMessage as u32 => Error::Protocol(message),
            c if c == StatusCode::NoConnection as u32 || c == StatusCode::ConnectionLost as u32 => {
                Error::ConnectionLost(message)
            }
            _ => Error::SftpStatus { code, message },
        }
    }
}

fn classify_status(code: u32) -> Classification {
    use crate::protocol::StatusCode;
    use Category::{Network, Permission, Protocol, Server};
    use SuggestedAction::{CheckPermissions, ContactAdmin, Reconnect, Retry};

    if code == StatusCode::PermissionDenied as u32 {
        Classification {
            category: Permission,
            is_user_actionable: true,
            suggested_action: CheckPermissions,
            retryable: false,
        }
    } else if code == StatusCode::NoConnection as u32 || code == StatusCode::ConnectionLost as u32 {
        Classification {
            category: Network,
            is_user_actionable: false,
            suggested_action: Reconnect,
            retryable: true,
        }
    } else if code == StatusCode::BadMessage as u32 {
        Classification {
            category: Protocol,
            is_user_actionable: false,
            suggested_action: ContactAdmin,
            retryable: false,
        }
    } else {
        Classification {
            category: Server,
            is_user_actionable: false,
            suggested_action: Retry,
            retryable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_retryable() {
        assert!(Error::Timeout.classify().retryable);
    }

    #[test]
    fn authentication_is_not_retryable() {
        let c = Error::Authentication("bad key".into()).classify();
        assert!(!c.retryable);
        assert_eq!(c.category, Category::Authentication);
    }

    #[test]
    fn permission_status_maps_to_permission_category() {
        let err = Error::from_status(3, "denied".into());
        assert!(matches!(err, Error::Permission(_)));
        assert_eq!(err.classify().category, Category::Permission);
    }

    #[test]
    fn generic_failure_status_is_retryable_server_error() {
        let err = Error::from_status(4, "failure".into());
        let c = err.classify();
        assert_eq!(c.category, Category::Server);
        assert!(c.retryable);
    }
}
