//! Transport failure classification.
//!
//! Maps close codes, failure messages and, as a last resort, the connection
//! state into a small set of actionable categories. Classification is a pure
//! table lookup and never fails; anything unrecognized becomes `Unknown`.
//!
//! Extension-conflict detection is a hint only: local software that tampers
//! with the socket usually shows up as an abnormal closure or an
//! "intercepted" message, and nothing on the wire identifies it reliably.

use crate::connection::ConnectionState;
use crate::error::ClientError;
use std::fmt;

/// Failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NetworkUnavailable,
    PolicyBlocked,
    ServerError,
    Timeout,
    ExtensionConflict,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::NetworkUnavailable => "network_unavailable",
            ErrorCategory::PolicyBlocked => "policy_blocked",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ExtensionConflict => "extension_conflict",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A classified failure with a human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub detail: String,
}

impl ClassifiedError {
    fn new(category: ErrorCategory, detail: impl Into<String>) -> Self {
        Self {
            category,
            detail: detail.into(),
        }
    }

    /// Converts into the client error surfaced for a connection failure.
    pub fn into_error(self) -> ClientError {
        match self.category {
            ErrorCategory::NetworkUnavailable => ClientError::NetworkUnavailable(self.detail),
            ErrorCategory::PolicyBlocked => ClientError::PolicyBlocked(self.detail),
            ErrorCategory::ServerError => ClientError::ServerError(self.detail),
            ErrorCategory::Timeout => ClientError::ConnectTimeout,
            ErrorCategory::ExtensionConflict => ClientError::ExtensionConflict(self.detail),
            ErrorCategory::Unknown => ClientError::Unknown(self.detail),
        }
    }
}

impl From<ClassifiedError> for ClientError {
    fn from(classified: ClassifiedError) -> Self {
        classified.into_error()
    }
}

/// Raw signal describing how a transport failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// The transport closed, with the close code if one was received.
    Closed { code: Option<u16>, reason: String },
    /// An error was raised while opening or using the transport.
    Failure { message: String },
    /// No other signal is available; only the connection state is known.
    Readiness(ConnectionState),
}

/// Abnormal closure (no close frame received).
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Policy violation.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Internal server error.
pub const CLOSE_SERVER_ERROR: u16 = 1011;

const CLOSE_CODES: &[(u16, ErrorCategory, &str)] = &[
    (1000, ErrorCategory::Unknown, "connection closed normally by the server"),
    (1001, ErrorCategory::ServerError, "server is going away"),
    (1005, ErrorCategory::Unknown, "connection closed without a status code"),
    (
        CLOSE_ABNORMAL,
        ErrorCategory::NetworkUnavailable,
        "connection dropped without a close frame",
    ),
    (
        CLOSE_POLICY_VIOLATION,
        ErrorCategory::PolicyBlocked,
        "connection closed for a policy violation",
    ),
    (1009, ErrorCategory::ServerError, "message too large for the server"),
    (CLOSE_SERVER_ERROR, ErrorCategory::ServerError, "server hit an internal error"),
    (1012, ErrorCategory::ServerError, "server is restarting"),
    (1013, ErrorCategory::ServerError, "server is overloaded, try again later"),
    (1014, ErrorCategory::ServerError, "bad gateway in front of the server"),
    (1015, ErrorCategory::PolicyBlocked, "TLS handshake failed"),
];

// Checked in order; the first hint found in the lowercased text wins.
// Status codes only count in the transport's "HTTP error: <status>" form, so
// digits in ports or os error numbers do not match.
const MESSAGE_HINTS: &[(&str, ErrorCategory)] = &[
    ("timed out", ErrorCategory::Timeout),
    ("timeout", ErrorCategory::Timeout),
    ("extension", ErrorCategory::ExtensionConflict),
    ("intercept", ErrorCategory::ExtensionConflict),
    ("cross-origin", ErrorCategory::PolicyBlocked),
    ("cors", ErrorCategory::PolicyBlocked),
    ("blocked", ErrorCategory::PolicyBlocked),
    ("forbidden", ErrorCategory::PolicyBlocked),
    ("http error: 403", ErrorCategory::PolicyBlocked),
    ("proxy", ErrorCategory::PolicyBlocked),
    ("certificate", ErrorCategory::PolicyBlocked),
    ("http error: 5", ErrorCategory::ServerError),
    ("internal server error", ErrorCategory::ServerError),
    ("service unavailable", ErrorCategory::ServerError),
    ("refused", ErrorCategory::NetworkUnavailable),
    ("unreachable", ErrorCategory::NetworkUnavailable),
    ("dns", ErrorCategory::NetworkUnavailable),
    ("resolve", ErrorCategory::NetworkUnavailable),
    ("lookup", ErrorCategory::NetworkUnavailable),
    ("reset", ErrorCategory::NetworkUnavailable),
    ("broken pipe", ErrorCategory::NetworkUnavailable),
    ("network", ErrorCategory::NetworkUnavailable),
    ("connection", ErrorCategory::NetworkUnavailable),
];

/// Classifies a transport failure.
pub fn classify(signal: &TransportSignal) -> ClassifiedError {
    match signal {
        TransportSignal::Closed { code, reason } => classify_close(*code, reason),
        TransportSignal::Failure { message } => classify_message(message)
            .map(|category| ClassifiedError::new(category, message.clone()))
            .unwrap_or_else(|| ClassifiedError::new(ErrorCategory::Unknown, message.clone())),
        TransportSignal::Readiness(state) => classify_readiness(*state),
    }
}

fn classify_close(code: Option<u16>, reason: &str) -> ClassifiedError {
    let hinted = classify_message(reason);

    let Some(code) = code else {
        // Stream ended without any close frame: treat as an abnormal closure.
        return match hinted {
            Some(ErrorCategory::ExtensionConflict) => ClassifiedError::new(
                ErrorCategory::ExtensionConflict,
                with_reason("connection dropped", reason),
            ),
            _ => ClassifiedError::new(
                ErrorCategory::NetworkUnavailable,
                with_reason("connection dropped without a close frame", reason),
            ),
        };
    };

    match CLOSE_CODES.iter().find(|(c, _, _)| *c == code) {
        Some((CLOSE_ABNORMAL, _, text)) if hinted == Some(ErrorCategory::ExtensionConflict) => {
            ClassifiedError::new(ErrorCategory::ExtensionConflict, with_reason(text, reason))
        }
        Some((_, category, text)) => ClassifiedError::new(*category, with_reason(text, reason)),
        None => ClassifiedError::new(
            hinted.unwrap_or(ErrorCategory::Unknown),
            with_reason(&format!("connection closed with code {}", code), reason),
        ),
    }
}

fn classify_message(message: &str) -> Option<ErrorCategory> {
    let lowered = message.to_lowercase();
    MESSAGE_HINTS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, category)| *category)
}

fn classify_readiness(state: ConnectionState) -> ClassifiedError {
    match state {
        ConnectionState::Connecting | ConnectionState::Authenticating => ClassifiedError::new(
            ErrorCategory::Timeout,
            "connection is still being established",
        ),
        ConnectionState::Closing => {
            ClassifiedError::new(ErrorCategory::NetworkUnavailable, "connection is closing")
        }
        ConnectionState::Disconnected | ConnectionState::Failed => {
            ClassifiedError::new(ErrorCategory::NetworkUnavailable, "connection is closed")
        }
        ConnectionState::Ready => ClassifiedError::new(
            ErrorCategory::Unknown,
            "connection failed for an unknown reason",
        ),
    }
}

fn with_reason(text: &str, reason: &str) -> String {
    let reason = reason.trim();
    if reason.is_empty() {
        text.to_string()
    } else {
        format!("{} ({})", text, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(code: u16, reason: &str) -> TransportSignal {
        TransportSignal::Closed {
            code: Some(code),
            reason: reason.to_string(),
        }
    }

    fn failure(message: &str) -> TransportSignal {
        TransportSignal::Failure {
            message: message.to_string(),
        }
    }

    #[test]
    fn test_known_close_codes() {
        assert_eq!(classify(&closed(1006, "")).category, ErrorCategory::NetworkUnavailable);
        assert_eq!(classify(&closed(1008, "")).category, ErrorCategory::PolicyBlocked);
        assert_eq!(classify(&closed(1011, "")).category, ErrorCategory::ServerError);
        assert_eq!(classify(&closed(1013, "")).category, ErrorCategory::ServerError);
    }

    #[test]
    fn test_abnormal_closure_extension_hint() {
        let classified = classify(&closed(1006, "request intercepted by extension"));
        assert_eq!(classified.category, ErrorCategory::ExtensionConflict);
        assert!(classified.detail.contains("intercepted"));
    }

    #[test]
    fn test_close_without_code() {
        let signal = TransportSignal::Closed {
            code: None,
            reason: String::new(),
        };
        let classified = classify(&signal);
        assert_eq!(classified.category, ErrorCategory::NetworkUnavailable);
        assert_eq!(classified.detail, "connection dropped without a close frame");
    }

    #[test]
    fn test_unknown_close_code_uses_reason_hint() {
        let classified = classify(&closed(4003, "forbidden"));
        assert_eq!(classified.category, ErrorCategory::PolicyBlocked);
        assert!(classified.detail.contains("4003"));

        let classified = classify(&closed(4999, ""));
        assert_eq!(classified.category, ErrorCategory::Unknown);
    }

    #[test]
    fn test_failure_messages() {
        assert_eq!(
            classify(&failure("Connection refused (os error 111)")).category,
            ErrorCategory::NetworkUnavailable
        );
        assert_eq!(classify(&failure("operation timed out")).category, ErrorCategory::Timeout);
        assert_eq!(
            classify(&failure("HTTP error: 403 Forbidden")).category,
            ErrorCategory::PolicyBlocked
        );
        assert_eq!(
            classify(&failure("blocked by cross-origin policy")).category,
            ErrorCategory::PolicyBlocked
        );
        assert_eq!(
            classify(&failure("HTTP error: 503 Service Unavailable")).category,
            ErrorCategory::ServerError
        );
        assert_eq!(
            classify(&failure("socket intercepted")).category,
            ErrorCategory::ExtensionConflict
        );
    }

    #[test]
    fn test_status_digits_outside_http_errors() {
        assert_eq!(
            classify(&failure("IO error: connection to port 5000 failed")).category,
            ErrorCategory::NetworkUnavailable
        );
        assert_eq!(
            classify(&failure("unexpected os error 1500")).category,
            ErrorCategory::Unknown
        );
        assert_eq!(
            classify(&failure("session 4031 expired")).category,
            ErrorCategory::Unknown
        );
        assert_eq!(
            classify(&failure("HTTP error: 502 Bad Gateway")).category,
            ErrorCategory::ServerError
        );
    }

    #[test]
    fn test_unmatched_message_is_unknown() {
        let classified = classify(&failure("something odd"));
        assert_eq!(classified.category, ErrorCategory::Unknown);
        assert_eq!(classified.detail, "something odd");

        let classified = classify(&failure(""));
        assert_eq!(classified.category, ErrorCategory::Unknown);
    }

    #[test]
    fn test_readiness_fallback() {
        assert_eq!(
            classify(&TransportSignal::Readiness(ConnectionState::Connecting)).category,
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify(&TransportSignal::Readiness(ConnectionState::Closing)).category,
            ErrorCategory::NetworkUnavailable
        );
        assert_eq!(
            classify(&TransportSignal::Readiness(ConnectionState::Failed)).category,
            ErrorCategory::NetworkUnavailable
        );
        assert_eq!(
            classify(&TransportSignal::Readiness(ConnectionState::Ready)).category,
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn test_into_client_error() {
        let err: ClientError = classify(&closed(1008, "")).into();
        assert!(matches!(err, ClientError::PolicyBlocked(_)));

        let err: ClientError = classify(&failure("timed out")).into();
        assert_eq!(err, ClientError::ConnectTimeout);
    }
}
