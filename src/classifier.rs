use crate::types::{ManifoldError, ObservedError};

/// Retryability classification of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Node-specific problem: retry on a different target and cool the
    /// failing one. Examples: 401 (bad key), 402 (billing), 429 (rate
    /// limit), 5xx, network errors.
    Retryable,
    /// Request-level problem: every target would fail the same way, so
    /// return the error immediately without cooling anything.
    /// Examples: 400 (bad body), 413 (too large), 422 (unprocessable).
    NonRetryable,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::NonRetryable => "non_retryable",
        }
    }
}

/// Decides whether an upstream failure is node-specific (retryable on
/// another target) or request-level (will fail everywhere).
///
/// Priority:
///  1. Cancellation: never retryable (the client gave up).
///  2. Provider error with an explicit retryable flag: trust it; an
///     explicit `false` still falls through to status classification.
///  3. HTTP status code.
///  4. Message heuristics for network / overload keywords.
///  5. Default: retryable (prefer retry over silently dropping traffic).
pub fn classify(err: &ObservedError) -> ErrorClass {
    match &err.inner {
        ManifoldError::Cancelled => ErrorClass::NonRetryable,

        ManifoldError::Provider {
            status,
            message,
            retryable,
        } => {
            if *retryable == Some(true) {
                return ErrorClass::Retryable;
            }
            classify_http_status(*status, message)
        }

        ManifoldError::Network(e) => classify_by_message(&e.to_string()),
        ManifoldError::Io(e) => classify_by_message(&e.to_string()),

        _ => classify_by_message(&err.inner.to_string()),
    }
}

/// Maps an HTTP status code to an error class. A 400 alone is ambiguous:
/// some providers return it for overload, so the message is consulted.
fn classify_http_status(code: u16, message: &str) -> ErrorClass {
    match code {
        400 => {
            if is_overload_message(message) {
                ErrorClass::Retryable
            } else {
                ErrorClass::NonRetryable
            }
        }
        413 | 422 => ErrorClass::NonRetryable,
        401 | 402 | 403 | 404 | 429 => ErrorClass::Retryable,
        code if code >= 500 => ErrorClass::Retryable,
        0 => classify_by_message(message),
        code if (400..500).contains(&code) => ErrorClass::NonRetryable,
        _ => ErrorClass::Retryable,
    }
}

const NETWORK_KEYWORDS: &[&str] = &[
    "connection refused",
    "connection reset",
    "no such host",
    "i/o timeout",
    "tls handshake",
    "eof",
    "broken pipe",
    "dial tcp",
];

const OVERLOAD_KEYWORDS: &[&str] = &[
    "overloaded",
    "capacity",
    "too many requests",
    "rate limit",
    "resource exhausted",
    "server is busy",
    "temporarily unavailable",
    "service unavailable",
    "quota",
];

fn classify_by_message(message: &str) -> ErrorClass {
    let msg = message.to_lowercase();

    if NETWORK_KEYWORDS.iter().any(|kw| msg.contains(kw)) {
        return ErrorClass::Retryable;
    }
    if is_overload_message(&msg) {
        return ErrorClass::Retryable;
    }

    ErrorClass::Retryable
}

fn is_overload_message(message: &str) -> bool {
    let msg = message.to_lowercase();
    OVERLOAD_KEYWORDS.iter().any(|kw| msg.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_err(status: u16, message: &str, retryable: Option<bool>) -> ObservedError {
        ManifoldError::Provider {
            status,
            message: message.to_string(),
            retryable,
        }
        .into()
    }

    #[test]
    fn test_cancellation_never_retryable() {
        let err: ObservedError = ManifoldError::Cancelled.into();
        assert_eq!(classify(&err), ErrorClass::NonRetryable);
    }

    #[test]
    fn test_explicit_retryable_flag_honoured() {
        let err = provider_err(400, "bad request", Some(true));
        assert_eq!(classify(&err), ErrorClass::Retryable);
    }

    #[test]
    fn test_explicit_non_retryable_falls_through_to_status() {
        // Provider says non-retryable but the status is a 429, which is
        // node-specific: a different target may still have quota.
        let err = provider_err(429, "rate limited", Some(false));
        assert_eq!(classify(&err), ErrorClass::Retryable);
    }

    #[test]
    fn test_status_table() {
        for status in [401, 402, 403, 404, 429, 500, 502, 503, 529] {
            let err = provider_err(status, "boom", None);
            assert_eq!(classify(&err), ErrorClass::Retryable, "status {}", status);
        }
        for status in [400, 413, 422, 405, 409, 410] {
            let err = provider_err(status, "boom", None);
            assert_eq!(
                classify(&err),
                ErrorClass::NonRetryable,
                "status {}",
                status
            );
        }
    }

    #[test]
    fn test_400_with_overload_message_is_retryable() {
        let err = provider_err(400, "The model is overloaded, try again later", None);
        assert_eq!(classify(&err), ErrorClass::Retryable);

        let err = provider_err(400, "quota exceeded for project", None);
        assert_eq!(classify(&err), ErrorClass::Retryable);
    }

    #[test]
    fn test_no_status_uses_message_heuristics() {
        let err = provider_err(0, "dial tcp 1.2.3.4:443: connection refused", None);
        assert_eq!(classify(&err), ErrorClass::Retryable);

        let err = provider_err(0, "unexpected EOF while reading body", None);
        assert_eq!(classify(&err), ErrorClass::Retryable);
    }

    #[test]
    fn test_unknown_error_defaults_retryable() {
        let err: ObservedError = ManifoldError::internal("something odd").into();
        assert_eq!(classify(&err), ErrorClass::Retryable);
    }
}
