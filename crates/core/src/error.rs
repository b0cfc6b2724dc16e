//! Caller-visible error taxonomy for the session client and its collaborators.
//!
//! Transport-level failures (socket read/write errors, abnormal close) never
//! appear here: the session client converts them into reconnection attempts
//! and fails in-flight work with [`Error::Disconnected`].

/// Errors surfaced to callers of the session client and the speech service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The server sent a payload that does not match the expected shape.
    #[error("invalid response from server: {0}")]
    InvalidResponse(String),
    /// A plain HTTP collaborator call returned a non-success status.
    #[error("API call failed with status {0}")]
    Api(u16),
    /// The operation was attempted, or aborted, outside the Connected state.
    #[error("not connected to the gateway")]
    Disconnected,
    /// A request or chat-turn deadline elapsed without a result.
    #[error("operation timed out")]
    Timeout,
    /// The gateway reported a logical failure inside a correlated response.
    #[error("gateway error: {0}")]
    Gateway(String),
    /// A chat turn was started while another one is still streaming.
    #[error("a chat turn is already in progress")]
    TurnActive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", Error::InvalidResponse("missing field".into())),
            "invalid response from server: missing field"
        );
        assert_eq!(format!("{}", Error::Api(503)), "API call failed with status 503");
        assert_eq!(format!("{}", Error::Disconnected), "not connected to the gateway");
        assert_eq!(format!("{}", Error::Timeout), "operation timed out");
        assert_eq!(
            format!("{}", Error::Gateway("rate limited".into())),
            "gateway error: rate limited"
        );
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(Error::Api(404), Error::Api(404));
        assert_ne!(Error::Api(404), Error::Api(500));
        assert_ne!(Error::Timeout, Error::Disconnected);
    }
}
