use thiserror::Error;

/// Failure of a single chat call, classified so callers can react to it.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ChatError {
    pub kind: ChatErrorKind,
    pub message: String,
    /// HTTP status when the server answered with a non-success code.
    pub status: Option<u16>,
}

impl ChatError {
    pub fn new(kind: ChatErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::Validation, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::Transport, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::Decode, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ChatErrorKind::Cancelled, "request cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ChatErrorKind::Cancelled
    }

    /// 5xx answers; the model itself is failing rather than the request.
    pub fn is_server_error(&self) -> bool {
        matches!(self.status, Some(s) if s >= 500)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatErrorKind {
    /// Empty model id or prompt; nothing was sent.
    Validation,
    /// Non-success status, connection failure, or a body that broke off.
    Transport,
    /// A buffered response body that is not the expected JSON.
    Decode,
    /// The caller cancelled the call while it was in flight.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_5xx_transport_failures() {
        let err = ChatError::transport("Gemini API error: HTTP 503").with_status(503);
        assert_eq!(err.kind, ChatErrorKind::Transport);
        assert!(err.is_server_error());

        let err = ChatError::transport("Gemini API error: HTTP 404").with_status(404);
        assert!(!err.is_server_error());
        assert!(!ChatError::transport("connection refused").is_server_error());
    }

    #[test]
    fn display_is_the_message() {
        assert_eq!(ChatError::cancelled().to_string(), "request cancelled");
        assert!(ChatError::cancelled().is_cancelled());
        assert!(!ChatError::validation("prompt must not be empty").is_cancelled());
    }
}
