use thiserror::Error;

/// Everything that can abort the processing of one chat envelope.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The channel payload is not a well-formed protocol packet.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("unexpected packet type {0}, expected PUBLISH")]
    UnexpectedPacketType(u8),

    /// Valid packet, but the body is not a usable chat envelope.
    #[error("invalid envelope: {0}")]
    Payload(String),

    #[error("{service} returned an error (code {code}): {message}")]
    Upstream {
        service: &'static str,
        code: i64,
        message: String,
    },

    #[error("{service} returned no result")]
    NoResult { service: &'static str },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{program} failed: {detail}")]
    Conversion { program: String, detail: String },

    #[error("{service} answered with content type {content_type:?}")]
    UnexpectedContentType {
        service: &'static str,
        content_type: String,
    },
}

impl RelayError {
    /// Rejections are never worth redelivering: the same bytes fail the same way.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RelayError::Decode(_) | RelayError::UnexpectedPacketType(_) | RelayError::Payload(_)
        )
    }

    /// Maps an HTTP client failure. Timeouts count as the upstream's fault.
    pub fn http(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Upstream {
                service,
                code: -1,
                message: format!("request timed out: {}", err),
            }
        } else {
            RelayError::Transport(format!("{}: {}", service, err))
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}
